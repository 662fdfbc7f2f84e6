//! Wrapper types for the subset of cell kinds the circuit core cares about.
//!
//! Actual cell wire encoding/decoding is out of scope for this crate (see the
//! `Cell codec` collaborator in the module docs); what lives here is just
//! enough of a typed model to let the circuit logic route, onion-wrap and
//! dispatch cells without re-parsing raw bytes at every hop.

use std::fmt;

/// The kind of a cell or of an inner relay message, used as the dispatch key
/// in [`crate::handler::CellHandlerManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CellKind {
    /// `CREATE2`: client -> first hop, opens a circuit.
    Create2,
    /// `CREATED2`: reply to `CREATE2`.
    Created2,
    /// `DESTROY`: tear down a circuit.
    Destroy,
    /// `RELAY_EARLY`: outer wrapper used for the first few relay cells of a
    /// circuit (carries an extend request).
    RelayEarly,
    /// `RELAY`: outer wrapper for all onion-encrypted traffic once a circuit
    /// no longer needs `RELAY_EARLY` (tor-spec limits how many
    /// `RELAY_EARLY` cells a circuit may send). The true relay command
    /// travels inside the decrypted payload, not in this outer kind; see
    /// [`RelayedTorCell::kind`].
    Relay,
    /// `RELAY_EXTEND2`: ask a hop to extend the circuit one more hop.
    RelayExtend2,
    /// `RELAY_EXTENDED2`: reply to `RELAY_EXTEND2`.
    RelayExtended2,
    /// `RELAY_TRUNCATED`: a hop refused or could not complete an extend.
    RelayTruncated,
    /// `RELAY_END`: close one stream.
    RelayEnd,
    /// `RELAY_DATA`: stream payload.
    RelayData,
    /// `RELAY_SENDME`: flow-control acknowledgement.
    RelaySendme,
    /// `RELAY_CONNECTED`: reply to a stream open request.
    RelayConnected,
    /// `RELAY_ESTABLISH_RENDEZVOUS`: ask a relay to act as rendezvous point.
    RelayEstablishRendezvous,
    /// `RELAY_RENDEZVOUS_ESTABLISHED`: reply to the above.
    RelayRendezvousEstablished,
    /// `RELAY_INTRODUCE1`: ask an introduction point to forward a rendezvous
    /// request to a hidden service.
    RelayIntroduce1,
    /// `RELAY_INTRODUCE_ACK`: reply to `RELAY_INTRODUCE1`.
    RelayIntroduceAck,
}

impl CellKind {
    /// The one-byte tag this relay command is packed as inside an
    /// onion-encrypted cell body. `None` for the three non-relay kinds,
    /// which never travel inside a packed relay payload.
    fn relay_command_tag(self) -> Option<u8> {
        use CellKind::*;
        Some(match self {
            RelayExtend2 => 1,
            RelayExtended2 => 2,
            RelayTruncated => 3,
            RelayEnd => 4,
            RelayData => 5,
            RelaySendme => 6,
            RelayConnected => 7,
            RelayEstablishRendezvous => 8,
            RelayRendezvousEstablished => 9,
            RelayIntroduce1 => 10,
            RelayIntroduceAck => 11,
            Create2 | Created2 | Destroy | RelayEarly | Relay => return None,
        })
    }

    /// Reverse of [`Self::relay_command_tag`].
    fn from_relay_command_tag(tag: u8) -> Option<Self> {
        use CellKind::*;
        Some(match tag {
            1 => RelayExtend2,
            2 => RelayExtended2,
            3 => RelayTruncated,
            4 => RelayEnd,
            5 => RelayData,
            6 => RelaySendme,
            7 => RelayConnected,
            8 => RelayEstablishRendezvous,
            9 => RelayRendezvousEstablished,
            10 => RelayIntroduce1,
            11 => RelayIntroduceAck,
            _ => return None,
        })
    }
}

impl fmt::Display for CellKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use CellKind::*;
        let s = match self {
            Create2 => "CREATE2",
            Created2 => "CREATED2",
            Destroy => "DESTROY",
            RelayEarly => "RELAY_EARLY",
            Relay => "RELAY",
            RelayExtend2 => "RELAY_EXTEND2",
            RelayExtended2 => "RELAY_EXTENDED2",
            RelayTruncated => "RELAY_TRUNCATED",
            RelayEnd => "RELAY_END",
            RelayData => "RELAY_DATA",
            RelaySendme => "RELAY_SENDME",
            RelayConnected => "RELAY_CONNECTED",
            RelayEstablishRendezvous => "RELAY_ESTABLISH_RENDEZVOUS",
            RelayRendezvousEstablished => "RELAY_RENDEZVOUS_ESTABLISHED",
            RelayIntroduce1 => "RELAY_INTRODUCE1",
            RelayIntroduceAck => "RELAY_INTRODUCE_ACK",
        };
        f.write_str(s)
    }
}

/// A reason code carried by a `DESTROY` or `RELAY_TRUNCATED` cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum TeardownReason {
    /// No reason given.
    None,
    /// The circuit was torn down because its job is done.
    Finished,
    /// The relay is low on resources.
    ResourceLimit,
    /// Some other reason, identified by the protocol's numeric code.
    Other(u8),
}

impl fmt::Display for TeardownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeardownReason::None => f.write_str("NONE"),
            TeardownReason::Finished => f.write_str("FINISHED"),
            TeardownReason::ResourceLimit => f.write_str("RESOURCELIMIT"),
            TeardownReason::Other(n) => write!(f, "UNKNOWN({n})"),
        }
    }
}

/// A single Tor cell as exchanged with the guard link.
///
/// The outer cell for `CREATE2`/`CREATED2`/`DESTROY` and the relay-layer
/// envelope (`RELAY_EARLY`, plain `RELAY`) are represented by the same type:
/// the payload is onion-encrypted or not according to `kind`, and the
/// relay-specific fields are simply unused/zero for non-relay kinds.
#[derive(Debug, Clone)]
pub struct TorCell {
    /// What kind of cell this is.
    pub kind: CellKind,
    /// The circuit this cell belongs to.
    pub circuit_id: u32,
    /// The raw or onion-encrypted payload of this cell, mutated in place by
    /// [`crate::node::CircuitNode::encrypt_forward`]/
    /// [`crate::node::CircuitNode::decrypt_backward`].
    pub payload: Vec<u8>,
}

impl TorCell {
    /// Build a new cell of the given kind, addressed to `circuit_id`.
    pub fn new(kind: CellKind, circuit_id: u32, payload: Vec<u8>) -> Self {
        TorCell {
            kind,
            circuit_id,
            payload,
        }
    }

    /// True for the cell kinds that travel onion-encrypted once a circuit is
    /// connected (everything except the bare `CREATE2`/`CREATED2`/`DESTROY`
    /// handshake cells).
    pub fn is_relay(&self) -> bool {
        !matches!(
            self.kind,
            CellKind::Create2 | CellKind::Created2 | CellKind::Destroy
        )
    }
}

/// A decoded relay message living inside the payload of a relay `TorCell`.
///
/// This is the `RelayedTorCell` collaborator type from the module contract:
/// it carries the fields the circuit core needs to route and flow-control,
/// without needing to know how to serialize the specific relay command.
#[derive(Debug, Clone)]
pub struct RelayedTorCell {
    /// The inner relay command.
    pub kind: CellKind,
    /// Whether this cell arrived (or will be sent) onion-encrypted.
    pub is_encrypted: bool,
    /// The stream this relay cell belongs to, or 0 for circuit-level
    /// messages such as a circuit `RELAY_SENDME`.
    pub stream_id: u16,
    /// The circuit this relay cell belongs to.
    pub circuit_id: u32,
    /// The relay command's own payload (e.g. the data bytes of a
    /// `RELAY_DATA`, or the reason code of a `RELAY_END`/`RELAY_TRUNCATED`).
    pub payload: Vec<u8>,
}

impl RelayedTorCell {
    /// Build a new relay-level cell.
    pub fn new(kind: CellKind, circuit_id: u32, stream_id: u16, payload: Vec<u8>) -> Self {
        RelayedTorCell {
            kind,
            is_encrypted: false,
            stream_id,
            circuit_id,
            payload,
        }
    }

    /// Pack this relay message's command, stream id and payload into the
    /// bytes that travel, onion-encrypted, as an outer [`TorCell`]'s payload
    /// (tor-spec 5.5's relay header, minus the length field this crate
    /// doesn't need since `Vec<u8>` already carries its own length).
    ///
    /// # Panics
    ///
    /// Panics if `self.kind` is one of the three non-relay kinds
    /// (`Create2`/`Created2`/`Destroy`), which can never be packed as a
    /// relay command; constructing a `RelayedTorCell` with one of those
    /// kinds is a programming error in this crate, not a runtime condition.
    pub fn pack(&self) -> Vec<u8> {
        let tag = self
            .kind
            .relay_command_tag()
            .expect("RelayedTorCell::kind must be a relay command");
        let mut out = Vec::with_capacity(3 + self.payload.len());
        out.push(tag);
        out.extend_from_slice(&self.stream_id.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Reverse of [`Self::pack`], applied to a `TorCell` whose onion layers
    /// have all been peeled. Returns `None` if `bytes` is too short to carry
    /// a command tag and stream id, or if the tag is unrecognised; callers
    /// treat either as a protocol violation, not a panic.
    pub fn unpack(circuit_id: u32, bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 3 {
            return None;
        }
        let kind = CellKind::from_relay_command_tag(bytes[0])?;
        let stream_id = u16::from_be_bytes([bytes[1], bytes[2]]);
        let payload = bytes[3..].to_vec();
        Some(RelayedTorCell {
            kind,
            is_encrypted: false,
            stream_id,
            circuit_id,
            payload,
        })
    }

    /// Parse the teardown reason out of a `RELAY_TRUNCATED` or `RELAY_END`
    /// cell's payload. The wire format puts a single reason byte first;
    /// unknown/missing bytes map to [`TeardownReason::None`].
    pub fn teardown_reason(&self) -> TeardownReason {
        match self.payload.first() {
            None => TeardownReason::None,
            Some(0) => TeardownReason::None,
            Some(1) => TeardownReason::Finished,
            Some(4) => TeardownReason::ResourceLimit,
            Some(n) => TeardownReason::Other(*n),
        }
    }
}
