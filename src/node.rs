//! Per-hop circuit state: router identity, handshake, crypto state and
//! flow-control window.

use crate::cell::TorCell;
use crate::crypto::{CryptoState, HandshakeType, KeyAgreement};
use crate::error::{Error, Result};

/// Flow-control window starting value, per tor-spec: a circuit may have up
/// to 1000 outstanding `RELAY_DATA` cells per hop before it must stall.
pub const WINDOW_START: i32 = 1000;

/// The amount a `RELAY_SENDME` replenishes a window by.
pub const WINDOW_INCREMENT: i32 = 100;

/// The deliver-window threshold at which we emit our own `RELAY_SENDME`:
/// after 100 cells (1000 - 900) since the last one.
pub const WINDOW_SENDME_THRESHOLD: i32 = 900;

/// A minimal description of a relay, as selected by the consensus
/// collaborator (router selection itself is out of scope for this crate).
#[derive(Debug, Clone)]
pub struct RouterDescriptor {
    /// The relay's address.
    pub address: std::net::IpAddr,
    /// The relay's OR port.
    pub or_port: u16,
    /// The relay's public onion key, used to seed the handshake.
    pub onion_key: Vec<u8>,
    /// The relay's long-term identity fingerprint.
    pub identity: [u8; 20],
    /// The relay's nickname, for logging only.
    pub nickname: String,
}

/// Per-hop flow-control window: how many more `RELAY_DATA` cells we may send
/// to this hop (`package`), and how many more we may receive from it
/// (`deliver`) before a `RELAY_SENDME` is required.
#[derive(Debug, Clone, Copy)]
pub struct Window {
    /// Cells we may still send outward through this hop.
    pub package: i32,
    /// Cells we may still accept inbound from this hop.
    pub deliver: i32,
}

impl Default for Window {
    fn default() -> Self {
        Window {
            package: WINDOW_START,
            deliver: WINDOW_START,
        }
    }
}

impl Window {
    /// Record one outbound `RELAY_DATA` cell sent through this hop.
    pub fn package_cell(&mut self) {
        self.package -= 1;
    }

    /// Record a `RELAY_SENDME` arriving for our outbound traffic, freeing up
    /// more packaging capacity.
    pub fn package_sendme(&mut self) {
        self.package += WINDOW_INCREMENT;
    }

    /// Record one inbound `RELAY_DATA` cell received from this hop. Returns
    /// `true` if we've now reached the threshold at which we must emit a
    /// circuit-level `RELAY_SENDME`.
    #[must_use]
    pub fn deliver_cell(&mut self) -> bool {
        self.deliver -= 1;
        self.deliver == WINDOW_SENDME_THRESHOLD
    }

    /// Record sending a `RELAY_SENDME` for our inbound traffic, restoring
    /// deliver capacity.
    pub fn deliver_sendme(&mut self) {
        self.deliver += WINDOW_INCREMENT;
    }
}

/// One hop of a circuit.
///
/// `key_agreement` is present from construction; `crypto_state` becomes
/// `Some` only once [`CircuitNode::complete_handshake`] succeeds, which is
/// the type-level encoding of "crypto_state is set on a node iff its
/// handshake has completed".
#[derive(Debug)]
pub struct CircuitNode {
    /// The relay this hop talks to.
    pub router: RouterDescriptor,
    /// Which handshake type was used to build this hop.
    pub handshake_type: HandshakeType,
    /// The client side of the handshake, live until `complete_handshake`
    /// succeeds.
    key_agreement: KeyAgreement,
    /// The post-handshake symmetric state, once the handshake has
    /// completed.
    crypto_state: Option<CryptoState>,
    /// This hop's flow-control window.
    pub window: Window,
}

impl CircuitNode {
    /// Start building a new hop bound to `router`, using `handshake_type`.
    pub fn new(router: RouterDescriptor, handshake_type: HandshakeType) -> Self {
        let key_agreement = KeyAgreement::new(handshake_type, &router.onion_key);
        CircuitNode {
            router,
            handshake_type,
            key_agreement,
            crypto_state: None,
            window: Window::default(),
        }
    }

    /// Return the client's handshake bytes ("onion skin") for this hop.
    ///
    /// Idempotent: the same bytes are returned on every call until
    /// [`Self::complete_handshake`] succeeds.
    pub fn create_onion_skin(&self) -> &[u8] {
        self.key_agreement.handshake_bytes()
    }

    /// Complete this hop's handshake using the server's reply bytes.
    ///
    /// Fails with [`Error::HandshakeFailed`] if the reply does not verify;
    /// the node is left without a live crypto state in that case.
    pub fn complete_handshake(&mut self, server_bytes: &[u8]) -> Result<()> {
        let secret = self.key_agreement.complete(server_bytes)?;
        self.crypto_state = Some(CryptoState::new(&secret));
        Ok(())
    }

    /// Whether this hop's handshake has completed.
    pub fn is_ready(&self) -> bool {
        self.crypto_state.is_some()
    }

    /// Onion-encrypt `cell` for this hop, mutating its payload in place.
    ///
    /// Returns [`Error::NoSuchHop`] if the handshake for this hop hasn't
    /// completed yet (callers should never reach this in practice, since a
    /// node only joins `Circuit::nodes` after a successful handshake).
    pub fn encrypt_forward(&mut self, cell: &mut TorCell) -> Result<()> {
        self.crypto_state
            .as_mut()
            .ok_or(Error::NoSuchHop)?
            .encrypt_forward(cell);
        Ok(())
    }

    /// Peel this hop's onion layer off an inbound `cell`, mutating its
    /// payload in place. Returns `true` if this hop's digest recognised the
    /// cell (i.e. this hop originated it).
    pub fn decrypt_backward(&mut self, cell: &mut TorCell) -> Result<bool> {
        Ok(self
            .crypto_state
            .as_mut()
            .ok_or(Error::NoSuchHop)?
            .decrypt_backward(cell))
    }
}
