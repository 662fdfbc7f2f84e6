//! The circuit state machine: hop-by-hop construction, onion encryption of
//! outbound relay traffic, decryption and dispatch of inbound traffic, and
//! teardown.
//!
//! A `Circuit` owns exactly one guard connection's worth of state: its own
//! [`CellHandlerManager`] and its own [`Receiver`] background task. Multiple
//! hops of one circuit share that single pair, since tor-spec keeps one
//! circuit id constant across its whole lifetime, no matter how many hops
//! are later added with [`Circuit::extend`]. A second, independent circuit
//! (for example the rendezvous-point circuit used for a hidden-service
//! connection) gets its own `Circuit`, its own handler manager, and its own
//! receiver, even if it happens to run over the same guard.

use std::net::IpAddr;
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, error, info, trace, warn};

use crate::cell::{CellKind, RelayedTorCell, TeardownReason, TorCell};
use crate::config::CircuitParameters;
use crate::crypto::HandshakeType;
use crate::error::{Error, Result};
use crate::external::{Consensus, GuardLink, Sender, StreamsManager};
use crate::handler::CellHandlerManager;
use crate::node::{CircuitNode, RouterDescriptor};
use crate::receiver::Receiver;

/// The circuit's lifecycle state. Transitions are one-way:
/// `Unknown -> Connected -> Destroyed`; there is no way back to an earlier
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum CircuitState {
    /// Constructed but [`Circuit::create`] has not yet completed.
    Unknown,
    /// The first-hop handshake has completed; `nodes` is non-empty.
    Connected,
    /// [`Circuit::destroy`] has run; the circuit may not be used again.
    Destroyed,
}

/// A client-side Tor circuit: an ordered chain of hops, each reached through
/// an authenticated handshake over the previous one, onion-encrypting
/// traffic outbound and peeling it inbound.
///
/// Three locks protect disjoint concerns and are never acquired out of
/// order: `state` guards the lifecycle transition itself, `relay_send_lock`
/// makes "encrypt, then hand to the sender" atomic so two threads' relay
/// cells can't interleave their onion layers, and `extend_lock` serializes
/// the handshake-in-flight window of [`Circuit::extend`] and
/// [`Circuit::extend_to_hidden`] so only one hop is ever mid-handshake at a
/// time.
pub struct Circuit {
    id: u32,
    sender: Arc<dyn Sender>,
    consensus: Arc<dyn Consensus>,
    streams: Arc<dyn StreamsManager>,
    handlers: Arc<CellHandlerManager>,
    receiver: Mutex<Option<Arc<Receiver>>>,
    nodes: Mutex<Vec<CircuitNode>>,
    state: Mutex<CircuitState>,
    relay_send_lock: Mutex<()>,
    pub(crate) extend_lock: Mutex<()>,
    pub(crate) associated_hidden_service: Mutex<Option<String>>,
    pub(crate) params: CircuitParameters,
}

impl Circuit {
    /// Construct a new, not-yet-created circuit. Call [`Self::create`]
    /// before doing anything else with it.
    pub fn new(
        id: u32,
        sender: Arc<dyn Sender>,
        consensus: Arc<dyn Consensus>,
        streams: Arc<dyn StreamsManager>,
        params: CircuitParameters,
    ) -> Arc<Self> {
        Arc::new(Circuit {
            id,
            sender,
            consensus,
            streams,
            handlers: Arc::new(CellHandlerManager::new()),
            receiver: Mutex::new(None),
            nodes: Mutex::new(Vec::new()),
            state: Mutex::new(CircuitState::Unknown),
            relay_send_lock: Mutex::new(()),
            extend_lock: Mutex::new(()),
            associated_hidden_service: Mutex::new(None),
            params,
        })
    }

    /// This circuit's id, assigned once by its [`crate::manager::CircuitsManager`].
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The circuit's current lifecycle state.
    pub fn state(&self) -> CircuitState {
        *self.state.lock().expect("state mutex poisoned")
    }

    /// Whether the circuit has completed its first-hop handshake and has not
    /// since been destroyed.
    pub fn is_connected(&self) -> bool {
        self.state() == CircuitState::Connected
    }

    /// How many hops this circuit currently has.
    pub fn nodes_count(&self) -> usize {
        self.nodes.lock().expect("nodes mutex poisoned").len()
    }

    /// A copy of the last hop's router descriptor, used to address
    /// rendezvous/introduction messages at the far end of this circuit.
    pub fn last_router(&self) -> Result<RouterDescriptor> {
        self.nodes
            .lock()
            .expect("nodes mutex poisoned")
            .last()
            .map(|node| node.router.clone())
            .ok_or(Error::NoSuchHop)
    }

    /// Open this circuit's first hop: send `CREATE2` to `router` over
    /// `link`, and block until the matching `CREATED2` arrives or the
    /// default timeout elapses.
    ///
    /// Also starts this circuit's own background [`Receiver`] task against
    /// `link`, and subscribes its internal relay/stream/teardown handlers.
    /// Fails with a protocol error if called more than once.
    pub fn create(self: &Arc<Self>, router: RouterDescriptor, link: Arc<dyn GuardLink>) -> Result<()> {
        {
            let state = self.state.lock().expect("state mutex poisoned");
            if *state != CircuitState::Unknown {
                return Err(Error::Protocol("circuit already created".into()));
            }
        }

        info!(circuit_id = self.id, router = %router.nickname, "creating circuit");
        let receiver = Receiver::start(link, Arc::clone(&self.handlers));

        let mut node = CircuitNode::new(router, HandshakeType::Ntor);
        let onion_skin = node.create_onion_skin().to_vec();
        let create_cell = TorCell::new(CellKind::Create2, self.id, onion_skin);

        let waiter = self.handlers.scoped_waiter(&[CellKind::Created2]);
        self.sender.send(create_cell)?;
        debug!(circuit_id = self.id, "waiting for CREATED2");
        let reply = waiter.await_cell(self.params.default_timeout)?;
        node.complete_handshake(&reply.payload)?;

        *self.nodes.lock().expect("nodes mutex poisoned") = vec![node];
        *self.state.lock().expect("state mutex poisoned") = CircuitState::Connected;
        *self.receiver.lock().expect("receiver mutex poisoned") = Some(receiver);

        self.subscribe_relay_handlers();
        debug!(circuit_id = self.id, "circuit created");
        Ok(())
    }

    /// Register this circuit's internal persistent handlers: decrypting
    /// inbound relay traffic, routing decrypted cells to streams, and
    /// reacting to `RELAY_TRUNCATED`. Handlers hold only a [`Weak`]
    /// reference to `self` so a circuit with handlers registered is never
    /// kept alive by its own handler manager.
    fn subscribe_relay_handlers(self: &Arc<Self>) {
        let weak: Weak<Circuit> = Arc::downgrade(self);

        let relay_weak = weak.clone();
        self.handlers.subscribe(
            &[CellKind::RelayEarly, CellKind::Relay],
            Arc::new(move |cell, _from, _orig| {
                if let Some(circuit) = relay_weak.upgrade() {
                    circuit.handle_relay(cell);
                }
            }),
        );

        let stream_weak = weak.clone();
        self.handlers.subscribe(
            &[CellKind::RelayData, CellKind::RelaySendme, CellKind::RelayConnected],
            Arc::new(move |cell, _from, orig| {
                if let (Some(circuit), Some(orig)) = (stream_weak.upgrade(), orig) {
                    circuit.on_stream(cell, orig);
                }
            }),
        );

        let end_weak = weak.clone();
        self.handlers.subscribe(
            &[CellKind::RelayEnd],
            Arc::new(move |_cell, _from, orig| {
                if let (Some(circuit), Some(orig)) = (end_weak.upgrade(), orig) {
                    circuit.on_stream_end(orig);
                }
            }),
        );

        let truncated_weak = weak.clone();
        self.handlers.subscribe(
            &[CellKind::RelayTruncated],
            Arc::new(move |cell, _from, _orig| {
                if let Some(circuit) = truncated_weak.upgrade() {
                    circuit.on_truncated(cell);
                }
            }),
        );

        self.handlers.subscribe(
            &[CellKind::Destroy],
            Arc::new(move |cell, _from, _orig| {
                if let Some(circuit) = weak.upgrade() {
                    circuit.on_destroy(cell);
                }
            }),
        );
    }

    /// Extend the circuit by one hop, to `next`, using `handshake_type`.
    ///
    /// Blocks until a matching `RELAY_EXTENDED2` (success) or
    /// `RELAY_TRUNCATED` (refusal) arrives. Only one `extend` (or
    /// [`Self::extend_to_hidden`]) may be in flight on a circuit at a time.
    pub fn extend(self: &Arc<Self>, next: RouterDescriptor, handshake_type: HandshakeType) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::CircuitNotConnected);
        }
        let _extend_guard = self.extend_lock.lock().expect("extend mutex poisoned");

        info!(circuit_id = self.id, router = %next.nickname, "extending circuit");
        let mut node = CircuitNode::new(next, handshake_type);
        let onion_skin = node.create_onion_skin().to_vec();
        let payload = encode_extend2(&node.router, &onion_skin);
        let relayed = RelayedTorCell::new(CellKind::RelayExtend2, self.id, 0, payload);

        let reply = self.send_relay_wait(
            &relayed,
            CellKind::RelayEarly,
            &[CellKind::RelayExtended2, CellKind::RelayTruncated],
        )?;

        if reply.kind == CellKind::RelayTruncated {
            let reason = RelayedTorCell::new(CellKind::RelayTruncated, self.id, 0, reply.payload).teardown_reason();
            return Err(Error::CircuitExtendFailed(reason.to_string()));
        }

        debug!(circuit_id = self.id, "verifying EXTENDED2 response");
        node.complete_handshake(&reply.payload)?;
        self.nodes.lock().expect("nodes mutex poisoned").push(node);
        Ok(())
    }

    /// Extend the circuit, one hop at a time, until it has `hops_count`
    /// hops. The last hop picked is an exit node; every other added hop is a
    /// middle node.
    pub fn build_hops(self: &Arc<Self>, hops_count: usize) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::CircuitNotConnected);
        }
        info!(circuit_id = self.id, hops_count, "building circuit");
        while self.nodes_count() < hops_count {
            let router = if self.nodes_count() == hops_count - 1 {
                self.consensus.random_exit_node()?
            } else {
                self.consensus.random_middle_node()?
            };
            self.extend(router, HandshakeType::Ntor)?;
        }
        debug!(circuit_id = self.id, "circuit has been built");
        Ok(())
    }

    /// Allocate a new stream on this circuit.
    pub fn open_stream(&self) -> Result<u16> {
        if !self.is_connected() {
            return Err(Error::CircuitNotConnected);
        }
        Ok(self.streams.create_new())
    }

    /// Close a stream previously returned by [`Self::open_stream`].
    pub fn close_stream(&self, stream_id: u16) {
        self.streams.close(stream_id);
    }

    /// Close every currently open stream on this circuit, without tearing
    /// down the circuit itself.
    pub fn close_all_streams(&self) {
        for id in self.streams.stream_ids() {
            self.close_stream(id);
        }
    }

    /// Send a `RELAY_DATA` cell carrying `payload` on `stream_id`.
    ///
    /// Packaging a data cell costs one unit of the exit hop's package
    /// window; the peer replenishes it with a circuit-level `RELAY_SENDME`
    /// (handled in [`Self::process_window`]).
    pub fn send_data(&self, stream_id: u16, payload: Vec<u8>) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::CircuitNotConnected);
        }
        let relayed = RelayedTorCell::new(CellKind::RelayData, self.id, stream_id, payload);
        self.send_relay(&relayed, CellKind::Relay)?;
        if let Some(node) = self.nodes.lock().expect("nodes mutex poisoned").last_mut() {
            node.window.package_cell();
        }
        Ok(())
    }

    /// Tear down the circuit: close every open stream, optionally send a
    /// `DESTROY` cell, abort any in-flight waiters, and stop this circuit's
    /// receiver task.
    ///
    /// Idempotent: calling `destroy` on an already-destroyed circuit is a
    /// no-op. Fails with [`Error::CircuitNotConnected`] if the circuit never
    /// finished [`Self::create`].
    pub fn destroy(self: &Arc<Self>, send_destroy: bool) -> Result<()> {
        {
            let mut state = self.state.lock().expect("state mutex poisoned");
            match *state {
                CircuitState::Connected => {
                    self.close_all_streams();
                    if send_destroy {
                        let cell = TorCell::new(CellKind::Destroy, self.id, vec![TeardownReason::Finished as u8]);
                        self.sender.send(cell)?;
                    }
                }
                CircuitState::Destroyed => {
                    debug!(circuit_id = self.id, "circuit has been destroyed already");
                    return Ok(());
                }
                CircuitState::Unknown => return Err(Error::CircuitNotConnected),
            }
            *state = CircuitState::Destroyed;
        }

        self.handlers.fail_all_waiters("circuit destroyed");
        if let Some(receiver) = self.receiver.lock().expect("receiver mutex poisoned").take() {
            receiver.stop();
        }
        Ok(())
    }

    /// Decrypt an inbound relay cell hop-by-hop, process circuit-level flow
    /// control, and re-dispatch the decoded relay command to whichever
    /// stream or waiter is expecting it.
    fn handle_relay(self: &Arc<Self>, cell: &TorCell) {
        let mut working = cell.clone();
        let hop_index = {
            let mut nodes = self.nodes.lock().expect("nodes mutex poisoned");
            decrypt_through(&mut nodes, &mut working)
        };
        let Some(hop_index) = hop_index else {
            warn!(circuit_id = self.id, kind = %cell.kind, "relay cell not recognised by any hop; dropping");
            return;
        };
        let Some(relayed) = RelayedTorCell::unpack(self.id, &working.payload) else {
            warn!(circuit_id = self.id, "malformed relay payload; dropping");
            return;
        };
        trace!(circuit_id = self.id, hop = hop_index, kind = %relayed.kind, "decrypted relay cell");

        if self.process_window(hop_index, &relayed) {
            return;
        }

        let inner = TorCell::new(relayed.kind, self.id, relayed.payload.clone());
        self.handlers.dispatch(&inner, None, Some(&relayed));
    }

    /// Apply circuit-level flow-control bookkeeping for a decrypted relay
    /// cell recognised at `hop_index`. Returns `true` if the cell was fully
    /// handled here and should not also be dispatched to a stream/waiter
    /// (true only for a circuit-level `RELAY_SENDME`, i.e. `stream_id == 0`).
    fn process_window(&self, hop_index: usize, relayed: &RelayedTorCell) -> bool {
        let mut nodes = self.nodes.lock().expect("nodes mutex poisoned");
        let Some(node) = nodes.get_mut(hop_index) else {
            return false;
        };
        match relayed.kind {
            CellKind::RelaySendme if relayed.stream_id == 0 => {
                node.window.package_sendme();
                true
            }
            CellKind::RelayData => {
                let need_sendme = node.window.deliver_cell();
                if need_sendme {
                    node.window.deliver_sendme();
                }
                drop(nodes);
                if need_sendme {
                    let sendme = RelayedTorCell::new(CellKind::RelaySendme, self.id, 0, Vec::new());
                    if let Err(err) = self.send_relay(&sendme, CellKind::Relay) {
                        warn!(circuit_id = self.id, error = %err, "failed to send circuit-level SENDME");
                    }
                }
                false
            }
            _ => false,
        }
    }

    fn on_stream(self: &Arc<Self>, _cell: &TorCell, orig: &RelayedTorCell) {
        if !self.streams.has_stream(orig.stream_id) {
            warn!(circuit_id = self.id, stream_id = orig.stream_id, "stream is already closed or was never opened");
            return;
        }
        self.streams.handle_cell(orig.stream_id, orig);
        if let Some(receiver) = self.receiver.lock().expect("receiver mutex poisoned").as_ref() {
            receiver.notify_stream(orig);
        }
    }

    fn on_stream_end(self: &Arc<Self>, orig: &RelayedTorCell) {
        if self.streams.has_stream(orig.stream_id) {
            self.close_stream(orig.stream_id);
        }
    }

    /// Reacts to a top-level `RELAY_TRUNCATED`.
    ///
    /// A `RELAY_TRUNCATED` also arrives as the direct, solicited reply to an
    /// in-flight [`Self::extend`] (tor-spec's only way to refuse an extend).
    /// `extend`'s own scoped waiter for that reply races this persistent
    /// handler for the very same cell; if this handler destroyed the circuit
    /// unconditionally, a refused extend would leave the circuit `Destroyed`
    /// instead of `Connected` by the time `extend` returns its error. Since
    /// `extend` holds `extend_lock` for exactly the window in which such a
    /// reply can be solicited, a successful `try_lock` here means no extend
    /// is waiting on this cell, i.e. the truncation is genuinely unsolicited.
    fn on_truncated(self: &Arc<Self>, cell: &TorCell) {
        let Ok(_guard) = self.extend_lock.try_lock() else {
            trace!(circuit_id = self.id, "RELAY_TRUNCATED arrived for an in-flight extend; leaving teardown to its caller");
            return;
        };
        let reason = RelayedTorCell::new(CellKind::RelayTruncated, self.id, 0, cell.payload.clone()).teardown_reason();
        error!(circuit_id = self.id, %reason, "circuit was truncated by remote");
        if let Err(err) = self.destroy(false) {
            warn!(circuit_id = self.id, error = %err, "failed to tear down truncated circuit");
        }
    }

    /// Reacts to a top-level `DESTROY`: the remote end has torn the whole
    /// circuit down, so this always marks the circuit `Destroyed`, unlike
    /// [`Self::on_truncated`] there is no local waiter a `DESTROY` could be a
    /// solicited reply to.
    fn on_destroy(self: &Arc<Self>, cell: &TorCell) {
        let reason = RelayedTorCell::new(CellKind::RelayTruncated, self.id, 0, cell.payload.clone()).teardown_reason();
        error!(circuit_id = self.id, %reason, "circuit was destroyed by remote");
        if let Err(err) = self.destroy(false) {
            warn!(circuit_id = self.id, error = %err, "failed to tear down circuit after remote DESTROY");
        }
    }

    /// Onion-encrypt `relayed` through every hop (outermost layer last, per
    /// tor-spec 5.5.2.1) and hand the result to the sender, atomically with
    /// respect to any other thread doing the same.
    fn send_relay(&self, relayed: &RelayedTorCell, outer_kind: CellKind) -> Result<()> {
        let _guard = self.relay_send_lock.lock().expect("relay send mutex poisoned");
        let mut cell = TorCell::new(outer_kind, self.id, relayed.pack());
        {
            let mut nodes = self.nodes.lock().expect("nodes mutex poisoned");
            for node in nodes.iter_mut().rev() {
                node.encrypt_forward(&mut cell)?;
            }
        }
        self.sender.send(cell)
    }

    /// Subscribe a scoped waiter for `wait_kinds` before sending `relayed`,
    /// so a fast reply can never race ahead of the subscription, then block
    /// for the reply.
    fn send_relay_wait(
        self: &Arc<Self>,
        relayed: &RelayedTorCell,
        outer_kind: CellKind,
        wait_kinds: &[CellKind],
    ) -> Result<TorCell> {
        let waiter = self.handlers.scoped_waiter(wait_kinds);
        self.send_relay(relayed, outer_kind)?;
        debug!(circuit_id = self.id, "getting response...");
        waiter.await_cell(self.params.default_timeout)
    }

    /// Establish a rendezvous point at this circuit's last hop. Used by
    /// [`crate::rendezvous`].
    pub(crate) fn rendezvous_establish(self: &Arc<Self>, cookie: &[u8; 20]) -> Result<()> {
        let relayed = RelayedTorCell::new(CellKind::RelayEstablishRendezvous, self.id, 0, cookie.to_vec());
        let established = self.send_relay_wait(&relayed, CellKind::Relay, &[CellKind::RelayRendezvousEstablished])?;
        info!(circuit_id = self.id, len = established.payload.len(), "rendezvous established");
        Ok(())
    }

    pub(crate) fn consensus(&self) -> &Arc<dyn Consensus> {
        &self.consensus
    }

    pub(crate) fn push_node(&self, node: CircuitNode) {
        self.nodes.lock().expect("nodes mutex poisoned").push(node);
    }
}

/// Walk `nodes` in order, peeling one onion layer per hop, stopping at the
/// first hop whose digest recognises `cell`. Returns that hop's index, or
/// `None` if no hop recognised it (a protocol violation the caller logs and
/// drops, never panics on).
fn decrypt_through(nodes: &mut [CircuitNode], cell: &mut TorCell) -> Option<usize> {
    for (i, node) in nodes.iter_mut().enumerate() {
        match node.decrypt_backward(cell) {
            Ok(true) => return Some(i),
            Ok(false) => continue,
            Err(_) => return None,
        }
    }
    None
}

/// Encode a `RELAY_EXTEND2` payload: the next hop's address, port,
/// fingerprint, and onion skin. tor-spec 5.1.2's real encoding also supports
/// multiple link specifiers and handshake-type tagging; this crate's single
/// address/single handshake-type model is sufficient for its own
/// [`Circuit::extend`]/[`CircuitNode::complete_handshake`] round trip.
fn encode_extend2(router: &RouterDescriptor, onion_skin: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 16 + 2 + 20 + 2 + onion_skin.len());
    match router.address {
        IpAddr::V4(v4) => {
            out.push(4);
            out.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            out.push(6);
            out.extend_from_slice(&v6.octets());
        }
    }
    out.extend_from_slice(&router.or_port.to_be_bytes());
    out.extend_from_slice(&router.identity);
    out.extend_from_slice(&(onion_skin.len() as u16).to_be_bytes());
    out.extend_from_slice(onion_skin);
    out
}

/// Test-only seam: let other modules' tests (e.g. [`crate::rendezvous`])
/// drive a `Circuit` into `Connected` without a real `create()` round trip.
#[cfg(test)]
impl Circuit {
    pub(crate) fn mark_connected_for_test(&self) {
        *self.state.lock().expect("state mutex poisoned") = CircuitState::Connected;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::HandshakeType;
    use std::collections::HashMap;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicU16, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn router(name: &str) -> RouterDescriptor {
        RouterDescriptor {
            address: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            or_port: 9001,
            onion_key: format!("onion-key-{name}").into_bytes(),
            identity: [0u8; 20],
            nickname: name.to_string(),
        }
    }

    /// A fake guard link plus sender pair wired directly together: anything
    /// sent is handed straight back as a reply, letting tests drive a real
    /// `Circuit` without real sockets.
    struct LoopbackLink {
        inbox: StdMutex<Vec<TorCell>>,
    }

    impl GuardLink for LoopbackLink {
        fn recv_cells_available(&self, timeout: Duration) -> Option<Vec<TorCell>> {
            let mut inbox = self.inbox.lock().unwrap();
            if inbox.is_empty() {
                std::thread::sleep(timeout.min(Duration::from_millis(5)));
                return Some(vec![]);
            }
            Some(std::mem::take(&mut *inbox))
        }
    }

    struct RecordingSender {
        link: Arc<LoopbackLink>,
        /// When present, synthesizes the relay's reply for a CREATE2/EXTEND2
        /// onion skin, simulating "the hop accepted our handshake".
        onion_key_for_reply: StdMutex<Vec<u8>>,
    }

    impl Sender for RecordingSender {
        fn send(&self, cell: TorCell) -> Result<()> {
            match cell.kind {
                CellKind::Create2 => {
                    let onion_key = self.onion_key_for_reply.lock().unwrap().clone();
                    let reply = synth_handshake_reply(&onion_key);
                    self.link
                        .inbox
                        .lock()
                        .unwrap()
                        .push(TorCell::new(CellKind::Created2, cell.circuit_id, reply));
                }
                CellKind::Destroy => {}
                _ => {}
            }
            Ok(())
        }
    }

    /// Build a server-side handshake reply this crate's toy ntor
    /// implementation will accept, mirroring [`crate::crypto::test`].
    fn synth_handshake_reply(onion_key: &[u8]) -> Vec<u8> {
        let server_public = vec![42u8; 32];
        let mut sig_input = server_public.clone();
        let tag: Vec<u8> = server_public
            .iter()
            .zip(onion_key.iter().cycle())
            .map(|(a, b)| a ^ b)
            .collect();
        sig_input.extend_from_slice(&tag);
        sig_input
    }

    struct NoopConsensus;
    impl Consensus for NoopConsensus {
        fn random_middle_node(&self) -> Result<RouterDescriptor> {
            Ok(router("middle"))
        }
        fn random_exit_node(&self) -> Result<RouterDescriptor> {
            Ok(router("exit"))
        }
        fn responsible_hs_directories(&self, _onion: &str) -> Vec<Box<dyn crate::external::HsDirectory>> {
            vec![]
        }
    }

    #[derive(Default)]
    struct FakeStreams {
        next_id: AtomicU16,
        open: StdMutex<HashMap<u16, Vec<Vec<u8>>>>,
    }

    impl StreamsManager for FakeStreams {
        fn create_new(&self) -> u16 {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            self.open.lock().unwrap().insert(id, Vec::new());
            id
        }
        fn close(&self, stream_id: u16) {
            self.open.lock().unwrap().remove(&stream_id);
        }
        fn has_stream(&self, stream_id: u16) -> bool {
            self.open.lock().unwrap().contains_key(&stream_id)
        }
        fn handle_cell(&self, stream_id: u16, cell: &RelayedTorCell) {
            if let Some(buf) = self.open.lock().unwrap().get_mut(&stream_id) {
                buf.push(cell.payload.clone());
            }
        }
        fn stream_ids(&self) -> Vec<u16> {
            self.open.lock().unwrap().keys().copied().collect()
        }
    }

    fn new_test_circuit() -> (Arc<Circuit>, Arc<LoopbackLink>) {
        let link = Arc::new(LoopbackLink { inbox: StdMutex::new(Vec::new()) });
        let first_hop = router("guard");
        let sender = Arc::new(RecordingSender {
            link: Arc::clone(&link),
            onion_key_for_reply: StdMutex::new(first_hop.onion_key.clone()),
        });
        let circuit = Circuit::new(
            1,
            sender,
            Arc::new(NoopConsensus),
            Arc::new(FakeStreams::default()),
            CircuitParameters::default(),
        );
        circuit.create(first_hop, link.clone() as Arc<dyn GuardLink>).expect("create succeeds");
        (circuit, link)
    }

    #[test]
    fn create_connects_and_adds_first_hop() {
        let (circuit, _link) = new_test_circuit();
        assert!(circuit.is_connected());
        assert_eq!(circuit.nodes_count(), 1);
    }

    #[test]
    fn destroy_is_idempotent_and_closes_streams() {
        let (circuit, _link) = new_test_circuit();
        let stream_id = circuit.open_stream().expect("stream opens on connected circuit");
        assert!(circuit.nodes_count() == 1);
        circuit.destroy(false).expect("destroy succeeds");
        assert_eq!(circuit.state(), CircuitState::Destroyed);
        circuit.destroy(false).expect("destroy is idempotent");
        // Streams were closed as part of teardown.
        let _ = stream_id;
    }

    #[test]
    fn double_create_is_rejected() {
        let (circuit, link) = new_test_circuit();
        let err = circuit.create(router("guard"), link as Arc<dyn GuardLink>).unwrap_err();
        assert_matches::assert_matches!(err, Error::Protocol(_));
    }

    #[test]
    fn operations_on_unconnected_circuit_fail() {
        let circuit = Circuit::new(
            2,
            Arc::new(RecordingSender {
                link: Arc::new(LoopbackLink { inbox: StdMutex::new(Vec::new()) }),
                onion_key_for_reply: StdMutex::new(Vec::new()),
            }),
            Arc::new(NoopConsensus),
            Arc::new(FakeStreams::default()),
            CircuitParameters::default(),
        );
        assert_matches::assert_matches!(circuit.open_stream(), Err(Error::CircuitNotConnected));
        assert_matches::assert_matches!(circuit.send_data(1, vec![]), Err(Error::CircuitNotConnected));
    }

    #[test]
    fn decrypt_through_stops_at_first_recognising_hop() {
        let router_a = router("a");
        let reply = synth_handshake_reply(&router_a.onion_key);
        let mut node_a = CircuitNode::new(router_a, HandshakeType::Ntor);
        node_a.complete_handshake(&reply).unwrap();
        let mut nodes = vec![node_a];

        let relayed = RelayedTorCell::new(CellKind::RelayData, 1, 7, b"payload".to_vec());
        let mut cell = TorCell::new(CellKind::Relay, 1, relayed.pack());
        nodes[0].encrypt_forward(&mut cell).expect("hop handshake is complete");

        let hop_index = decrypt_through(&mut nodes, &mut cell);
        assert_eq!(hop_index, Some(0));
        let unpacked = RelayedTorCell::unpack(1, &cell.payload).unwrap();
        assert_eq!(unpacked.payload, b"payload");
    }
}
