//! Hidden-service (v2) rendezvous bootstrap.
//!
//! Turns a plain, already-built circuit into a rendezvous-point circuit for
//! a hidden service: establish the rendezvous point at its last hop, then
//! walk the service's responsible directories and introduction points until
//! one successfully extends this circuit with a final hop reached through
//! the introduction protocol.

use std::sync::Arc;

use tracing::{debug, info};

use crate::circuit::Circuit;
use crate::error::{Error, Result};

/// A hidden service this circuit is being extended to rendezvous with.
#[derive(Debug, Clone)]
pub struct HiddenService {
    /// The service's onion address, used to key responsible-directory and
    /// introduction lookups.
    pub onion: String,
    /// A fresh, per-attempt rendezvous cookie (tor-spec 1.9
    /// `RENDEZVOUS_COOKIE`, 20 bytes).
    pub rendezvous_cookie: [u8; 20],
}

impl Circuit {
    /// Bootstrap this circuit (already built as a plain rendezvous-point
    /// circuit, i.e. after [`Circuit::build_hops`]) to rendezvous with
    /// `hidden_service`.
    ///
    /// Idempotent if called twice for the same service. Fails with
    /// [`Error::AlreadyAssociated`] if this circuit already rendezvoused
    /// with a *different* hidden service, and with
    /// [`Error::HiddenServiceUnreachable`] once every responsible directory
    /// and introduction point has been tried without success.
    pub fn extend_to_hidden(self: &Arc<Self>, hidden_service: &HiddenService) -> Result<()> {
        info!(circuit_id = self.id(), onion = %hidden_service.onion, "extending circuit for hidden service");

        let _extend_guard = self.extend_lock.lock().expect("extend mutex poisoned");

        {
            let mut associated = self.associated_hidden_service.lock().expect("hidden service mutex poisoned");
            match associated.as_deref() {
                Some(existing) if existing == hidden_service.onion => {
                    debug!(circuit_id = self.id(), "circuit already associated with this hidden service");
                    return Ok(());
                }
                Some(_) => return Err(Error::AlreadyAssociated),
                None => *associated = Some(hidden_service.onion.clone()),
            }
        }

        if let Err(err) = self.rendezvous_establish(&hidden_service.rendezvous_cookie) {
            *self.associated_hidden_service.lock().expect("hidden service mutex poisoned") = None;
            return Err(err);
        }

        info!(circuit_id = self.id(), "iterating over responsible directories");
        let directories = self
            .consensus()
            .responsible_hs_directories(&hidden_service.onion);

        for directory in directories.into_iter().take(self.params.directory_fanout) {
            let introductions = match directory.get_introductions(&hidden_service.onion) {
                Ok(points) => points,
                Err(Error::DescriptorUnavailable) => {
                    debug!(circuit_id = self.id(), "descriptor unavailable at this directory, trying next");
                    continue;
                }
                Err(err) => {
                    debug!(circuit_id = self.id(), error = %err, "directory lookup failed, trying next");
                    continue;
                }
            };

            info!(circuit_id = self.id(), count = introductions.len(), "iterating over introduction points");
            for introduction in &introductions {
                match introduction.connect(&hidden_service.onion) {
                    Ok(extend_node) => {
                        self.push_node(extend_node);
                        return Ok(());
                    }
                    Err(err) => {
                        debug!(circuit_id = self.id(), error = %err, "introduction attempt failed, trying next");
                        continue;
                    }
                }
            }
        }

        *self.associated_hidden_service.lock().expect("hidden service mutex poisoned") = None;
        Err(Error::HiddenServiceUnreachable)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cell::{CellKind, RelayedTorCell, TorCell};
    use crate::config::CircuitParameters;
    use crate::crypto::{CryptoState, HandshakeType, SharedSecret};
    use crate::external::{Consensus, GuardLink, HsDirectory, Introduction, Sender, StreamsManager};
    use crate::node::{CircuitNode, RouterDescriptor};
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Mutex;
    use std::time::Duration;

    /// XOR two byte strings up to the shorter length, cycling the shorter
    /// one, mirroring `crypto::checked_xor` (private to that module).
    fn checked_xor(a: &[u8], b: &[u8]) -> Vec<u8> {
        a.iter().zip(b.iter().cycle()).map(|(x, y)| x ^ y).collect()
    }

    /// Reconstruct the `CryptoState` the guard hop derives from the
    /// client's ephemeral handshake bytes, so a fake sender can onion-wrap
    /// replies the real circuit recognises.
    fn mirror_state(ephemeral: &[u8], server_public: &[u8]) -> CryptoState {
        CryptoState::new(&SharedSecret::from_raw_for_test(checked_xor(ephemeral, server_public)))
    }

    fn router(name: &str) -> RouterDescriptor {
        RouterDescriptor {
            address: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            or_port: 9001,
            onion_key: format!("onion-key-{name}").into_bytes(),
            identity: [0u8; 20],
            nickname: name.to_string(),
        }
    }

    struct DummySender;
    impl Sender for DummySender {
        fn send(&self, cell: TorCell) -> Result<()> {
            if cell.kind == CellKind::Create2 {
                // Never replies; not exercised by these tests since we build
                // circuits directly via push_node instead of create().
                let _ = cell;
            }
            Ok(())
        }
    }

    struct NoDirs;
    impl Consensus for NoDirs {
        fn random_middle_node(&self) -> Result<RouterDescriptor> {
            Ok(router("middle"))
        }
        fn random_exit_node(&self) -> Result<RouterDescriptor> {
            Ok(router("exit"))
        }
        fn responsible_hs_directories(&self, _onion: &str) -> Vec<Box<dyn HsDirectory>> {
            vec![]
        }
    }

    struct NoopStreams;
    impl StreamsManager for NoopStreams {
        fn create_new(&self) -> u16 {
            1
        }
        fn close(&self, _stream_id: u16) {}
        fn has_stream(&self, _stream_id: u16) -> bool {
            false
        }
        fn handle_cell(&self, _stream_id: u16, _cell: &RelayedTorCell) {}
        fn stream_ids(&self) -> Vec<u16> {
            vec![]
        }
    }

    /// Force a circuit directly into `Connected` with one ready hop, without
    /// going through `create()`'s network round trip.
    fn connected_circuit(consensus: Arc<dyn Consensus>) -> Arc<Circuit> {
        let params = CircuitParameters {
            default_timeout: Duration::from_millis(30),
            ..CircuitParameters::default()
        };
        let circuit = Circuit::new(1, Arc::new(DummySender), consensus, Arc::new(NoopStreams), params);
        let router_a = router("a");
        let reply = {
            let server_public = vec![9u8; 32];
            let tag: Vec<u8> = server_public
                .iter()
                .zip(router_a.onion_key.iter().cycle())
                .map(|(a, b)| a ^ b)
                .collect();
            let mut r = server_public;
            r.extend_from_slice(&tag);
            r
        };
        let mut node = CircuitNode::new(router_a, HandshakeType::Ntor);
        node.complete_handshake(&reply).expect("handshake completes");
        circuit.push_node(node);
        circuit.mark_connected_for_test();
        circuit
    }

    #[test]
    fn no_responsible_directories_is_unreachable() {
        let circuit = connected_circuit(Arc::new(NoDirs));
        let hs = HiddenService {
            onion: "example.onion".to_string(),
            rendezvous_cookie: [7u8; 20],
        };
        // rendezvous_establish will try to send+wait and time out quickly
        // since DummyLink never replies; use a short timeout via a
        // hand-built CircuitParameters to keep the test fast.
        let err = circuit.extend_to_hidden(&hs).unwrap_err();
        assert_matches::assert_matches!(err, Error::CellTimeout(_));
    }

    #[test]
    fn second_call_for_different_service_is_rejected_after_association() {
        let circuit = connected_circuit(Arc::new(NoDirs));
        {
            let mut assoc = circuit.associated_hidden_service.lock().unwrap();
            *assoc = Some("already.onion".to_string());
        }
        let hs = HiddenService {
            onion: "other.onion".to_string(),
            rendezvous_cookie: [1u8; 20],
        };
        assert_matches::assert_matches!(circuit.extend_to_hidden(&hs), Err(Error::AlreadyAssociated));
    }

    struct FakeIntroduction {
        onion_key: Vec<u8>,
    }
    impl Introduction for FakeIntroduction {
        fn connect(&self, _onion: &str) -> Result<CircuitNode> {
            let router_b = router("intro");
            let server_public = vec![1u8; 32];
            let tag: Vec<u8> = server_public
                .iter()
                .zip(self.onion_key.iter().cycle())
                .map(|(a, b)| a ^ b)
                .collect();
            let mut reply = server_public;
            reply.extend_from_slice(&tag);
            let mut node = CircuitNode::new(router_b, HandshakeType::Tap);
            node.complete_handshake(&reply)?;
            Ok(node)
        }
    }

    struct FakeDirectory {
        onion_key: Vec<u8>,
    }
    impl HsDirectory for FakeDirectory {
        fn get_introductions(&self, _onion: &str) -> Result<Vec<Box<dyn Introduction>>> {
            Ok(vec![Box::new(FakeIntroduction { onion_key: self.onion_key.clone() })])
        }
    }

    struct OneDirConsensus {
        onion_key: Vec<u8>,
    }
    impl Consensus for OneDirConsensus {
        fn random_middle_node(&self) -> Result<RouterDescriptor> {
            Ok(router("middle"))
        }
        fn random_exit_node(&self) -> Result<RouterDescriptor> {
            Ok(router("exit"))
        }
        fn responsible_hs_directories(&self, _onion: &str) -> Vec<Box<dyn HsDirectory>> {
            vec![Box::new(FakeDirectory { onion_key: self.onion_key.clone() })]
        }
    }

    /// A fake guard link fed directly by [`EstablishingSender`], letting the
    /// directory-loop test drive a real `Circuit::create` without a socket.
    struct LoopbackLink {
        inbox: Mutex<Vec<TorCell>>,
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

    /// Unlike [`DummySender`], answers both `CREATE2` and the guard's
    /// `RELAY_ESTABLISH_RENDEZVOUS`, so `extend_to_hidden` can reach the
    /// directory loop instead of timing out at the establish step.
    struct EstablishingSender {
        link: Arc<LoopbackLink>,
        guard_onion_key: Vec<u8>,
        guard_mirror: Mutex<Option<CryptoState>>,
    }

    impl Sender for EstablishingSender {
        fn send(&self, cell: TorCell) -> Result<()> {
            match cell.kind {
                CellKind::Create2 => {
                    let ephemeral = cell.payload[0..32].to_vec();
                    let server_public = vec![42u8; 32];
                    *self.guard_mirror.lock().unwrap() = Some(mirror_state(&ephemeral, &server_public));
                    let tag = checked_xor(&server_public, &self.guard_onion_key);
                    let mut reply = server_public;
                    reply.extend_from_slice(&tag);
                    self.link
                        .inbox
                        .lock()
                        .unwrap()
                        .push(TorCell::new(CellKind::Created2, cell.circuit_id, reply));
                }
                CellKind::Relay => {
                    let mut peeled = TorCell::new(cell.kind, cell.circuit_id, cell.payload.clone());
                    let matched = self
                        .guard_mirror
                        .lock()
                        .unwrap()
                        .as_mut()
                        .expect("guard mirror set by CREATE2")
                        .decrypt_backward(&mut peeled);
                    assert!(matched);
                    let relayed = RelayedTorCell::unpack(cell.circuit_id, &peeled.payload).expect("well-formed relay cell");
                    if relayed.kind == CellKind::RelayEstablishRendezvous {
                        let reply = RelayedTorCell::new(CellKind::RelayRendezvousEstablished, cell.circuit_id, 0, vec![]);
                        let mut reply_cell = TorCell::new(CellKind::Relay, cell.circuit_id, reply.pack());
                        self.guard_mirror.lock().unwrap().as_mut().unwrap().encrypt_forward(&mut reply_cell);
                        self.link.inbox.lock().unwrap().push(reply_cell);
                    }
                }
                _ => {}
            }
            Ok(())
        }
    }

    /// An introduction point that always fails to connect, so a directory
    /// offering it first forces the loop to fall through to the next one.
    struct FailingIntroduction;
    impl Introduction for FailingIntroduction {
        fn connect(&self, _onion: &str) -> Result<CircuitNode> {
            Err(Error::HiddenServiceUnreachable)
        }
    }

    struct TwoAttemptDirectory {
        onion_key: Vec<u8>,
    }
    impl HsDirectory for TwoAttemptDirectory {
        fn get_introductions(&self, _onion: &str) -> Result<Vec<Box<dyn Introduction>>> {
            Ok(vec![
                Box::new(FailingIntroduction),
                Box::new(FakeIntroduction { onion_key: self.onion_key.clone() }),
            ])
        }
    }

    struct TwoAttemptConsensus {
        onion_key: Vec<u8>,
    }
    impl Consensus for TwoAttemptConsensus {
        fn random_middle_node(&self) -> Result<RouterDescriptor> {
            Ok(router("middle"))
        }
        fn random_exit_node(&self) -> Result<RouterDescriptor> {
            Ok(router("exit"))
        }
        fn responsible_hs_directories(&self, _onion: &str) -> Vec<Box<dyn HsDirectory>> {
            vec![Box::new(TwoAttemptDirectory { onion_key: self.onion_key.clone() })]
        }
    }

    #[test]
    fn first_introduction_fails_second_succeeds_after_directory_loop() {
        let link = Arc::new(LoopbackLink { inbox: Mutex::new(Vec::new()) });
        let guard = router("guard");
        let sender = Arc::new(EstablishingSender {
            link: Arc::clone(&link),
            guard_onion_key: guard.onion_key.clone(),
            guard_mirror: Mutex::new(None),
        });
        // Must match router("intro")'s own onion_key: FakeIntroduction's
        // reply tag is checked against the onion_key the handshake was
        // actually bound to at `CircuitNode::new`, not against this value
        // directly, so the two need to agree.
        let consensus = Arc::new(TwoAttemptConsensus { onion_key: b"onion-key-intro".to_vec() });

        let circuit = Circuit::new(
            1,
            Arc::clone(&sender) as Arc<dyn Sender>,
            consensus,
            Arc::new(NoopStreams),
            CircuitParameters::default(),
        );
        circuit
            .create(guard, link.clone() as Arc<dyn GuardLink>)
            .expect("guard handshake succeeds");

        let hs = HiddenService {
            onion: "example.onion".to_string(),
            rendezvous_cookie: [5u8; 20],
        };
        circuit
            .extend_to_hidden(&hs)
            .expect("the second introduction point succeeds after the first fails");

        assert_eq!(circuit.nodes_count(), 2, "guard plus the introduction-reached hop");
        assert_eq!(
            circuit.associated_hidden_service.lock().unwrap().as_deref(),
            Some("example.onion")
        );
    }

    #[test]
    fn rendezvous_establish_timeout_surfaces_before_directories_are_tried() {
        // Since `DummyLink`/`DummySender` never deliver a
        // RELAY_RENDEZVOUS_ESTABLISHED reply, the call fails at the
        // establish step with a timeout rather than reaching the directory
        // loop at all -- this crate does not fall back to proceeding
        // without confirmation.
        let consensus = OneDirConsensus { onion_key: b"intro-key".to_vec() };
        let circuit = connected_circuit(Arc::new(consensus));
        let hs = HiddenService {
            onion: "example.onion".to_string(),
            rendezvous_cookie: [3u8; 20],
        };
        assert_matches::assert_matches!(circuit.extend_to_hidden(&hs), Err(Error::CellTimeout(_)));
    }
}
