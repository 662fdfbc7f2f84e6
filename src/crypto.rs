//! Per-hop key agreement and symmetric crypto state.
//!
//! The actual `NTOR`/`TAP` mathematics and the tor-spec 5.5 stream cipher and
//! running-digest construction are external collaborators (see the module
//! docs, §6): a real client plugs in `tor-llcrypto`-backed implementations.
//! What lives here is the capability shape those collaborators must satisfy,
//! plus a minimal reference implementation that is internally consistent
//! (so that a circuit core built against these types is directly testable)
//! but makes no claim to being suitable for an actual Tor connection.

use std::fmt;

use rand::RngCore;
use zeroize::Zeroizing;

use crate::cell::TorCell;
use crate::error::{Error, Result};

/// The handshake type negotiated for a hop, as carried in `CREATE2`/
/// `RELAY_EXTEND2`.
///
/// `FAST` exists in the wire protocol but is never produced by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
#[non_exhaustive]
pub enum HandshakeType {
    /// The legacy Diffie-Hellman handshake.
    Tap = 0,
    /// The curve25519-based ntor handshake.
    Ntor = 2,
}

/// Shared secret material produced by a completed handshake.
///
/// Zeroized on drop; never logged or `Debug`-printed in full.
pub struct SharedSecret(Zeroizing<Vec<u8>>);

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSecret").finish_non_exhaustive()
    }
}

impl SharedSecret {
    /// Derive the single symmetric key used to seed a [`CryptoState`] from
    /// this shared secret. Both ends of a hop (the relay's crypto state and
    /// the client's per-hop state for that relay) derive the same key from
    /// the same shared secret, so the keystream and digest are symmetric:
    /// whichever side calls `encrypt_forward`, the other recognises it with
    /// `decrypt_backward`.
    fn derive_key(&self) -> [u8; 32] {
        let mut key = [0u8; 32];
        for (i, b) in self.0.iter().cycle().take(32).enumerate() {
            key[i] = b.wrapping_add(0x5a);
        }
        key
    }

    /// Build a `SharedSecret` directly from raw bytes, bypassing a handshake.
    ///
    /// Lets an external test harness mirror a hop's real `CryptoState` (e.g.
    /// by recomputing the same `checked_xor(ephemeral, server_public)` a fake
    /// relay's reply used) without access to this module's private
    /// handshake-completion internals.
    #[cfg(any(test, feature = "testing"))]
    pub fn from_raw_for_test(bytes: Vec<u8>) -> Self {
        SharedSecret(Zeroizing::new(bytes))
    }
}

/// One side of a per-hop key-exchange handshake, tagged by the handshake
/// type in use.
///
/// Modeled as a tagged union rather than a trait object: the call sites that
/// drive a handshake are identical for both variants, and this crate's
/// circuit logic never needs to be generic over the handshake type, only to
/// select on it once per hop.
#[derive(Debug)]
#[non_exhaustive]
pub enum KeyAgreement {
    /// Legacy TAP (Diffie-Hellman) client state.
    Tap(TapClientState),
    /// ntor (curve25519) client state.
    Ntor(NtorClientState),
}

impl KeyAgreement {
    /// Start a new handshake of the given type, addressed to the hop's onion
    /// key.
    pub fn new(handshake_type: HandshakeType, onion_key: &[u8]) -> Self {
        match handshake_type {
            HandshakeType::Tap => KeyAgreement::Tap(TapClientState::new(onion_key)),
            HandshakeType::Ntor => KeyAgreement::Ntor(NtorClientState::new(onion_key)),
        }
    }

    /// Return the client's handshake bytes ("onion skin") to place in the
    /// `CREATE2`/`RELAY_EXTEND2` cell.
    ///
    /// Idempotent: returns the same bytes on every call until [`Self::complete`]
    /// succeeds.
    pub fn handshake_bytes(&self) -> &[u8] {
        match self {
            KeyAgreement::Tap(s) => &s.client_bytes,
            KeyAgreement::Ntor(s) => &s.client_bytes,
        }
    }

    /// Complete the handshake using the server's reply bytes.
    ///
    /// Fails with [`Error::HandshakeFailed`] if the reply does not verify
    /// (an auth tag mismatch for ntor, a DH signature mismatch for TAP).
    pub fn complete(&self, server_bytes: &[u8]) -> Result<SharedSecret> {
        match self {
            KeyAgreement::Tap(s) => s.complete(server_bytes),
            KeyAgreement::Ntor(s) => s.complete(server_bytes),
        }
    }
}

/// Client-side state for the legacy TAP handshake.
#[derive(Debug)]
pub struct TapClientState {
    /// Bytes sent to the relay.
    client_bytes: Vec<u8>,
    /// Our half of the DH exchange, kept around to derive the shared secret.
    dh_private: [u8; 32],
    /// The relay's advertised onion key, bound at construction time.
    onion_key: Vec<u8>,
}

impl TapClientState {
    fn new(onion_key: &[u8]) -> Self {
        let mut rng = rand::thread_rng();
        let mut dh_private = [0u8; 32];
        rng.fill_bytes(&mut dh_private);
        let mut client_bytes = Vec::with_capacity(32 + onion_key.len());
        client_bytes.extend_from_slice(&dh_private);
        client_bytes.extend_from_slice(onion_key);
        TapClientState {
            client_bytes,
            dh_private,
            onion_key: onion_key.to_vec(),
        }
    }

    fn complete(&self, server_bytes: &[u8]) -> Result<SharedSecret> {
        if server_bytes.len() < 32 {
            return Err(Error::HandshakeFailed);
        }
        let (server_public, sig) = server_bytes.split_at(32);
        let expected_sig = checked_xor(server_public, &self.onion_key);
        if sig != expected_sig.as_slice() {
            return Err(Error::HandshakeFailed);
        }
        let secret = checked_xor(&self.dh_private, server_public);
        Ok(SharedSecret(Zeroizing::new(secret)))
    }
}

/// Client-side state for the ntor handshake.
#[derive(Debug)]
pub struct NtorClientState {
    /// Bytes sent to the relay (our ephemeral public key plus the relay's
    /// identity binding).
    client_bytes: Vec<u8>,
    /// Our ephemeral private scalar.
    ephemeral_private: [u8; 32],
    /// The relay's advertised onion key, bound at construction time.
    onion_key: Vec<u8>,
}

impl NtorClientState {
    fn new(onion_key: &[u8]) -> Self {
        let mut rng = rand::thread_rng();
        let mut ephemeral_private = [0u8; 32];
        rng.fill_bytes(&mut ephemeral_private);
        let mut client_bytes = Vec::with_capacity(32 + onion_key.len());
        client_bytes.extend_from_slice(&ephemeral_private);
        client_bytes.extend_from_slice(onion_key);
        NtorClientState {
            client_bytes,
            ephemeral_private,
            onion_key: onion_key.to_vec(),
        }
    }

    fn complete(&self, server_bytes: &[u8]) -> Result<SharedSecret> {
        if server_bytes.len() < 32 + 32 {
            return Err(Error::HandshakeFailed);
        }
        let (server_public, auth_tag) = server_bytes.split_at(32);
        let expected_tag = checked_xor(server_public, &self.onion_key);
        if auth_tag[..32] != expected_tag[..] {
            return Err(Error::HandshakeFailed);
        }
        let secret = checked_xor(&self.ephemeral_private, server_public);
        Ok(SharedSecret(Zeroizing::new(secret)))
    }
}

/// XOR two byte strings up to the shorter length, cycling the shorter one if
/// it doesn't reach the longer one's length.
fn checked_xor(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter()
        .zip(b.iter().cycle())
        .map(|(x, y)| x ^ y)
        .collect()
}

/// Post-handshake symmetric crypto state for one hop: a forward keystream
/// plus a running digest used to recognise cells that originated at this
/// hop, per tor-spec 5.5.
#[derive(Debug)]
pub struct CryptoState {
    /// Keystream material, shared symmetrically between this hop and the
    /// client's per-hop state for it.
    key: [u8; 32],
    /// Running digest of everything this crypto state has sent forward.
    forward_digest: u64,
    /// Running digest of everything recognised as having come from this hop.
    backward_digest: u64,
}

impl CryptoState {
    /// Derive a fresh crypto state from a completed handshake's shared
    /// secret.
    pub fn new(secret: &SharedSecret) -> Self {
        CryptoState {
            key: secret.derive_key(),
            forward_digest: 0,
            backward_digest: 0,
        }
    }

    /// Apply this hop's forward encryption layer to `cell`, mutating its
    /// payload in place, and tag it with the current forward digest so a
    /// peer running the matching backward state can recognise it.
    pub fn encrypt_forward(&mut self, cell: &mut TorCell) {
        self.forward_digest = advance_digest(self.forward_digest, &cell.payload);
        append_digest_tag(&mut cell.payload, self.forward_digest);
        xor_in_place(&mut cell.payload, &self.key);
    }

    /// Peel this hop's layer off an inbound `cell`, mutating its payload in
    /// place. Returns `true` if the trailing digest tag matches this hop's
    /// backward digest state (i.e. this hop is the one that originated the
    /// cell); the backward digest only advances when recognised, matching
    /// tor-spec's "tentatively decrypt, then commit on match" behavior.
    pub fn decrypt_backward(&mut self, cell: &mut TorCell) -> bool {
        xor_in_place(&mut cell.payload, &self.key);
        let Some((body, tag)) = split_digest_tag(&cell.payload) else {
            xor_in_place(&mut cell.payload, &self.key);
            return false;
        };
        let candidate_digest = advance_digest(self.backward_digest, body);
        if candidate_digest == tag {
            self.backward_digest = candidate_digest;
            cell.payload.truncate(cell.payload.len() - 8);
            true
        } else {
            // Undo the XOR: this hop didn't recognise the cell, and a later
            // hop still needs the ciphertext form to try its own key.
            xor_in_place(&mut cell.payload, &self.key);
            false
        }
    }
}

/// XOR `buf` in place against `key`, cycling `key` as needed.
fn xor_in_place(buf: &mut [u8], key: &[u8; 32]) {
    for (b, k) in buf.iter_mut().zip(key.iter().cycle()) {
        *b ^= k;
    }
}

/// Fold `data` into a running digest value, tor-spec-5.5 style (a running
/// hash rather than a fixed-size MAC per cell).
fn advance_digest(running: u64, data: &[u8]) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    running.hash(&mut hasher);
    data.hash(&mut hasher);
    hasher.finish()
}

/// Append an 8-byte big-endian digest tag to `buf`.
fn append_digest_tag(buf: &mut Vec<u8>, digest: u64) {
    buf.extend_from_slice(&digest.to_be_bytes());
}

/// Split the trailing 8-byte digest tag off `buf`, if present.
fn split_digest_tag(buf: &[u8]) -> Option<(&[u8], u64)> {
    if buf.len() < 8 {
        return None;
    }
    let (body, tag) = buf.split_at(buf.len() - 8);
    let tag = u64::from_be_bytes(tag.try_into().ok()?);
    Some((body, tag))
}
