//! Collaborator contracts the circuit core consumes but does not implement:
//! the guard link, consensus/router-selection, and stream management. See
//! the module-level docs, §6.

use std::time::Duration;

use crate::cell::TorCell;
use crate::error::Result;
use crate::node::{CircuitNode, RouterDescriptor};

/// Framed write side of the guard link. Thread-safe: callers and the
/// receive task's own writes (e.g. an emitted `RELAY_SENDME`) may both call
/// `send` concurrently.
pub trait Sender: Send + Sync {
    /// Encode and write one cell onto the guard link.
    fn send(&self, cell: TorCell) -> Result<()>;
}

/// Read side of the guard link, as driven by [`crate::receiver::Receiver`].
pub trait GuardLink: Send + Sync {
    /// Block (up to `timeout`) for at least one complete cell to become
    /// available, then return every cell that's ready without blocking
    /// further. An empty vec means the wait elapsed with nothing arriving;
    /// `None` means the link has closed.
    fn recv_cells_available(&self, timeout: Duration) -> Option<Vec<TorCell>>;
}

/// Router selection, as driven by `build_hops` and hidden-service
/// rendezvous. Actual consensus parsing and weighting is out of scope.
pub trait Consensus: Send + Sync {
    /// Pick a relay suitable for a middle hop.
    fn random_middle_node(&self) -> Result<RouterDescriptor>;
    /// Pick a relay suitable for an exit hop.
    fn random_exit_node(&self) -> Result<RouterDescriptor>;
    /// Enumerate up to 6 directories responsible for the given hidden
    /// service identity's descriptor.
    fn responsible_hs_directories(&self, onion: &str) -> Vec<Box<dyn HsDirectory>>;
}

/// One hidden-service-directory replica, as returned by
/// [`Consensus::responsible_hs_directories`].
pub trait HsDirectory: Send + Sync {
    /// Fetch the hidden service's descriptor from this directory. Fails
    /// with [`crate::error::Error::DescriptorUnavailable`] if this replica
    /// doesn't have it (callers should move on to the next directory).
    fn get_introductions(&self, onion: &str) -> Result<Vec<Box<dyn Introduction>>>;
}

/// One introduction point taken from a hidden-service descriptor.
pub trait Introduction: Send + Sync {
    /// Perform the client side of the introduction protocol: open a
    /// separate circuit to this introduction point, complete a TAP
    /// handshake against it, send `RELAY_INTRODUCE1`, and wait for
    /// `RELAY_INTRODUCE_ACK`. On success, returns the new [`CircuitNode`]
    /// to append to the rendezvous circuit.
    fn connect(&self, onion: &str) -> Result<CircuitNode>;
}

/// Owner of per-stream state; the circuit calls into this to open, close
/// and look up streams, and to forward cells to them.
pub trait StreamsManager: Send + Sync {
    /// Allocate a new stream and return its id.
    fn create_new(&self) -> u16;
    /// Close the stream with the given id, if it exists.
    fn close(&self, stream_id: u16);
    /// Whether a stream with the given id is currently registered.
    fn has_stream(&self, stream_id: u16) -> bool;
    /// Forward a relay cell to the stream with the given id. A no-op if the
    /// stream is unknown (the caller is expected to have already checked
    /// [`Self::has_stream`] and logged a warning if absent).
    fn handle_cell(&self, stream_id: u16, cell: &crate::cell::RelayedTorCell);
    /// All currently registered stream ids, as a point-in-time snapshot.
    fn stream_ids(&self) -> Vec<u16>;
}
