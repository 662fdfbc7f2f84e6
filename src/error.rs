//! Define an error type for the `tor-circuit-core` crate.

use thiserror::Error;
use tor_error::{ErrorKind, HasKind};

/// A result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error produced while building or operating a circuit.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A scoped wait for a particular cell type timed out. Carries a
    /// human-readable name of the cell kind(s) that were expected.
    #[error("timed out waiting for {0}")]
    CellTimeout(String),

    /// A waiter was aborted before its wait completed, typically because the
    /// circuit it was waiting on was torn down.
    #[error("wait aborted: {0}")]
    WaiterFailed(String),

    /// The server's handshake response did not verify.
    #[error("circuit handshake failed")]
    HandshakeFailed,

    /// An EXTEND was refused by the peer with a TRUNCATED cell.
    #[error("circuit could not be extended: {0}")]
    CircuitExtendFailed(String),

    /// The circuit has not finished its first-hop handshake yet.
    #[error("circuit is not connected")]
    CircuitNotConnected,

    /// The circuit has already been torn down.
    #[error("circuit is destroyed")]
    CircuitDestroyed,

    /// Tried to pin a circuit to a hidden service it isn't already
    /// associated with.
    #[error("circuit is already associated with a different hidden service")]
    AlreadyAssociated,

    /// A hidden-service descriptor could not be fetched from a particular
    /// responsible directory; recoverable by trying the next directory.
    #[error("descriptor unavailable from this directory")]
    DescriptorUnavailable,

    /// Every responsible directory and introduction point was exhausted
    /// without success.
    #[error("hidden service unreachable")]
    HiddenServiceUnreachable,

    /// A cell of an unexpected kind arrived where a specific kind was
    /// required (e.g. `CREATE2`'s reply was not `CREATED2`/`DESTROY`).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// We tried to operate on a hop index that doesn't exist on this
    /// circuit.
    #[error("no such hop")]
    NoSuchHop,

    /// Something downstream in the guard link failed.
    #[error("guard link error: {0}")]
    LinkError(String),
}

impl HasKind for Error {
    fn kind(&self) -> ErrorKind {
        use Error as E;
        match self {
            E::CellTimeout(_) => ErrorKind::TorAccessFailed,
            E::WaiterFailed(_) => ErrorKind::CircuitCollapse,
            E::HandshakeFailed => ErrorKind::TorAccessFailed,
            E::CircuitExtendFailed(_) => ErrorKind::CircuitCollapse,
            E::CircuitNotConnected | E::CircuitDestroyed => ErrorKind::BadApiUsage,
            E::AlreadyAssociated => ErrorKind::BadApiUsage,
            E::DescriptorUnavailable => ErrorKind::TorDirectoryError,
            E::HiddenServiceUnreachable => ErrorKind::OnionServiceNotFound,
            E::Protocol(_) => ErrorKind::TorProtocolViolation,
            E::NoSuchHop => ErrorKind::BadApiUsage,
            E::LinkError(_) => ErrorKind::TorAccessFailed,
        }
    }
}
