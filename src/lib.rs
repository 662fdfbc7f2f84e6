//! Client-side circuit construction, onion encryption and hidden-service
//! rendezvous bootstrap for a Tor client.
//!
//! This crate owns the part of a Tor client between "we have a consensus and
//! a live connection to a guard" and "we have an open, encrypted stream":
//! hop-by-hop authenticated key exchange, the onion layering that keeps each
//! hop's crypto state ordered correctly, cell dispatch to whichever stream or
//! in-flight waiter is expecting it, fixed-window flow control, and the
//! rendezvous handshake that extends a circuit to a hidden service's
//! introduction point.
//!
//! Cell wire encoding, consensus parsing and weighting, and the guard
//! connection itself are external collaborators this crate consumes but
//! does not implement; see [`external`].

// @@ begin lint list maintained by maint/add_warning @@
#![allow(renamed_and_removed_lints)]
#![allow(unknown_lints)]
#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![deny(clippy::unchecked_duration_subtraction)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::uninlined_format_args)]
//! <!-- @@ end lint list maintained by maint/add_warning @@ -->

pub mod cell;
pub mod circuit;
pub mod config;
pub mod crypto;
pub mod error;
pub mod external;
pub mod handler;
pub mod manager;
pub mod node;
pub mod receiver;
pub mod rendezvous;
pub mod waiter;

pub use circuit::{Circuit, CircuitState};
pub use config::CircuitParameters;
pub use error::{Error, Result};
pub use manager::CircuitsManager;
pub use rendezvous::HiddenService;
