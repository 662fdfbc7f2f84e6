//! Tunable circuit parameters.
//!
//! tor-spec leaves several of these to the consensus (`circwindow`,
//! `circwindow_inc`, the SENDME threshold); a real client reads them from
//! [`crate::external::Consensus`] and rebuilds this struct per-circuit. This
//! crate hardcodes the long-standing consensus defaults so a circuit can be
//! built without a live consensus for testing.

use std::time::Duration;

/// Circuit-wide tunables, overridable from consensus parameters.
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub struct CircuitParameters {
    /// Starting value of each hop's flow-control window. tor-spec
    /// `circwindow`, 1000 cells.
    pub window_start: i32,
    /// How much a `RELAY_SENDME` replenishes a window by. tor-spec
    /// `circwindow_inc`, 100 cells.
    pub window_increment: i32,
    /// How long a [`crate::waiter::Waiter`] blocks before giving up, absent a
    /// more specific timeout.
    pub default_timeout: Duration,
    /// How many hidden-service directory replicas to try before giving up on
    /// a rendezvous attempt.
    pub directory_fanout: usize,
}

impl CircuitParameters {
    /// The deliver-window value at which a circuit-level `RELAY_SENDME`
    /// should be emitted: `window_start - window_increment`.
    pub fn sendme_threshold(&self) -> i32 {
        self.window_start - self.window_increment
    }
}

impl Default for CircuitParameters {
    fn default() -> Self {
        CircuitParameters {
            window_start: crate::node::WINDOW_START,
            window_increment: crate::node::WINDOW_INCREMENT,
            default_timeout: crate::waiter::DEFAULT_TIMEOUT,
            directory_fanout: 6,
        }
    }
}
