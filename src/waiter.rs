//! A one-shot synchronization primitive used to block a caller until a
//! matching cell arrives, a failure is signalled, or a timeout elapses.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::cell::{CellKind, TorCell};
use crate::error::{Error, Result};

/// Render a set of expected cell kinds the way they should appear in a
/// [`Error::CellTimeout`] message.
fn expected_label(kinds: &[CellKind]) -> String {
    kinds
        .iter()
        .map(|k| k.to_string())
        .collect::<Vec<_>>()
        .join(" or ")
}

/// Default time a caller will block in [`Waiter::wait`] before giving up.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// The terminal outcome of a waiter, once one has occurred.
enum Outcome {
    /// A matching cell arrived.
    Completed(TorCell),
    /// The waiter was explicitly failed (e.g. the circuit was destroyed).
    Failed(String),
}

/// Shared state between a [`Waiter`] and whoever calls [`Waiter::complete`]
/// or [`Waiter::fail`] on it (typically [`crate::handler::CellHandlerManager`]).
struct Inner {
    outcome: Mutex<Option<Outcome>>,
    condvar: Condvar,
}

/// A single-shot wait for one of a set of cell kinds.
///
/// Behavior after the first terminal event (`complete`, `fail`, or a timed
/// out `wait`) is undefined beyond "won't panic" — callers should treat a
/// `Waiter` as consumed after its first `wait`.
#[derive(Clone)]
pub struct Waiter {
    inner: Arc<Inner>,
    /// Human-readable label for the cell kind(s) this waiter was created
    /// for, used only to build a [`Error::CellTimeout`] message.
    expected: String,
}

impl Waiter {
    /// Create a new, unresolved waiter for any of `kinds`.
    pub fn new(kinds: &[CellKind]) -> Self {
        Waiter {
            inner: Arc::new(Inner {
                outcome: Mutex::new(None),
                condvar: Condvar::new(),
            }),
            expected: expected_label(kinds),
        }
    }

    /// Deliver a matching cell to this waiter, waking up its caller.
    ///
    /// A no-op if the waiter has already reached a terminal outcome.
    pub fn complete(&self, cell: TorCell) {
        let mut outcome = self.inner.outcome.lock().expect("waiter mutex poisoned");
        if outcome.is_none() {
            *outcome = Some(Outcome::Completed(cell));
            self.inner.condvar.notify_all();
        }
    }

    /// Abort this waiter with a local failure reason, waking up its caller
    /// with [`Error::WaiterFailed`].
    ///
    /// A no-op if the waiter has already reached a terminal outcome.
    pub fn fail(&self, reason: impl Into<String>) {
        let mut outcome = self.inner.outcome.lock().expect("waiter mutex poisoned");
        if outcome.is_none() {
            *outcome = Some(Outcome::Failed(reason.into()));
            self.inner.condvar.notify_all();
        }
    }

    /// Block until this waiter is completed, failed, or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Result<TorCell> {
        let deadline = Instant::now() + timeout;
        let mut outcome = self.inner.outcome.lock().expect("waiter mutex poisoned");
        loop {
            match outcome.take() {
                Some(Outcome::Completed(cell)) => return Ok(cell),
                Some(Outcome::Failed(reason)) => return Err(Error::WaiterFailed(reason)),
                None => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::CellTimeout(self.expected.clone()));
                    }
                    let (guard, timeout_result) = self
                        .inner
                        .condvar
                        .wait_timeout(outcome, deadline - now)
                        .expect("waiter mutex poisoned");
                    outcome = guard;
                    if timeout_result.timed_out() && outcome.is_none() {
                        return Err(Error::CellTimeout(self.expected.clone()));
                    }
                }
            }
        }
    }

    /// Block with the default 30-second timeout. See [`Self::wait`].
    pub fn wait_default(&self) -> Result<TorCell> {
        self.wait(DEFAULT_TIMEOUT)
    }

    /// Whether `self` and `other` refer to the same underlying waiter.
    pub fn ptr_eq(&self, other: &Waiter) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn complete_unblocks_wait() {
        let waiter = Waiter::new(&[CellKind::Created2]);
        let w2 = waiter.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            w2.complete(TorCell::new(CellKind::Created2, 1, vec![1, 2, 3]));
        });
        let cell = waiter
            .wait(Duration::from_secs(5))
            .expect("should be completed in time");
        assert_eq!(cell.payload, vec![1, 2, 3]);
        handle.join().unwrap();
    }

    #[test]
    fn fail_surfaces_waiter_failed() {
        let waiter = Waiter::new(&[CellKind::Created2]);
        waiter.fail("circuit destroyed");
        let err = waiter.wait(Duration::from_secs(1)).unwrap_err();
        assert_matches::assert_matches!(err, Error::WaiterFailed(reason) if reason == "circuit destroyed");
    }

    #[test]
    fn timeout_surfaces_cell_timeout() {
        let waiter = Waiter::new(&[CellKind::Created2]);
        let err = waiter.wait(Duration::from_millis(10)).unwrap_err();
        assert_matches::assert_matches!(err, Error::CellTimeout(_));
    }

    #[test]
    fn complete_after_fail_is_ignored() {
        let waiter = Waiter::new(&[CellKind::Created2]);
        waiter.fail("first");
        waiter.complete(TorCell::new(CellKind::Created2, 1, vec![]));
        let err = waiter.wait(Duration::from_secs(1)).unwrap_err();
        assert_matches::assert_matches!(err, Error::WaiterFailed(reason) if reason == "first");
    }
}
