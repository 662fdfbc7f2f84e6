//! Registry from cell kind to handlers, and the scoped-waiter resource that
//! builds on it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{trace, warn};

use crate::cell::{CellKind, RelayedTorCell, TorCell};
use crate::error::Result;
use crate::node::CircuitNode;
use crate::waiter::Waiter;

/// A persistent callback invoked for every cell of a subscribed kind.
///
/// Invoked with `(cell, from_node, orig_cell)` when the dispatch call
/// supplied a `from_node` (i.e. for relay cells that have been onion-peeled
/// down to a specific hop); otherwise only `cell` is meaningful and
/// `from_node`/`orig_cell` are `None`.
pub type Handler = Arc<dyn Fn(&TorCell, Option<&CircuitNode>, Option<&RelayedTorCell>) + Send + Sync>;

/// One entry in a cell kind's handler list: either a persistent handler or a
/// one-shot waiter.
enum Entry {
    /// Stays registered across dispatches until explicitly unsubscribed.
    Persistent(Handler),
    /// Removed from the live list the first time it is dispatched to.
    Waiter(Waiter),
}

/// Registry from cell kind to an ordered list of handlers, shared between
/// the receive task (dispatch) and caller threads (subscribe/unsubscribe).
#[derive(Default)]
pub struct CellHandlerManager {
    table: Mutex<HashMap<CellKind, Vec<Entry>>>,
}

impl CellHandlerManager {
    /// Create an empty handler registry.
    pub fn new() -> Self {
        CellHandlerManager {
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe `handler` to every kind in `kinds`.
    pub fn subscribe(&self, kinds: &[CellKind], handler: Handler) {
        let mut table = self.table.lock().expect("handler table poisoned");
        for kind in kinds {
            table
                .entry(*kind)
                .or_default()
                .push(Entry::Persistent(handler.clone()));
        }
    }

    /// Remove `handler` from every kind in `kinds`.
    ///
    /// Handlers are compared by pointer identity (`Arc::ptr_eq`); this
    /// matches the intent of the source's object-identity-based
    /// unsubscribe.
    pub fn unsubscribe(&self, kinds: &[CellKind], handler: &Handler) {
        let mut table = self.table.lock().expect("handler table poisoned");
        for kind in kinds {
            if let Some(list) = table.get_mut(kind) {
                list.retain(|entry| match entry {
                    Entry::Persistent(h) => !Arc::ptr_eq(h, handler),
                    Entry::Waiter(_) => true,
                });
            }
        }
    }

    /// Register a one-shot [`Waiter`] for any of `kinds`.
    fn subscribe_waiter(&self, kinds: &[CellKind], waiter: Waiter) {
        let mut table = self.table.lock().expect("handler table poisoned");
        for kind in kinds {
            table
                .entry(*kind)
                .or_default()
                .push(Entry::Waiter(waiter.clone()));
        }
    }

    /// Remove a specific waiter from every kind in `kinds`. A no-op if it
    /// has already been removed by a prior dispatch.
    fn unsubscribe_waiter(&self, kinds: &[CellKind], waiter: &Waiter) {
        let mut table = self.table.lock().expect("handler table poisoned");
        for kind in kinds {
            if let Some(list) = table.get_mut(kind) {
                list.retain(|entry| match entry {
                    Entry::Waiter(w) => !w.ptr_eq(waiter),
                    Entry::Persistent(_) => true,
                });
            }
        }
    }

    /// Acquire a scoped one-shot waiter for any of `kinds`: it is
    /// subscribed immediately and guaranteed to be unsubscribed on every
    /// exit path of the returned guard, including a timed-out or failed
    /// `await`.
    pub fn scoped_waiter(self: &Arc<Self>, kinds: &[CellKind]) -> ScopedWaiter {
        let waiter = Waiter::new(kinds);
        self.subscribe_waiter(kinds, waiter.clone());
        ScopedWaiter {
            manager: Arc::clone(self),
            kinds: kinds.to_vec(),
            waiter,
        }
    }

    /// Dispatch `cell` to every handler registered for `type(cell)`.
    ///
    /// Iterates a snapshot of the handler list, so a handler that
    /// subscribes a new handler during dispatch does not see the current
    /// cell (documented open question, left as-is — see DESIGN.md). Waiters
    /// are completed and removed atomically with this dispatch; at most one
    /// waiter is woken per cell kind per call, since a waiter is one-shot.
    /// An unrecognised cell kind (no registered handlers at all) is logged
    /// and dropped, never treated as fatal.
    pub fn dispatch(
        &self,
        cell: &TorCell,
        from_node: Option<&CircuitNode>,
        orig_cell: Option<&RelayedTorCell>,
    ) {
        let snapshot: Vec<HandlerRef> = {
            let mut table = self.table.lock().expect("handler table poisoned");
            let Some(list) = table.get_mut(&cell.kind) else {
                warn!(kind = %cell.kind, "no handler registered for cell kind; dropping");
                return;
            };
            if list.is_empty() {
                warn!(kind = %cell.kind, "no handler registered for cell kind; dropping");
                return;
            }
            // Remove waiters from the live list now (they're one-shot); keep
            // persistent handlers in place.
            let mut snapshot = Vec::with_capacity(list.len());
            list.retain(|entry| match entry {
                Entry::Persistent(h) => {
                    snapshot.push(HandlerRef::Persistent(h.clone()));
                    true
                }
                Entry::Waiter(w) => {
                    snapshot.push(HandlerRef::Waiter(w.clone()));
                    false
                }
            });
            snapshot
        };

        for entry in snapshot {
            match entry {
                HandlerRef::Persistent(handler) => {
                    trace!(kind = %cell.kind, "dispatching to persistent handler");
                    // A handler that unwinds would otherwise kill the
                    // receive loop; this crate's handlers are plain Rust
                    // closures (no unwind boundary needed in practice), but
                    // we keep the spec's "exceptions never stop dispatch"
                    // property explicit by catching panics here too.
                    let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        handler(cell, from_node, orig_cell);
                    }));
                }
                HandlerRef::Waiter(waiter) => {
                    trace!(kind = %cell.kind, "completing waiter");
                    waiter.complete(cell.clone());
                }
            }
        }
    }

    /// Abort every waiter registered for any cell kind with `reason`. Used
    /// by circuit teardown to unblock in-flight `await`s with
    /// [`crate::error::Error::WaiterFailed`] rather than leaving them to
    /// time out.
    pub fn fail_all_waiters(&self, reason: &str) {
        let table = self.table.lock().expect("handler table poisoned");
        for list in table.values() {
            for entry in list {
                if let Entry::Waiter(w) = entry {
                    w.fail(reason.to_string());
                }
            }
        }
    }
}

/// A snapshot reference used while iterating dispatch so the lock is not
/// held across handler invocation.
enum HandlerRef {
    /// Mirrors [`Entry::Persistent`]; invoked via `handler(..)`.
    Persistent(Handler),
    /// Mirrors [`Entry::Waiter`]; invoked via `waiter.complete(..)`.
    Waiter(Waiter),
}

/// A scoped acquisition of a one-shot [`Waiter`]: unsubscribes on every exit
/// path, including a timed-out or failed `await_cell`.
pub struct ScopedWaiter {
    manager: Arc<CellHandlerManager>,
    kinds: Vec<CellKind>,
    waiter: Waiter,
}

impl ScopedWaiter {
    /// Block for a matching cell, with the given timeout. Whatever the
    /// outcome, the waiter is unsubscribed before returning.
    pub fn await_cell(&self, timeout: std::time::Duration) -> Result<TorCell> {
        self.waiter.wait(timeout)
    }

    /// Block for a matching cell with the default 30s timeout.
    pub fn await_cell_default(&self) -> Result<TorCell> {
        self.waiter.wait_default()
    }
}

impl Drop for ScopedWaiter {
    fn drop(&mut self) {
        self.manager.unsubscribe_waiter(&self.kinds, &self.waiter);
    }
}
