//! The single background task that reads framed cells from the guard link
//! and feeds them to a [`CellHandlerManager`], plus the self-pipe control
//! signal used to stop it.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver as MpscReceiver, Sender as MpscSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::cell::RelayedTorCell;
use crate::external::GuardLink;
use crate::handler::CellHandlerManager;

/// How long the receive loop waits on the guard link between checks of its
/// control channel. The control channel is itself a genuine wakeup (a
/// self-pipe), so this is only a safety net in case a `GuardLink`
/// implementation's `recv_cells_available` doesn't wake promptly on close.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// A callback invoked when a data cell for a registered stream arrives.
pub type StreamReadCallback = Arc<dyn Fn(&RelayedTorCell) + Send + Sync>;

/// Signal sent on the self-pipe control channel.
enum Control {
    /// Exit the receive loop after this is observed.
    Stop,
}

/// Per-guard-link background reader.
///
/// Multiplexes two readiness sources: the guard link's framed cell stream
/// and an internal control channel used only to stop it. A slow or
/// misbehaving handler never blocks cell delivery, because dispatch
/// (`CellHandlerManager::dispatch`) never itself blocks on a caller.
pub struct Receiver {
    control_tx: MpscSender<Control>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
    /// The receive thread's id, captured at spawn time so [`Self::stop`] can
    /// tell whether it is being called from that very thread (e.g. a
    /// dispatched handler tearing down the circuit it was invoked from) and
    /// skip `join`, which would otherwise deadlock a thread joining itself.
    receiver_thread: thread::ThreadId,
    stream_callbacks: Arc<Mutex<HashMap<u16, Vec<StreamReadCallback>>>>,
}

impl Receiver {
    /// Start the background receive task for `link`, dispatching through
    /// `handlers`.
    pub fn start(link: Arc<dyn GuardLink>, handlers: Arc<CellHandlerManager>) -> Arc<Self> {
        let (control_tx, control_rx) = mpsc::channel();
        let stream_callbacks: Arc<Mutex<HashMap<u16, Vec<StreamReadCallback>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let join_handle = {
            let handlers = Arc::clone(&handlers);
            thread::Builder::new()
                .name("tor-circuit-receiver".into())
                .spawn(move || Self::run(link, handlers, control_rx))
                .expect("failed to spawn receiver thread")
        };
        let receiver_thread = join_handle.thread().id();

        Arc::new(Receiver {
            control_tx,
            join_handle: Mutex::new(Some(join_handle)),
            receiver_thread,
            stream_callbacks,
        })
    }

    /// The body of the receive loop: run until the control channel fires.
    fn run(
        link: Arc<dyn GuardLink>,
        handlers: Arc<CellHandlerManager>,
        control_rx: MpscReceiver<Control>,
    ) {
        loop {
            if matches!(control_rx.try_recv(), Ok(Control::Stop)) {
                debug!("receive loop: stop signal received, exiting");
                return;
            }
            match link.recv_cells_available(POLL_INTERVAL) {
                None => {
                    debug!("guard link closed, exiting receive loop");
                    return;
                }
                Some(cells) => {
                    for cell in cells {
                        trace!(kind = %cell.kind, "dispatching cell from guard link");
                        handlers.dispatch(&cell, None, None);
                    }
                }
            }
        }
    }

    /// Signal the receive task to stop and wait for it to exit.
    ///
    /// Idempotent and safe to call from any thread; a second call after the
    /// task has already exited is a no-op. Called from the receive thread
    /// itself (a handler dispatched for a remote teardown cell tearing down
    /// its own circuit), this only signals and does not join: a thread
    /// cannot join itself, and the signal alone is enough, since the loop
    /// will see it and exit right after the handler that called us returns.
    pub fn stop(&self) {
        let mut guard = self.join_handle.lock().expect("receiver mutex poisoned");
        if let Some(handle) = guard.take() {
            // The send can fail if the thread already exited (e.g. the
            // guard link closed on its own); that's fine, we still join.
            let _ = self.control_tx.send(Control::Stop);
            if thread::current().id() == self.receiver_thread {
                debug!("stop() called from the receiver thread itself; signalling without joining");
                return;
            }
            let _ = handle.join();
        }
    }

    /// Register `callback` to be invoked whenever a data cell for
    /// `stream_id` is dispatched. Multiple callbacks per stream are
    /// delivered in registration order.
    pub fn register_stream(&self, stream_id: u16, callback: StreamReadCallback) {
        self.stream_callbacks
            .lock()
            .expect("stream callback map poisoned")
            .entry(stream_id)
            .or_default()
            .push(callback);
    }

    /// Remove all callbacks registered for `stream_id`.
    pub fn unregister_stream(&self, stream_id: u16) {
        self.stream_callbacks
            .lock()
            .expect("stream callback map poisoned")
            .remove(&stream_id);
    }

    /// Notify every callback registered for `cell.stream_id`, if any. Called
    /// by [`crate::circuit::Circuit::on_stream`] after its own bookkeeping.
    pub fn notify_stream(&self, cell: &RelayedTorCell) {
        let callbacks = {
            let map = self.stream_callbacks.lock().expect("stream callback map poisoned");
            map.get(&cell.stream_id).cloned()
        };
        match callbacks {
            Some(callbacks) => {
                for cb in callbacks {
                    cb(cell);
                }
            }
            None => warn!(stream_id = cell.stream_id, "no read callback registered for stream"),
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.stop();
    }
}
