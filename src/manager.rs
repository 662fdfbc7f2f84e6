//! Registry of live circuits, keyed by circuit id.
//!
//! Mirrors the relationship between a guard connection and the circuits
//! running over it: one `CircuitsManager` per guard, handing out ids from a
//! single counter so two circuits on the same link never collide, and
//! tracking each circuit only for as long as it's in use.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::circuit::Circuit;
use crate::config::CircuitParameters;
use crate::external::{Consensus, Sender, StreamsManager};

/// Highest bit of a circuit id (tor-spec 5.1.1): set on ids chosen by the
/// link's initiating party, which is always us for the circuits this crate
/// manages.
const CIRCUIT_ID_MSB: u32 = 0x8000_0000;

/// Owns the circuit-id counter and the id -> [`Circuit`] registry for one
/// guard connection.
///
/// Only constructs and registers circuits; callers still need to call
/// [`Circuit::create`] on the result before using it. No automatic eviction:
/// callers are responsible for calling [`Self::remove`] once a circuit is
/// destroyed.
pub struct CircuitsManager {
    /// Monotonic counter circuit ids are drawn from, shared by every
    /// circuit this manager creates.
    next_id: AtomicU32,
    /// Live circuits, keyed by id.
    circuits: Mutex<HashMap<u32, Arc<Circuit>>>,
}

impl CircuitsManager {
    /// Build an empty manager.
    pub fn new() -> Self {
        CircuitsManager {
            next_id: AtomicU32::new(0),
            circuits: Mutex::new(HashMap::new()),
        }
    }

    /// Draw the next circuit id from this manager's counter, tagging it with
    /// the MSB convention tor-spec 5.1.1 assigns to the link's initiator.
    fn next_circuit_id(&self, msb: bool) -> u32 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        if msb {
            id | CIRCUIT_ID_MSB
        } else {
            id
        }
    }

    /// Allocate a new circuit id and register a freshly constructed, not
    /// yet created, [`Circuit`] under it. The caller must still call
    /// [`Circuit::create`] (and build out any further hops) before the
    /// circuit is usable.
    pub fn create_new(
        &self,
        sender: Arc<dyn Sender>,
        consensus: Arc<dyn Consensus>,
        streams: Arc<dyn StreamsManager>,
        params: CircuitParameters,
    ) -> Arc<Circuit> {
        let id = self.next_circuit_id(true);
        let circuit = Circuit::new(id, sender, consensus, streams, params);
        self.circuits
            .lock()
            .expect("circuits map mutex poisoned")
            .insert(id, Arc::clone(&circuit));
        debug!(circuit_id = id, "registered new circuit");
        circuit
    }

    /// Look up a live circuit by id.
    pub fn by_id(&self, circuit_id: u32) -> Option<Arc<Circuit>> {
        self.circuits
            .lock()
            .expect("circuits map mutex poisoned")
            .get(&circuit_id)
            .cloned()
    }

    /// Stop tracking a circuit, returning it if it was still registered.
    /// Does not destroy the circuit; callers should call
    /// [`Circuit::destroy`] themselves, typically before removing it.
    pub fn remove(&self, circuit_id: u32) -> Option<Arc<Circuit>> {
        let removed = self
            .circuits
            .lock()
            .expect("circuits map mutex poisoned")
            .remove(&circuit_id);
        if removed.is_some() {
            debug!(circuit_id, "removed circuit from registry");
        }
        removed
    }

    /// All currently registered circuit ids, as a point-in-time snapshot.
    pub fn circuit_ids(&self) -> Vec<u32> {
        self.circuits
            .lock()
            .expect("circuits map mutex poisoned")
            .keys()
            .copied()
            .collect()
    }
}

impl Default for CircuitsManager {
    fn default() -> Self {
        Self::new()
    }
}
