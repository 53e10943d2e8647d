//! Interface to the reference-counted payload store.
//!
//! The queue engine never stores message bodies. Every durable or in-memory
//! publish holds exactly one reference on its payload handle; the engine's
//! obligation is one increment per residency and one decrement per leaving.

use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::warn;

/// Consumed interface of the payload store.
pub trait PayloadPersistence: Send + Sync {
    /// Re-register a reference found during the startup scan.
    fn increment_reference_counter_on_bootstrap(&self, payload_id: u64);

    /// Release one reference; the store frees the blob at zero.
    fn decrement_reference_counter(&self, payload_id: u64);
}

/// Simple in-process payload reference counter, for embedders without an
/// external blob store and for tests.
#[derive(Default)]
pub struct InMemoryPayloadStore {
    counters: Mutex<HashMap<u64, u64>>,
}

impl InMemoryPayloadStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reference when a payload enters a queue. Callers do this
    /// before handing the publish to the engine.
    pub fn add_reference(&self, payload_id: u64) {
        *self.counters.lock().entry(payload_id).or_insert(0) += 1;
    }

    pub fn reference_count(&self, payload_id: u64) -> u64 {
        self.counters.lock().get(&payload_id).copied().unwrap_or(0)
    }

    /// Sum of all outstanding references.
    pub fn total_references(&self) -> u64 {
        self.counters.lock().values().sum()
    }
}

impl PayloadPersistence for InMemoryPayloadStore {
    fn increment_reference_counter_on_bootstrap(&self, payload_id: u64) {
        self.add_reference(payload_id);
    }

    fn decrement_reference_counter(&self, payload_id: u64) {
        let mut counters = self.counters.lock();
        match counters.get_mut(&payload_id) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                counters.remove(&payload_id);
            }
            None => {
                warn!("payload {} reference counter decremented below zero", payload_id);
            }
        }
    }
}
