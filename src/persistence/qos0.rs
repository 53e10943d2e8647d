//! In-memory QoS 0 message layer.
//!
//! QoS 0 messages are never written to the durable store; each shard keeps
//! them in per-queue lists, and a single global byte counter bounds their
//! total footprint across all shards.

use crate::message::Publish;
use crate::persistence::QueueKey;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};

/// Fixed accounting overhead per queued QoS 0 entry, approximating the list
/// node and map bookkeeping around the publish itself.
pub const QOS_0_NODE_OVERHEAD: u64 = 24;

/// Per-shard map of queue key to pending QoS 0 publishes. Only the shard's
/// writer thread touches it, so plain collections suffice.
#[derive(Default)]
pub struct Qos0MessageStore {
    queues: HashMap<QueueKey, VecDeque<Publish>>,
}

impl Qos0MessageStore {
    pub fn push(&mut self, key: &QueueKey, publish: Publish) {
        self.queues.entry(key.clone()).or_default().push_back(publish);
    }

    pub fn pop_front(&mut self, key: &QueueKey) -> Option<Publish> {
        self.queues.get_mut(key).and_then(VecDeque::pop_front)
    }

    pub fn len(&self, key: &QueueKey) -> usize {
        self.queues.get(key).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, key: &QueueKey) -> bool {
        self.len(key) == 0
    }

    /// Mutable view for the expiry sweep; `None` when the queue has no list.
    pub fn queue_mut(&mut self, key: &QueueKey) -> Option<&mut VecDeque<Publish>> {
        self.queues.get_mut(key)
    }

    /// Drop the queue's list entirely, returning any remaining entries.
    pub fn remove_queue(&mut self, key: &QueueKey) -> VecDeque<Publish> {
        self.queues.remove(key).unwrap_or_default()
    }

    pub fn total_count(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }
}

/// Global QoS 0 byte budget shared by all shards.
pub struct Qos0MemoryTracker {
    bytes: AtomicI64,
    limit: u64,
}

impl Qos0MemoryTracker {
    pub fn new(limit: u64) -> Self {
        Self {
            bytes: AtomicI64::new(0),
            limit,
        }
    }

    /// Account for one queued publish.
    pub fn add(&self, publish: &Publish) {
        self.bytes.fetch_add(
            (publish.estimated_size() + QOS_0_NODE_OVERHEAD) as i64,
            Ordering::SeqCst,
        );
    }

    /// Account for one removed publish.
    pub fn subtract(&self, publish: &Publish) {
        self.bytes.fetch_sub(
            (publish.estimated_size() + QOS_0_NODE_OVERHEAD) as i64,
            Ordering::SeqCst,
        );
    }

    pub fn current(&self) -> i64 {
        self.bytes.load(Ordering::SeqCst)
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn exceeds_limit(&self) -> bool {
        self.current() > self.limit as i64
    }
}
