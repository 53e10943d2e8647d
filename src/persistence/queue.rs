//! The client queue engine.
//!
//! One engine instance owns every shard: the durable buckets, the per-shard
//! size counters, and the in-memory QoS 0 lists. All operations take the
//! pre-computed bucket index and are expected to arrive on that shard's
//! single writer thread; with enforcement enabled this is asserted at every
//! entry point.
//!
//! Within one queue's durable range, in-flight entries (assigned packet id)
//! always precede queued ones, because packet ids are only ever assigned to
//! the scan-order head of the queued suffix. Several operations rely on this
//! prefix property to stop scanning early.

use crate::core::config::{PersistenceConfig, QueuedMessagesStrategy};
use crate::core::time;
use crate::dispatch;
use crate::dropped::MessageDroppedListener;
use crate::message::{MessageWithId, PubRel, Publish, Qos, NO_PACKET_ID};
use crate::payload::PayloadPersistence;
use crate::persistence::bucket::{Bucket, QueueCursor};
use crate::persistence::qos0::{Qos0MemoryTracker, Qos0MessageStore};
use crate::persistence::serializer::{ClientQueueSerializer, KeyMatch};
use crate::persistence::{PersistenceError, QueueKey};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

pub const PERSISTENCE_NAME: &str = "client_queue";
pub const PERSISTENCE_VERSION: &str = "040000";

pub(crate) struct ShardState {
    pub queue_sizes: BTreeMap<QueueKey, u64>,
    pub qos0_messages: Qos0MessageStore,
}

/// Deferred side effects of a durable transaction. Payload releases and
/// size-counter changes are applied only once the transaction has committed,
/// so a failed transaction leaves the in-memory bookkeeping untouched.
#[derive(Default)]
struct TxnEffects {
    released_payloads: Vec<u64>,
    size_delta: i64,
}

pub struct ClientQueuePersistence {
    pub(crate) serializer: ClientQueueSerializer,
    pub(crate) payload_persistence: Arc<dyn PayloadPersistence>,
    message_dropped: Arc<dyn MessageDroppedListener>,
    pub(crate) buckets: Vec<Bucket>,
    pub(crate) shards: Vec<Mutex<ShardState>>,
    qos0_memory: Qos0MemoryTracker,
    stopped: AtomicBool,
    enforce_single_writer: bool,
}

impl ClientQueuePersistence {
    pub fn new(
        config: &PersistenceConfig,
        payload_persistence: Arc<dyn PayloadPersistence>,
        message_dropped: Arc<dyn MessageDroppedListener>,
    ) -> Self {
        let buckets = (0..config.bucket_count).map(|_| Bucket::new()).collect();
        Self::with_buckets(config, payload_persistence, message_dropped, buckets)
    }

    /// Build the engine over existing buckets, e.g. after a restart. Callers
    /// must run `bootstrap` before serving traffic.
    pub fn with_buckets(
        config: &PersistenceConfig,
        payload_persistence: Arc<dyn PayloadPersistence>,
        message_dropped: Arc<dyn MessageDroppedListener>,
        buckets: Vec<Bucket>,
    ) -> Self {
        assert_eq!(
            buckets.len(),
            config.bucket_count,
            "bucket count does not match the configuration"
        );
        let qos0_limit = config.qos0_memory_limit();
        debug!(
            "{} bytes allocated for qos 0 messages of the {} persistence (version {})",
            qos0_limit, PERSISTENCE_NAME, PERSISTENCE_VERSION
        );
        let shards = (0..config.bucket_count)
            .map(|_| {
                Mutex::new(ShardState {
                    queue_sizes: BTreeMap::new(),
                    qos0_messages: Qos0MessageStore::default(),
                })
            })
            .collect();
        Self {
            serializer: ClientQueueSerializer::new(),
            payload_persistence,
            message_dropped,
            buckets,
            shards,
            qos0_memory: Qos0MemoryTracker::new(qos0_limit),
            stopped: AtomicBool::new(false),
            enforce_single_writer: false,
        }
    }

    /// Require every operation to arrive on a single-writer thread.
    pub fn with_single_writer_enforcement(mut self) -> Self {
        self.enforce_single_writer = true;
        self
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Shared handles to the durable buckets, for handing the stored state to
    /// a successor engine instance.
    pub fn buckets(&self) -> Vec<Bucket> {
        self.buckets.clone()
    }

    /// Stop background processing; `clean_up` becomes a no-op.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn check_preconditions(&self, bucket_index: usize) {
        assert!(
            bucket_index < self.buckets.len(),
            "bucket index {} out of range",
            bucket_index
        );
        if self.enforce_single_writer {
            assert!(
                dispatch::is_single_writer_thread(),
                "client queue persistence accessed outside the single-writer thread pool"
            );
        }
    }

    /// Queue an outbound publish.
    ///
    /// QoS 0 publishes go to the in-memory layer, subject to the global byte
    /// budget. QoS 1/2 publishes go to the durable store; when the queue
    /// already holds `max` QoS 1/2 entries the configured strategy decides
    /// which message is dropped. Dropped messages release their payload
    /// reference and are reported through the drop listener.
    pub fn add(
        &self,
        queue_id: &str,
        shared: bool,
        publish: Publish,
        max: u64,
        strategy: QueuedMessagesStrategy,
        bucket_index: usize,
    ) -> Result<(), PersistenceError> {
        self.check_preconditions(bucket_index);
        let key = QueueKey::new(queue_id, shared);
        let mut shard = self.shards[bucket_index].lock();

        if publish.qos == Qos::AtMostOnce {
            self.add_qos0(&mut shard, &key, publish);
            return Ok(());
        }

        let queue_size = shard.queue_sizes.get(&key).copied().unwrap_or(0);
        let qos0_count = shard.qos0_messages.len(&key) as u64;
        let at_capacity = queue_size - qos0_count >= max;

        if at_capacity {
            match strategy {
                QueuedMessagesStrategy::Discard => {
                    self.log_message_dropped(&publish, &key);
                    self.payload_persistence
                        .decrement_reference_counter(publish.payload_id);
                    return Ok(());
                }
                QueuedMessagesStrategy::DiscardOldest => {
                    if !self.discard_oldest(bucket_index, &key)? {
                        self.log_message_dropped(&publish, &key);
                        self.payload_persistence
                            .decrement_reference_counter(publish.payload_id);
                        return Ok(());
                    }
                }
            }
        }

        let entry_key = self.serializer.serialize_new_publish_key(&key);
        let value = self.serializer.serialize_publish_without_packet_id(&publish);
        self.buckets[bucket_index].execute_in_exclusive_transaction(|txn| {
            txn.put(entry_key, value);
            Ok(())
        })?;
        if !at_capacity {
            *shard.queue_sizes.entry(key).or_insert(0) += 1;
        }
        Ok(())
    }

    fn add_qos0(&self, shard: &mut ShardState, key: &QueueKey, publish: Publish) {
        if self.qos0_memory.exceeds_limit() {
            let current = self.qos0_memory.current();
            let limit = self.qos0_memory.limit();
            if key.shared {
                self.message_dropped.qos0_memory_exceeded_shared(
                    &key.queue_id,
                    &publish.topic,
                    0,
                    current,
                    limit,
                );
            } else {
                self.message_dropped.qos0_memory_exceeded(
                    &key.queue_id,
                    &publish.topic,
                    0,
                    current,
                    limit,
                );
            }
            self.payload_persistence
                .decrement_reference_counter(publish.payload_id);
            return;
        }
        self.qos0_memory.add(&publish);
        shard.qos0_messages.push(key, publish);
        *shard.queue_sizes.entry(key.clone()).or_insert(0) += 1;
    }

    fn log_message_dropped(&self, publish: &Publish, key: &QueueKey) {
        if key.shared {
            self.message_dropped.queue_full_shared(
                &key.queue_id,
                &publish.topic,
                publish.qos.as_number(),
            );
        } else {
            self.message_dropped
                .queue_full(&key.queue_id, &publish.topic, publish.qos.as_number());
        }
    }

    /// Delete the oldest queued entry that is not in flight. Returns false if
    /// the queue consists entirely of in-flight entries.
    fn discard_oldest(
        &self,
        bucket_index: usize,
        key: &QueueKey,
    ) -> Result<bool, PersistenceError> {
        let mut effects = TxnEffects::default();
        let mut discarded = false;
        self.buckets[bucket_index].execute_in_exclusive_transaction(|txn| {
            let mut cursor = txn.open_cursor();
            iterate_queue(&self.serializer, &mut cursor, key, true, |cursor| {
                let message = self.serializer.deserialize_value(cursor.value())?;
                let MessageWithId::Publish(publish) = message else {
                    return Err(PersistenceError::CorruptEntry(
                        "queued entry without packet id is not a publish",
                    ));
                };
                effects.released_payloads.push(publish.payload_id);
                cursor.delete_current();
                self.log_message_dropped(&publish, key);
                discarded = true;
                Ok(false)
            })
        })?;
        for payload_id in effects.released_payloads {
            self.payload_persistence
                .decrement_reference_counter(payload_id);
        }
        Ok(discarded)
    }

    /// Hand out queued messages, assigning the provided packet ids in order.
    ///
    /// Durable entries and in-memory QoS 0 entries are interleaved: after
    /// each durable entry at most one QoS 0 message is drained, so QoS 0
    /// traffic cannot starve QoS 1/2 delivery. Expired entries are dropped
    /// in passing. At most `packet_ids.len()` messages are returned, and the
    /// scan stops once the accumulated estimated size exceeds `bytes_limit`.
    pub fn read_new(
        &self,
        queue_id: &str,
        shared: bool,
        packet_ids: &[u16],
        bytes_limit: u64,
        bucket_index: usize,
    ) -> Result<Vec<Publish>, PersistenceError> {
        self.check_preconditions(bucket_index);
        let key = QueueKey::new(queue_id, shared);
        if packet_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut shard = self.shards[bucket_index].lock();
        let queue_size = shard.queue_sizes.get(&key).copied().unwrap_or(0);
        if queue_size == 0 {
            return Ok(Vec::new());
        }
        let now = time::unix_now_millis();

        if queue_size == shard.qos0_messages.len(&key) as u64 {
            // Only qos 0 messages; the durable store is not touched.
            let mut publishes = Vec::new();
            while publishes.len() < packet_ids.len() {
                let Some(publish) = self.poll_qos0_message(&mut shard, &key) else {
                    break;
                };
                if !publish.has_expired_at(now) {
                    publishes.push(publish);
                }
            }
            return Ok(publishes);
        }

        let shard_state = &mut *shard;
        let mut effects = TxnEffects::default();
        let mut publishes: Vec<Publish> = Vec::new();
        let mut packet_id_index = 0;
        let mut bytes = 0u64;
        self.buckets[bucket_index].execute_in_exclusive_transaction(|txn| {
            let mut cursor = txn.open_cursor();
            iterate_queue(&self.serializer, &mut cursor, &key, true, |cursor| {
                let raw = cursor.value().to_vec();
                let message = self.serializer.deserialize_value(&raw)?;
                let MessageWithId::Publish(mut publish) = message else {
                    return Err(PersistenceError::CorruptEntry(
                        "queued entry without packet id is not a publish",
                    ));
                };
                if publish.has_expired_at(now) {
                    cursor.delete_current();
                    effects.released_payloads.push(publish.payload_id);
                    effects.size_delta -= 1;
                    // A qos 0 message may still be due below.
                } else {
                    let packet_id = packet_ids[packet_id_index];
                    let patched = self.serializer.serialize_and_set_packet_id(&raw, packet_id)?;
                    let entry_key = cursor.key().to_vec();
                    cursor.put(entry_key, patched);
                    publish.packet_id = packet_id;
                    packet_id_index += 1;
                    bytes += publish.estimated_size();
                    publishes.push(publish);
                    if publishes.len() == packet_ids.len() || bytes > bytes_limit {
                        return Ok(false);
                    }
                }

                if !shard_state.qos0_messages.is_empty(&key) {
                    if let Some(qos0) = self.poll_qos0_message(shard_state, &key) {
                        if !qos0.has_expired_at(now) {
                            bytes += qos0.estimated_size();
                            publishes.push(qos0);
                        }
                    }
                }
                Ok(publishes.len() != packet_ids.len() && bytes <= bytes_limit)
            })
        })?;
        self.apply_effects(shard_state, &key, effects);
        Ok(publishes)
    }

    /// Remove the head of the queue's in-memory qos 0 list, with all of its
    /// bookkeeping: the queue size counter, the global memory counter, and
    /// the payload reference.
    fn poll_qos0_message(&self, shard: &mut ShardState, key: &QueueKey) -> Option<Publish> {
        let publish = shard.qos0_messages.pop_front(key)?;
        if let Some(size) = shard.queue_sizes.get_mut(key) {
            *size = size.saturating_sub(1);
        }
        self.qos0_memory.subtract(&publish);
        self.payload_persistence
            .decrement_reference_counter(publish.payload_id);
        Some(publish)
    }

    /// Read the in-flight prefix of the queue after a reconnect. Publishes
    /// are marked as duplicate delivery; release markers are yielded as-is.
    pub fn read_inflight(
        &self,
        client_id: &str,
        shared: bool,
        batch_size: usize,
        bytes_limit: u64,
        bucket_index: usize,
    ) -> Result<Vec<MessageWithId>, PersistenceError> {
        self.check_preconditions(bucket_index);
        let key = QueueKey::new(client_id, shared);
        if batch_size == 0 {
            return Ok(Vec::new());
        }
        let mut messages: Vec<MessageWithId> = Vec::new();
        let mut bytes = 0u64;
        self.buckets[bucket_index].execute_in_readonly_transaction(|txn| {
            let mut cursor = txn.open_cursor();
            iterate_queue(&self.serializer, &mut cursor, &key, false, |cursor| {
                let message = self.serializer.deserialize_value(cursor.value())?;
                // In-flight entries are always first in the queue.
                if message.packet_id() == NO_PACKET_ID {
                    return Ok(false);
                }
                let message = match message {
                    MessageWithId::Publish(mut publish) => {
                        bytes += publish.estimated_size();
                        publish.duplicate_delivery = true;
                        MessageWithId::Publish(publish)
                    }
                    pubrel => pubrel,
                };
                messages.push(message);
                Ok(messages.len() != batch_size && bytes <= bytes_limit)
            })
        })?;
        Ok(messages)
    }

    /// Replace the in-flight publish carrying the release's packet id with
    /// the release marker, in place, preserving its queue position. When the
    /// packet id is not found in the in-flight prefix (the publish may have
    /// expired), a fresh release-marker entry is appended instead.
    ///
    /// Returns the unique id of the replaced publish, or `None` when no
    /// publish was replaced.
    pub fn replace(
        &self,
        client_id: &str,
        pubrel: PubRel,
        bucket_index: usize,
    ) -> Result<Option<String>, PersistenceError> {
        self.check_preconditions(bucket_index);
        let key = QueueKey::new(client_id, false);
        let mut shard = self.shards[bucket_index].lock();
        let serialized_pubrel = self.serializer.serialize_pubrel(&pubrel);
        let mut effects = TxnEffects::default();
        let mut packet_id_found = false;
        let mut replaced_id: Option<String> = None;
        self.buckets[bucket_index].execute_in_exclusive_transaction(|txn| {
            {
                let mut cursor = txn.open_cursor();
                iterate_queue(&self.serializer, &mut cursor, &key, false, |cursor| {
                    let message = self.serializer.deserialize_value(cursor.value())?;
                    let packet_id = message.packet_id();
                    if packet_id == pubrel.packet_id {
                        packet_id_found = true;
                        if let MessageWithId::Publish(publish) = message {
                            effects.released_payloads.push(publish.payload_id);
                            replaced_id = Some(publish.unique_id);
                        }
                        // Written also when the entry already was a release
                        // marker, so a repeated PUBREC is idempotent.
                        let entry_key = cursor.key().to_vec();
                        cursor.put(entry_key, serialized_pubrel.clone());
                        return Ok(false);
                    }
                    Ok(packet_id != NO_PACKET_ID)
                })?;
            }
            if !packet_id_found {
                txn.put(
                    self.serializer.serialize_unknown_pubrel_key(&key),
                    serialized_pubrel.clone(),
                );
                effects.size_delta += 1;
            }
            Ok(())
        })?;
        self.apply_effects(&mut shard, &key, effects);
        Ok(replaced_id)
    }

    /// Remove the entry carrying the packet id, typically on PUBACK or
    /// PUBCOMP. When `unique_id` is given and the found publish carries a
    /// different one, the acknowledgement is stale and nothing is removed.
    ///
    /// Returns the unique id of the removed publish, or `None` when a release
    /// marker was removed or nothing matched.
    pub fn remove(
        &self,
        client_id: &str,
        packet_id: u16,
        unique_id: Option<&str>,
        bucket_index: usize,
    ) -> Result<Option<String>, PersistenceError> {
        self.check_preconditions(bucket_index);
        let key = QueueKey::new(client_id, false);
        let mut shard = self.shards[bucket_index].lock();
        let mut effects = TxnEffects::default();
        let mut removed_id: Option<String> = None;
        self.buckets[bucket_index].execute_in_exclusive_transaction(|txn| {
            let mut cursor = txn.open_cursor();
            iterate_queue(&self.serializer, &mut cursor, &key, false, |cursor| {
                let message = self.serializer.deserialize_value(cursor.value())?;
                if message.packet_id() != packet_id {
                    return Ok(true);
                }
                if let MessageWithId::Publish(publish) = message {
                    if unique_id.is_some_and(|expected| expected != publish.unique_id) {
                        return Ok(false);
                    }
                    effects.released_payloads.push(publish.payload_id);
                    removed_id = Some(publish.unique_id);
                }
                cursor.delete_current();
                effects.size_delta -= 1;
                Ok(false)
            })
        })?;
        self.apply_effects(&mut shard, &key, effects);
        Ok(removed_id)
    }

    /// Delete the whole queue: every durable entry, every in-memory qos 0
    /// message, and the queue's map slots.
    pub fn clear(
        &self,
        queue_id: &str,
        shared: bool,
        bucket_index: usize,
    ) -> Result<(), PersistenceError> {
        self.check_preconditions(bucket_index);
        let key = QueueKey::new(queue_id, shared);
        let mut shard = self.shards[bucket_index].lock();
        let mut effects = TxnEffects::default();
        self.buckets[bucket_index].execute_in_exclusive_transaction(|txn| {
            let mut cursor = txn.open_cursor();
            iterate_queue(&self.serializer, &mut cursor, &key, false, |cursor| {
                let message = self.serializer.deserialize_value(cursor.value())?;
                if let MessageWithId::Publish(publish) = message {
                    effects.released_payloads.push(publish.payload_id);
                }
                cursor.delete_current();
                Ok(true)
            })
        })?;
        for payload_id in effects.released_payloads {
            self.payload_persistence
                .decrement_reference_counter(payload_id);
        }
        for publish in shard.qos0_messages.remove_queue(&key) {
            self.qos0_memory.subtract(&publish);
            self.payload_persistence
                .decrement_reference_counter(publish.payload_id);
        }
        shard.queue_sizes.remove(&key);
        Ok(())
    }

    /// Drop every in-memory qos 0 message of the queue, e.g. when the client
    /// disconnects without a session.
    pub fn remove_all_qos0_messages(&self, queue_id: &str, shared: bool, bucket_index: usize) {
        self.check_preconditions(bucket_index);
        let key = QueueKey::new(queue_id, shared);
        let mut shard = self.shards[bucket_index].lock();
        while let Some(publish) = shard.qos0_messages.pop_front(&key) {
            self.payload_persistence
                .decrement_reference_counter(publish.payload_id);
            if let Some(size) = shard.queue_sizes.get_mut(&key) {
                *size = size.saturating_sub(1);
            }
            self.qos0_memory.subtract(&publish);
        }
    }

    /// Remove the publish with the given unique id from a shared queue, once
    /// one group member has fully acknowledged it.
    pub fn remove_shared(
        &self,
        group: &str,
        unique_id: &str,
        bucket_index: usize,
    ) -> Result<(), PersistenceError> {
        self.check_preconditions(bucket_index);
        let key = QueueKey::new(group, true);
        let mut shard = self.shards[bucket_index].lock();
        let mut effects = TxnEffects::default();
        self.buckets[bucket_index].execute_in_exclusive_transaction(|txn| {
            let mut cursor = txn.open_cursor();
            iterate_queue(&self.serializer, &mut cursor, &key, false, |cursor| {
                let message = self.serializer.deserialize_value(cursor.value())?;
                let MessageWithId::Publish(publish) = message else {
                    return Ok(false);
                };
                if publish.unique_id != unique_id {
                    return Ok(true);
                }
                effects.released_payloads.push(publish.payload_id);
                cursor.delete_current();
                effects.size_delta -= 1;
                Ok(false)
            })
        })?;
        self.apply_effects(&mut shard, &key, effects);
        Ok(())
    }

    /// Return a previously offered shared-queue publish to the queued state
    /// by resetting its packet id slot, when the chosen subscriber abandoned
    /// it.
    pub fn remove_inflight_marker(
        &self,
        group: &str,
        unique_id: &str,
        bucket_index: usize,
    ) -> Result<(), PersistenceError> {
        self.check_preconditions(bucket_index);
        let key = QueueKey::new(group, true);
        self.buckets[bucket_index].execute_in_exclusive_transaction(|txn| {
            let mut cursor = txn.open_cursor();
            iterate_queue(&self.serializer, &mut cursor, &key, false, |cursor| {
                let message = self.serializer.deserialize_value(cursor.value())?;
                let MessageWithId::Publish(publish) = message else {
                    return Ok(false);
                };
                if publish.unique_id != unique_id {
                    return Ok(true);
                }
                let entry_key = cursor.key().to_vec();
                cursor.put(
                    entry_key,
                    self.serializer.serialize_publish_without_packet_id(&publish),
                );
                Ok(false)
            })
        })
    }

    pub fn size(&self, queue_id: &str, shared: bool, bucket_index: usize) -> u64 {
        self.check_preconditions(bucket_index);
        let key = QueueKey::new(queue_id, shared);
        self.shards[bucket_index]
            .lock()
            .queue_sizes
            .get(&key)
            .copied()
            .unwrap_or(0)
    }

    pub fn qos0_size(&self, queue_id: &str, shared: bool, bucket_index: usize) -> usize {
        self.check_preconditions(bucket_index);
        let key = QueueKey::new(queue_id, shared);
        self.shards[bucket_index].lock().qos0_messages.len(&key)
    }

    /// Sweep expired messages from every queue of the shard. Returns the
    /// shared queue names of the shard so the caller can trigger group-level
    /// cleanup. A stopped engine does nothing.
    pub fn clean_up(&self, bucket_index: usize) -> Result<BTreeSet<String>, PersistenceError> {
        self.check_preconditions(bucket_index);
        if self.is_stopped() {
            return Ok(BTreeSet::new());
        }
        let keys: Vec<QueueKey> = self.shards[bucket_index]
            .lock()
            .queue_sizes
            .keys()
            .cloned()
            .collect();
        let mut shared_queues = BTreeSet::new();
        for key in keys {
            if key.shared {
                shared_queues.insert(key.queue_id.clone());
            }
            self.clean_expired_messages(&key, bucket_index)?;
        }
        Ok(shared_queues)
    }

    fn clean_expired_messages(
        &self,
        key: &QueueKey,
        bucket_index: usize,
    ) -> Result<(), PersistenceError> {
        let now = time::unix_now_millis();
        let mut shard = self.shards[bucket_index].lock();

        let mut expired = Vec::new();
        if let Some(queue) = shard.qos0_messages.queue_mut(key) {
            queue.retain(|publish| {
                if publish.has_expired_at(now) {
                    expired.push(publish.clone());
                    false
                } else {
                    true
                }
            });
        }
        for publish in &expired {
            if let Some(size) = shard.queue_sizes.get_mut(key) {
                *size = size.saturating_sub(1);
            }
            self.qos0_memory.subtract(publish);
            self.payload_persistence
                .decrement_reference_counter(publish.payload_id);
        }

        let mut effects = TxnEffects::default();
        self.buckets[bucket_index].execute_in_exclusive_transaction(|txn| {
            let mut cursor = txn.open_cursor();
            iterate_queue(&self.serializer, &mut cursor, key, false, |cursor| {
                let message = self.serializer.deserialize_value(cursor.value())?;
                let MessageWithId::Publish(publish) = message else {
                    return Ok(true);
                };
                // An in-flight qos 2 publish must not expire; the receiver
                // has been promised it.
                let inflight_exactly_once =
                    publish.qos == Qos::ExactlyOnce && publish.packet_id != NO_PACKET_ID;
                if publish.has_expired_at(now) && !inflight_exactly_once {
                    effects.released_payloads.push(publish.payload_id);
                    effects.size_delta -= 1;
                    cursor.delete_current();
                }
                Ok(true)
            })
        })?;
        self.apply_effects(&mut shard, key, effects);
        Ok(())
    }

    fn apply_effects(&self, shard: &mut ShardState, key: &QueueKey, effects: TxnEffects) {
        for payload_id in effects.released_payloads {
            self.payload_persistence
                .decrement_reference_counter(payload_id);
        }
        if effects.size_delta != 0 {
            let size = shard.queue_sizes.entry(key.clone()).or_insert(0);
            if effects.size_delta < 0 {
                *size = size.saturating_sub(effects.size_delta.unsigned_abs());
            } else {
                *size += effects.size_delta as u64;
            }
        }
    }

    /// Total number of queued entries across all shards.
    pub fn total_size(&self) -> u64 {
        self.shards
            .iter()
            .map(|shard| shard.lock().queue_sizes.values().sum::<u64>())
            .sum()
    }

    /// Total number of in-memory qos 0 messages across all shards.
    pub fn total_qos0_count(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().qos0_messages.total_count())
            .sum()
    }

    pub fn qos0_memory_bytes(&self) -> i64 {
        self.qos0_memory.current()
    }

    pub fn qos0_memory_limit(&self) -> u64 {
        self.qos0_memory.limit()
    }
}

/// Position a cursor on the queue's range and invoke the callback for every
/// entry, in index order, until it returns false or the range ends.
///
/// The range scan lands on the first key at or after the queue key prefix;
/// keys of other queues sharing the byte prefix are stepped over. With
/// `skip_with_id` the in-flight prefix of the queue is skipped as well, so
/// the callback only sees entries without an assigned packet id.
fn iterate_queue<C, F>(
    serializer: &ClientQueueSerializer,
    cursor: &mut C,
    key: &QueueKey,
    skip_with_id: bool,
    mut on_entry: F,
) -> Result<(), PersistenceError>
where
    C: QueueCursor,
    F: FnMut(&mut C) -> Result<bool, PersistenceError>,
{
    let reference = serializer.serialize_queue_key(key);
    if !cursor.seek_range(&reference) {
        return Ok(());
    }
    let mut comparison = serializer.compare_client_id(&reference, cursor.key());
    while comparison == KeyMatch::SamePrefix {
        if !cursor.next() {
            return Ok(());
        }
        comparison = serializer.compare_client_id(&reference, cursor.key());
    }
    if skip_with_id {
        while comparison == KeyMatch::Match {
            if serializer.deserialize_packet_id(cursor.value())? == NO_PACKET_ID {
                break;
            }
            if !cursor.next() {
                return Ok(());
            }
            comparison = serializer.compare_client_id(&reference, cursor.key());
        }
    }
    while comparison == KeyMatch::Match {
        if !on_entry(cursor)? {
            return Ok(());
        }
        if !cursor.next() {
            return Ok(());
        }
        comparison = serializer.compare_client_id(&reference, cursor.key());
    }
    Ok(())
}
