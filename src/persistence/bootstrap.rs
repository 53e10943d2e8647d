//! Startup scan over the durable store.
//!
//! Queue size counters and payload reference counts live in memory only;
//! after a restart they are rebuilt from a full scan of every shard before
//! the engine serves traffic. The scan also recovers the entry index
//! watermark so new entries sort after everything already stored.

use crate::message::MessageWithId;
use crate::persistence::queue::{ClientQueuePersistence, PERSISTENCE_NAME};
use crate::persistence::serializer::FIRST_ENTRY_INDEX;
use crate::persistence::bucket::QueueCursor;
use crate::persistence::{PersistenceError, QueueKey};
use tracing::debug;

impl ClientQueuePersistence {
    /// Rebuild per-queue size counters, replay payload references, and
    /// restore the entry index watermark. Must run before serving traffic.
    pub fn bootstrap(&self) -> Result<(), PersistenceError> {
        debug!(
            "initializing payload reference count and queue sizes for {} persistence",
            PERSISTENCE_NAME
        );
        let mut max_index = FIRST_ENTRY_INDEX;
        for (bucket_index, bucket) in self.buckets.iter().enumerate() {
            let mut shard = self.shards[bucket_index].lock();
            bucket.execute_in_readonly_transaction(|txn| {
                let mut cursor = txn.open_cursor();
                let mut current_key: Option<QueueKey> = None;
                let mut queue_size = 0u64;
                while cursor.next() {
                    let key = self.serializer.deserialize_queue_key(cursor.key())?;
                    if current_key.as_ref() != Some(&key) {
                        if let Some(previous) = current_key.take() {
                            if queue_size != 0 {
                                shard.queue_sizes.insert(previous, queue_size);
                            }
                        }
                        queue_size = 0;
                    }
                    current_key = Some(key);

                    let index = self.serializer.deserialize_index(cursor.key())?;
                    if index > max_index {
                        max_index = index;
                    }
                    let message = self.serializer.deserialize_value(cursor.value())?;
                    if let MessageWithId::Publish(publish) = message {
                        self.payload_persistence
                            .increment_reference_counter_on_bootstrap(publish.payload_id);
                    }
                    queue_size += 1;
                }
                // The last queue of the bucket has no boundary to commit it.
                if let Some(last) = current_key {
                    shard.queue_sizes.entry(last).or_insert(queue_size);
                }
                Ok(())
            })?;
        }
        self.serializer.restore_entry_index(max_index);
        debug!(
            "{} persistence bootstrap complete, {} queued entries",
            PERSISTENCE_NAME,
            self.total_size()
        );
        Ok(())
    }
}
