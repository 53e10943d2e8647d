//! Telemetry interface for dropped messages.

use tracing::{debug, warn};

/// Consumed interface of the message-dropped telemetry service. Every drop
/// decision in the queue engine reports through exactly one of these hooks.
pub trait MessageDroppedListener: Send + Sync {
    /// A session queue was at capacity.
    fn queue_full(&self, queue_id: &str, topic: &str, qos: u8);

    /// A shared-subscription queue was at capacity.
    fn queue_full_shared(&self, group: &str, topic: &str, qos: u8);

    /// The global QoS 0 memory budget was exceeded.
    fn qos0_memory_exceeded(&self, queue_id: &str, topic: &str, qos: u8, current: i64, limit: u64);

    /// Same, for a shared-subscription queue.
    fn qos0_memory_exceeded_shared(
        &self,
        group: &str,
        topic: &str,
        qos: u8,
        current: i64,
        limit: u64,
    );
}

/// Default listener that reports drops through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMessageDropped;

impl MessageDroppedListener for LogMessageDropped {
    fn queue_full(&self, queue_id: &str, topic: &str, qos: u8) {
        debug!(
            "dropped qos {} message on topic {} for client {}: queue full",
            qos, topic, queue_id
        );
    }

    fn queue_full_shared(&self, group: &str, topic: &str, qos: u8) {
        debug!(
            "dropped qos {} message on topic {} for shared subscription {}: queue full",
            qos, topic, group
        );
    }

    fn qos0_memory_exceeded(&self, queue_id: &str, topic: &str, qos: u8, current: i64, limit: u64) {
        warn!(
            "dropped qos {} message on topic {} for client {}: qos 0 memory exceeded ({} of {} bytes used)",
            qos, topic, queue_id, current, limit
        );
    }

    fn qos0_memory_exceeded_shared(
        &self,
        group: &str,
        topic: &str,
        qos: u8,
        current: i64,
        limit: u64,
    ) {
        warn!(
            "dropped qos {} message on topic {} for shared subscription {}: qos 0 memory exceeded ({} of {} bytes used)",
            qos, topic, group, current, limit
        );
    }
}
