//! Durable client queue persistence.

pub mod bootstrap;
pub mod bucket;
pub mod qos0;
pub mod queue;
pub mod serializer;

use thiserror::Error;

/// Identity of one queue: a client session or a shared-subscription group.
/// The flag disambiguates the two namespaces, which may share ids.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueKey {
    pub queue_id: String,
    pub shared: bool,
}

impl QueueKey {
    pub fn new(queue_id: impl Into<String>, shared: bool) -> Self {
        let queue_id = queue_id.into();
        assert!(!queue_id.is_empty(), "queue id must not be empty");
        Self { queue_id, shared }
    }
}

/// Errors surfaced by the persistence layer. Capacity conditions are not
/// errors; they are handled locally and reported through telemetry.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("corrupt entry key: {0}")]
    CorruptKey(&'static str),
    #[error("corrupt queue entry: {0}")]
    CorruptEntry(&'static str),
}
