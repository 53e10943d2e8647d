#![deny(clippy::all)]
// Module naming: common pattern in domain-driven code
#![allow(clippy::module_name_repetitions)]
// Numeric casts: intentional in protocol code
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]
// Format strings: allow non-inlined for readability
#![allow(clippy::uninlined_format_args)]

//! Photon client queue - per-client outbound message queue persistence for an
//! MQTT broker.
//!
//! Every client session and every shared-subscription group owns an ordered
//! queue of outbound publishes plus their delivery-state markers. QoS 1/2
//! entries live in a durable ordered key-value store, QoS 0 entries live in
//! process memory under a global byte budget, and the whole structure is
//! partitioned into buckets so that a single writer thread owns each shard.
//!
//! # Module Organization
//!
//! ## Core
//! - `core::config` - Configuration parsing and validation
//! - `core::time` - Epoch clock and message expiry checks
//!
//! ## Domain types
//! - `message` - QoS levels, publishes, release markers
//! - `payload` - Reference-counted payload store interface
//! - `dropped` - Message-dropped telemetry interface
//!
//! ## Persistence
//! - `persistence::serializer` - Entry key and value wire formats
//! - `persistence::bucket` - Per-shard ordered store, transactions, cursors
//! - `persistence::qos0` - In-memory QoS 0 layer and memory budget
//! - `persistence::queue` - The queue engine
//! - `persistence::bootstrap` - Startup scan and counter recovery
//!
//! ## Scheduling
//! - `dispatch` - Single-writer thread pool and bucket routing
//! - `cleanup` - Periodic expiry sweeps

pub mod cleanup;
pub mod core;
pub mod dispatch;
pub mod dropped;
pub mod message;
pub mod payload;
pub mod persistence;

// Re-exports for convenience
pub use self::core::config::{PersistenceConfig, QueuedMessagesStrategy};
pub use dispatch::{bucket_index, SingleWriterService, SINGLE_WRITER_THREAD_PREFIX};
pub use dropped::{LogMessageDropped, MessageDroppedListener};
pub use message::{MessageWithId, PubRel, Publish, Qos, NO_PACKET_ID};
pub use payload::{InMemoryPayloadStore, PayloadPersistence};
pub use persistence::queue::ClientQueuePersistence;
pub use persistence::{PersistenceError, QueueKey};
