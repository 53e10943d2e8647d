#![allow(dead_code)]

use photon_clientqueue::core::time::{unix_now_millis, MESSAGE_EXPIRY_NOT_SET};
use photon_clientqueue::{
    ClientQueuePersistence, InMemoryPayloadStore, MessageDroppedListener, PersistenceConfig,
    Publish, Qos, NO_PACKET_ID,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Drop listener counting every telemetry event.
#[derive(Default)]
pub struct CountingDropListener {
    pub queue_full: AtomicUsize,
    pub queue_full_shared: AtomicUsize,
    pub qos0_memory_exceeded: AtomicUsize,
    pub qos0_memory_exceeded_shared: AtomicUsize,
}

impl CountingDropListener {
    pub fn queue_full_count(&self) -> usize {
        self.queue_full.load(Ordering::SeqCst)
    }

    pub fn queue_full_shared_count(&self) -> usize {
        self.queue_full_shared.load(Ordering::SeqCst)
    }

    pub fn qos0_memory_exceeded_count(&self) -> usize {
        self.qos0_memory_exceeded.load(Ordering::SeqCst)
    }

    pub fn qos0_memory_exceeded_shared_count(&self) -> usize {
        self.qos0_memory_exceeded_shared.load(Ordering::SeqCst)
    }
}

impl MessageDroppedListener for CountingDropListener {
    fn queue_full(&self, _queue_id: &str, _topic: &str, _qos: u8) {
        self.queue_full.fetch_add(1, Ordering::SeqCst);
    }

    fn queue_full_shared(&self, _group: &str, _topic: &str, _qos: u8) {
        self.queue_full_shared.fetch_add(1, Ordering::SeqCst);
    }

    fn qos0_memory_exceeded(
        &self,
        _queue_id: &str,
        _topic: &str,
        _qos: u8,
        _current: i64,
        _limit: u64,
    ) {
        self.qos0_memory_exceeded.fetch_add(1, Ordering::SeqCst);
    }

    fn qos0_memory_exceeded_shared(
        &self,
        _group: &str,
        _topic: &str,
        _qos: u8,
        _current: i64,
        _limit: u64,
    ) {
        self.qos0_memory_exceeded_shared.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn config(bucket_count: usize) -> PersistenceConfig {
    PersistenceConfig {
        bucket_count,
        ..Default::default()
    }
}

pub struct TestSetup {
    pub persistence: Arc<ClientQueuePersistence>,
    pub payload_store: Arc<InMemoryPayloadStore>,
    pub dropped: Arc<CountingDropListener>,
}

pub fn setup(bucket_count: usize) -> TestSetup {
    setup_with_config(&config(bucket_count))
}

pub fn setup_with_config(config: &PersistenceConfig) -> TestSetup {
    let payload_store = Arc::new(InMemoryPayloadStore::new());
    let dropped = Arc::new(CountingDropListener::default());
    let persistence = Arc::new(ClientQueuePersistence::new(
        config,
        payload_store.clone(),
        dropped.clone(),
    ));
    TestSetup {
        persistence,
        payload_store,
        dropped,
    }
}

static NEXT_PAYLOAD_ID: AtomicUsize = AtomicUsize::new(1);

/// A fresh publish with its own payload id, registered in no store yet.
pub fn publish(qos: Qos, unique_id: &str) -> Publish {
    Publish {
        payload_id: NEXT_PAYLOAD_ID.fetch_add(1, Ordering::SeqCst) as u64,
        payload_size: 16,
        topic: "some/topic".to_string(),
        qos,
        message_expiry_interval: MESSAGE_EXPIRY_NOT_SET,
        timestamp: unix_now_millis(),
        unique_id: unique_id.to_string(),
        packet_id: NO_PACKET_ID,
        duplicate_delivery: false,
    }
}

/// A publish that expired long before now.
pub fn expired_publish(qos: Qos, unique_id: &str) -> Publish {
    let mut publish = publish(qos, unique_id);
    publish.timestamp = 1;
    publish.message_expiry_interval = 1;
    publish
}

/// Register the payload reference the way the broker does before queueing,
/// then add the publish.
pub fn add(
    setup: &TestSetup,
    queue_id: &str,
    shared: bool,
    publish: Publish,
    max: u64,
    strategy: photon_clientqueue::QueuedMessagesStrategy,
    bucket_index: usize,
) {
    setup.payload_store.add_reference(publish.payload_id);
    setup
        .persistence
        .add(queue_id, shared, publish, max, strategy, bucket_index)
        .expect("add failed");
}
