mod common;

use common::{add, expired_publish, publish, setup, CountingDropListener};
use photon_clientqueue::{
    cleanup::spawn_cleanup_task, ClientQueuePersistence, InMemoryPayloadStore, PubRel, Qos,
    QueuedMessagesStrategy, SingleWriterService,
};
use std::sync::Arc;
use std::time::Duration;

const DISCARD: QueuedMessagesStrategy = QueuedMessagesStrategy::Discard;
const NO_BYTES_LIMIT: u64 = u64::MAX;

#[test]
fn bootstrap_restores_sizes_references_and_ordering() {
    let env = setup(1);
    for unique_id in ["u1", "u2", "u3", "u4", "u5"] {
        add(&env, "c", false, publish(Qos::AtLeastOnce, unique_id), 10, DISCARD, 0);
    }
    add(&env, "other", false, publish(Qos::AtLeastOnce, "o1"), 10, DISCARD, 0);

    // Restart: a fresh engine over the same buckets, with a fresh payload
    // store so the bootstrap increments are observable.
    let buckets = env.persistence.buckets();
    drop(env);
    let payload_store = Arc::new(InMemoryPayloadStore::new());
    let dropped = Arc::new(CountingDropListener::default());
    let restarted = ClientQueuePersistence::with_buckets(
        &common::config(1),
        payload_store.clone(),
        dropped,
        buckets,
    );
    restarted.bootstrap().unwrap();

    assert_eq!(restarted.size("c", false, 0), 5);
    assert_eq!(restarted.size("other", false, 0), 1);
    assert_eq!(payload_store.total_references(), 6);

    // New entries sort after everything recovered: the index watermark moved
    // past the highest stored index.
    payload_store.add_reference(1000);
    let mut late = publish(Qos::AtLeastOnce, "u6");
    late.payload_id = 1000;
    restarted.add("c", false, late, 10, DISCARD, 0).unwrap();

    let read = restarted
        .read_new("c", false, &[1, 2, 3, 4, 5, 6], NO_BYTES_LIMIT, 0)
        .unwrap();
    let ids: Vec<&str> = read.iter().map(|p| p.unique_id.as_str()).collect();
    assert_eq!(ids, vec!["u1", "u2", "u3", "u4", "u5", "u6"]);
}

#[test]
fn bootstrap_counts_release_markers_but_does_not_reference_them() {
    let env = setup(1);
    add(&env, "c", false, publish(Qos::AtLeastOnce, "u1"), 10, DISCARD, 0);
    env.persistence
        .replace("c", PubRel { packet_id: 9 }, 0)
        .unwrap();
    assert_eq!(env.persistence.size("c", false, 0), 2);

    let buckets = env.persistence.buckets();
    drop(env);
    let payload_store = Arc::new(InMemoryPayloadStore::new());
    let restarted = ClientQueuePersistence::with_buckets(
        &common::config(1),
        payload_store.clone(),
        Arc::new(CountingDropListener::default()),
        buckets,
    );
    restarted.bootstrap().unwrap();

    assert_eq!(restarted.size("c", false, 0), 2);
    assert_eq!(payload_store.total_references(), 1);
}

#[test]
fn bootstrap_of_an_empty_store_is_a_no_op() {
    let env = setup(4);
    env.persistence.bootstrap().unwrap();
    assert_eq!(env.persistence.total_size(), 0);
    assert_eq!(env.payload_store.total_references(), 0);
}

#[test]
fn clean_up_sweeps_expired_messages_and_reports_shared_queues() {
    let env = setup(1);
    let stale_durable = expired_publish(Qos::AtLeastOnce, "stale-d");
    let stale_durable_payload = stale_durable.payload_id;
    add(&env, "c", false, stale_durable, 10, DISCARD, 0);
    let stale_qos0 = expired_publish(Qos::AtMostOnce, "stale-q");
    let stale_qos0_payload = stale_qos0.payload_id;
    add(&env, "c", false, stale_qos0, 10, DISCARD, 0);
    add(&env, "c", false, publish(Qos::AtLeastOnce, "fresh"), 10, DISCARD, 0);
    add(&env, "group", true, publish(Qos::AtLeastOnce, "g1"), 10, DISCARD, 0);

    let shared = env.persistence.clean_up(0).unwrap();
    assert_eq!(shared.into_iter().collect::<Vec<_>>(), vec!["group".to_string()]);

    assert_eq!(env.persistence.size("c", false, 0), 1);
    assert_eq!(env.persistence.qos0_size("c", false, 0), 0);
    assert_eq!(env.payload_store.reference_count(stale_durable_payload), 0);
    assert_eq!(env.payload_store.reference_count(stale_qos0_payload), 0);
    assert_eq!(env.persistence.qos0_memory_bytes(), 0);

    let read = env
        .persistence
        .read_new("c", false, &[1], NO_BYTES_LIMIT, 0)
        .unwrap();
    assert_eq!(read[0].unique_id, "fresh");
}

#[test]
fn clean_up_keeps_inflight_qos2_messages_beyond_expiry() {
    let env = setup(1);
    let mut short_lived_qos2 = publish(Qos::ExactlyOnce, "keep");
    short_lived_qos2.message_expiry_interval = 2;
    add(&env, "c", false, short_lived_qos2, 10, DISCARD, 0);
    let mut short_lived_qos1 = publish(Qos::AtLeastOnce, "expire");
    short_lived_qos1.message_expiry_interval = 2;
    add(&env, "c", false, short_lived_qos1, 10, DISCARD, 0);

    // Both go in flight before they expire.
    let read = env
        .persistence
        .read_new("c", false, &[1, 2], NO_BYTES_LIMIT, 0)
        .unwrap();
    assert_eq!(read.len(), 2);

    std::thread::sleep(Duration::from_millis(2200));
    env.persistence.clean_up(0).unwrap();

    // The in-flight qos 2 publish survives; the qos 1 publish does not.
    assert_eq!(env.persistence.size("c", false, 0), 1);
    let inflight = env
        .persistence
        .read_inflight("c", false, 10, NO_BYTES_LIMIT, 0)
        .unwrap();
    assert_eq!(inflight.len(), 1);
    assert_eq!(
        inflight[0].as_publish().map(|p| p.unique_id.as_str()),
        Some("keep")
    );
}

#[test]
fn clean_up_is_a_no_op_once_stopped() {
    let env = setup(1);
    add(&env, "group", true, expired_publish(Qos::AtLeastOnce, "g1"), 10, DISCARD, 0);

    env.persistence.stop();
    let shared = env.persistence.clean_up(0).unwrap();
    assert!(shared.is_empty());
    assert_eq!(env.persistence.size("group", true, 0), 1);
}

#[test]
fn operations_route_through_the_single_writer_service() {
    let env = setup(4);
    let persistence = Arc::new(
        ClientQueuePersistence::with_buckets(
            &common::config(4),
            env.payload_store.clone(),
            env.dropped.clone(),
            env.persistence.buckets(),
        )
        .with_single_writer_enforcement(),
    );
    let writers = SingleWriterService::new(4);

    let bucket = writers.bucket_index("c");
    let queued = {
        let persistence = persistence.clone();
        let payload_store = env.payload_store.clone();
        writers
            .execute(bucket, move || {
                let message = publish(Qos::AtLeastOnce, "u1");
                payload_store.add_reference(message.payload_id);
                persistence.add("c", false, message, 10, DISCARD, bucket)?;
                Ok::<_, photon_clientqueue::PersistenceError>(persistence.size("c", false, bucket))
            })
            .unwrap()
            .unwrap()
    };
    assert_eq!(queued, 1);

    let read = {
        let persistence = persistence.clone();
        writers
            .execute(bucket, move || {
                persistence.read_new("c", false, &[5], NO_BYTES_LIMIT, bucket)
            })
            .unwrap()
            .unwrap()
    };
    assert_eq!(read[0].packet_id, 5);
    writers.shutdown();
}

#[test]
#[should_panic(expected = "single-writer")]
fn enforcement_rejects_foreign_threads() {
    let env = setup(1);
    let persistence = ClientQueuePersistence::with_buckets(
        &common::config(1),
        env.payload_store.clone(),
        env.dropped.clone(),
        env.persistence.buckets(),
    )
    .with_single_writer_enforcement();
    persistence.size("c", false, 0);
}

#[tokio::test]
async fn cleanup_task_sweeps_periodically() {
    let env = setup(2);
    for bucket in 0..2 {
        let stale = expired_publish(Qos::AtLeastOnce, "stale");
        env.payload_store.add_reference(stale.payload_id);
        env.persistence
            .add(&format!("client-{bucket}"), false, stale, 10, DISCARD, bucket)
            .unwrap();
    }
    assert_eq!(env.persistence.total_size(), 2);

    let writers = Arc::new(SingleWriterService::new(2));
    let handle = spawn_cleanup_task(
        env.persistence.clone(),
        writers.clone(),
        Duration::from_millis(20),
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(env.persistence.total_size(), 0);
    assert_eq!(env.payload_store.total_references(), 0);

    env.persistence.stop();
    handle.await.unwrap();
    writers.shutdown();
}
