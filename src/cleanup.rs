//! Periodic expiry sweeps.

use crate::dispatch::SingleWriterService;
use crate::persistence::queue::ClientQueuePersistence;
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

/// Spawn a task that periodically submits an expiry sweep for every bucket
/// to its writer thread. The task ends when the engine is stopped or the
/// writer pool shuts down.
pub fn spawn_cleanup_task(
    persistence: Arc<ClientQueuePersistence>,
    writers: Arc<SingleWriterService>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if persistence.is_stopped() {
                break;
            }
            for bucket in 0..persistence.bucket_count() {
                let persistence = persistence.clone();
                let submitted = writers.submit(bucket, move || {
                    match persistence.clean_up(bucket) {
                        Ok(shared) if !shared.is_empty() => trace!(
                            "expiry sweep of bucket {} touched {} shared queues",
                            bucket,
                            shared.len()
                        ),
                        Ok(_) => {}
                        Err(err) => warn!("expiry sweep of bucket {} failed: {}", bucket, err),
                    }
                });
                if submitted.is_err() {
                    return;
                }
            }
        }
    })
}
