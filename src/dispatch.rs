//! Single-writer thread dispatch.
//!
//! Queues are partitioned into buckets by a hash of the queue id; every
//! bucket is owned by exactly one writer thread, so queue operations on one
//! shard never race each other. The engine asserts the thread-name
//! precondition at each entry point when enforcement is enabled.

use std::hash::Hasher;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::debug;
use twox_hash::XxHash64;

/// Name prefix of every writer thread.
pub const SINGLE_WRITER_THREAD_PREFIX: &str = "single-writer-";

/// Shard owning a queue id, stable across restarts.
pub fn bucket_index(queue_id: &str, bucket_count: usize) -> usize {
    assert!(bucket_count > 0, "bucket count must be positive");
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(queue_id.as_bytes());
    (hasher.finish() % bucket_count as u64) as usize
}

/// Whether the current thread is one of the single-writer threads.
pub fn is_single_writer_thread() -> bool {
    thread::current()
        .name()
        .is_some_and(|name| name.starts_with(SINGLE_WRITER_THREAD_PREFIX))
}

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error)]
#[error("single writer service is stopped")]
pub struct DispatchError;

/// Fixed pool of writer threads, one per bucket. Jobs submitted for one
/// bucket run serially in submission order on that bucket's thread.
pub struct SingleWriterService {
    senders: parking_lot::Mutex<Vec<mpsc::Sender<Job>>>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    bucket_count: usize,
}

impl SingleWriterService {
    pub fn new(bucket_count: usize) -> Self {
        assert!(bucket_count > 0, "bucket count must be positive");
        let mut senders = Vec::with_capacity(bucket_count);
        let mut handles = Vec::with_capacity(bucket_count);
        for index in 0..bucket_count {
            let (sender, receiver) = mpsc::channel::<Job>();
            let handle = thread::Builder::new()
                .name(format!("{}{}", SINGLE_WRITER_THREAD_PREFIX, index))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        job();
                    }
                })
                .expect("failed to spawn single-writer thread");
            senders.push(sender);
            handles.push(handle);
        }
        debug!("started {} single-writer threads", bucket_count);
        Self {
            senders: parking_lot::Mutex::new(senders),
            handles: parking_lot::Mutex::new(handles),
            bucket_count,
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    pub fn bucket_index(&self, queue_id: &str) -> usize {
        bucket_index(queue_id, self.bucket_count)
    }

    /// Enqueue a job on the bucket's writer thread.
    pub fn submit(
        &self,
        bucket: usize,
        job: impl FnOnce() + Send + 'static,
    ) -> Result<(), DispatchError> {
        let senders = self.senders.lock();
        let sender = senders.get(bucket).ok_or(DispatchError)?;
        sender.send(Box::new(job)).map_err(|_| DispatchError)
    }

    /// Run a job on the bucket's writer thread and wait for its result.
    pub fn execute<R: Send + 'static>(
        &self,
        bucket: usize,
        job: impl FnOnce() -> R + Send + 'static,
    ) -> Result<R, DispatchError> {
        let (sender, receiver) = mpsc::channel();
        self.submit(bucket, move || {
            let _ = sender.send(job());
        })?;
        receiver.recv().map_err(|_| DispatchError)
    }

    /// Stop accepting jobs, drain the queues, and join the writer threads.
    pub fn shutdown(&self) {
        self.senders.lock().clear();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for SingleWriterService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn bucket_index_is_stable_and_bounded() {
        let first = bucket_index("client-a", 16);
        assert_eq!(first, bucket_index("client-a", 16));
        assert!(first < 16);
        for id in ["a", "b", "c", "longer-client-id"] {
            assert!(bucket_index(id, 4) < 4);
        }
    }

    #[test]
    fn jobs_run_on_named_writer_threads() {
        let service = SingleWriterService::new(2);
        let name = service
            .execute(1, || thread::current().name().unwrap_or("").to_string())
            .unwrap();
        assert!(name.starts_with(SINGLE_WRITER_THREAD_PREFIX));
        let on_writer = service.execute(0, is_single_writer_thread).unwrap();
        assert!(on_writer);
        assert!(!is_single_writer_thread());
    }

    #[test]
    fn jobs_for_one_bucket_run_in_submission_order() {
        let service = SingleWriterService::new(1);
        let counter = Arc::new(AtomicUsize::new(0));
        for expected in 0..64 {
            let counter = counter.clone();
            service
                .submit(0, move || {
                    let seen = counter.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(seen, expected);
                })
                .unwrap();
        }
        let final_count = service.execute(0, move || ()).map(|_| counter.load(Ordering::SeqCst));
        assert_eq!(final_count.unwrap(), 64);
    }

    #[test]
    fn shutdown_rejects_new_jobs() {
        let service = SingleWriterService::new(1);
        service.shutdown();
        assert!(service.submit(0, || ()).is_err());
    }
}
