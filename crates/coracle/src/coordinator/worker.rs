//! Bounded dispatch of blocking turn computations.

use std::sync::{Arc, Mutex};
use std::thread;

use tokio::sync::{Semaphore, oneshot};

/// Bounded pool of dedicated worker threads for blocking turn
/// computations.
///
/// Concurrency is bounded by a semaphore; each dispatched job runs on its
/// own short-lived thread so the async dispatch path never blocks. When
/// the host refuses to provision a thread (the hard resource ceiling), the
/// job runs inline on the dispatching task instead: the caller already
/// holds the per-session lock, so inline execution only costs throughput
/// for that one session, never correctness. Provisioning failures are
/// logged and never surfaced to the end caller.
#[derive(Debug)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    max_workers: usize,
}

impl WorkerPool {
    /// Create a pool allowing at most `max_workers` concurrent jobs.
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_workers)),
            max_workers,
        }
    }

    /// Maximum number of concurrently running jobs.
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Run `job` off the dispatching task and await its result.
    ///
    /// Returns `None` only if the worker thread died before reporting a
    /// result (the job panicked).
    pub async fn dispatch<T, F>(&self, label: &str, job: F) -> Option<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        // The semaphore is never closed; an acquisition error would mean
        // the pool itself is gone, in which case we still run inline.
        let _permit = self.permits.acquire().await.ok();

        // The job is parked in a shared slot so it can be reclaimed for
        // inline execution if thread creation fails (`Builder::spawn`
        // consumes its closure even on error).
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(job)));
        let worker_slot = Arc::clone(&slot);
        let spawned = thread::Builder::new()
            .name(format!("turn-worker-{label}"))
            .spawn(move || {
                let job = worker_slot
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .take();
                if let Some(job) = job {
                    let _ = tx.send(job());
                }
            });

        match spawned {
            Ok(_handle) => rx.await.ok(),
            Err(err) => {
                tracing::warn!(
                    label = %label,
                    error = %err,
                    "worker provisioning failed; running turn inline on the dispatching task"
                );
                let job = slot
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .take();
                job.map(|job| job())
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_dispatch_returns_job_result() {
        let pool = WorkerPool::new(2);
        let result = pool.dispatch("test", || 21 * 2).await;
        assert_eq!(result, Some(42));
    }

    #[tokio::test]
    async fn test_zero_workers_clamped_to_one() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.max_workers(), 1);
        assert_eq!(pool.dispatch("test", || "ok").await, Some("ok"));
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_bound() {
        let pool = Arc::new(WorkerPool::new(2));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..8 {
            let pool = Arc::clone(&pool);
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                pool.dispatch(&format!("job-{i}"), move || {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(25));
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2, "peak: {peak:?}");
    }

    #[tokio::test]
    async fn test_panicked_job_reports_none() {
        let pool = WorkerPool::new(1);
        let result: Option<()> = pool.dispatch("doomed", || panic!("worker died")).await;
        assert!(result.is_none());

        // The permit was released; the pool still works.
        assert_eq!(pool.dispatch("next", || 7).await, Some(7));
    }
}
