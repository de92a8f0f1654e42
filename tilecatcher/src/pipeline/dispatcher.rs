//! Bounded dispatcher and worker pool.
//!
//! The pool follows the subscribe-by-channel idiom: every idle worker
//! publishes a single-use job slot into a shared pool channel; the
//! dispatcher pairs the next idle worker with the next queued job. Pickup is
//! FIFO across workers, and the bounded job channel is the admission point
//! whose depth feeds the backpressure meter.
//!
//! ```text
//! submit -> [job queue (bounded)] -> dispatcher -> [idle worker slot] -> worker
//! ```
//!
//! Workers run jobs to completion; there is no per-job cancellation. The
//! pool winds down when every [`PoolHandle`] is dropped: the dispatcher
//! drains out, worker slots close, and workers exit their loops.

use crate::pipeline::QueueStatus;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::{debug, error};

/// A stage's per-job work, run on pool workers.
pub trait JobProcessor: Send + Sync + 'static {
    /// The work item this processor consumes.
    type Job: Send + 'static;

    /// Processes one job to completion. Results travel through channels
    /// owned by the job itself, so processing has no return value.
    fn process(&self, job: Self::Job) -> impl Future<Output = ()> + Send;
}

/// Submission handle for a worker pool's bounded job queue.
///
/// Cloneable; queue depth and status are derived from the channel's
/// remaining permits, so they are exact within one in-flight submission.
pub struct PoolHandle<J> {
    jobs_tx: mpsc::Sender<J>,
    capacity: usize,
    label: &'static str,
}

impl<J> Clone for PoolHandle<J> {
    fn clone(&self) -> Self {
        Self {
            jobs_tx: self.jobs_tx.clone(),
            capacity: self.capacity,
            label: self.label,
        }
    }
}

impl<J: Send + 'static> PoolHandle<J> {
    /// Enqueues a job, waiting up to `timeout` if the queue is at capacity.
    ///
    /// On timeout the job is handed back so the caller can report which
    /// tile was turned away.
    pub async fn submit(&self, job: J, timeout: Duration) -> Result<(), J> {
        match self.jobs_tx.send_timeout(job, timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(job)) => {
                debug!(
                    pool = self.label,
                    depth = self.depth(),
                    "job queue full past the admission timeout"
                );
                Err(job)
            }
            Err(SendTimeoutError::Closed(job)) => {
                error!(pool = self.label, "job queue closed while submitting");
                Err(job)
            }
        }
    }

    /// Instantaneous queue depth.
    #[inline]
    pub fn depth(&self) -> usize {
        self.capacity.saturating_sub(self.jobs_tx.capacity())
    }

    /// Configured queue capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Backpressure status derived from the current depth.
    #[inline]
    pub fn status(&self) -> QueueStatus {
        QueueStatus::from_depth(self.depth(), self.capacity)
    }
}

/// Starts `workers` workers and a dispatcher over a bounded job queue.
///
/// # Panics
///
/// Panics if `workers` or `queue_capacity` is zero; configuration
/// validation rejects both before the pipeline is built.
pub fn start<P: JobProcessor>(
    label: &'static str,
    processor: Arc<P>,
    workers: usize,
    queue_capacity: usize,
) -> PoolHandle<P::Job> {
    assert!(workers >= 1, "worker pool needs at least one worker");
    assert!(queue_capacity >= 1, "job queue needs at least one slot");

    let (jobs_tx, mut jobs_rx) = mpsc::channel::<P::Job>(queue_capacity);
    let (pool_tx, mut pool_rx) = mpsc::channel::<mpsc::Sender<P::Job>>(workers);

    for worker_index in 0..workers {
        let pool_tx = pool_tx.clone();
        let processor = Arc::clone(&processor);
        tokio::spawn(async move {
            loop {
                // Fresh slot per job: publishing it marks this worker idle.
                let (slot_tx, mut slot_rx) = mpsc::channel::<P::Job>(1);
                if pool_tx.send(slot_tx).await.is_err() {
                    break;
                }
                match slot_rx.recv().await {
                    Some(job) => processor.process(job).await,
                    None => break,
                }
            }
            debug!(pool = label, worker = worker_index, "worker stopped");
        });
    }
    drop(pool_tx);

    tokio::spawn(async move {
        while let Some(worker_slot) = pool_rx.recv().await {
            match jobs_rx.recv().await {
                Some(job) => {
                    if worker_slot.send(job).await.is_err() {
                        error!(pool = label, "idle worker vanished while handing over a job");
                    }
                }
                None => break,
            }
        }
        debug!(pool = label, "dispatcher stopped");
    });

    PoolHandle {
        jobs_tx,
        capacity: queue_capacity,
        label,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;

    struct Recording {
        seen: Mutex<Vec<u64>>,
        processed: AtomicUsize,
        gate: Notify,
        hold: std::sync::atomic::AtomicBool,
    }

    impl Recording {
        fn new(hold: bool) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                processed: AtomicUsize::new(0),
                gate: Notify::new(),
                hold: std::sync::atomic::AtomicBool::new(hold),
            })
        }
    }

    impl JobProcessor for Recording {
        type Job = u64;

        async fn process(&self, job: u64) {
            if self.hold.load(Ordering::SeqCst) {
                self.gate.notified().await;
            }
            self.seen.lock().unwrap().push(job);
            self.processed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_jobs_processed_in_submission_order() {
        let processor = Recording::new(false);
        let pool = start("test", Arc::clone(&processor), 1, 8);

        for n in 0..5u64 {
            pool.submit(n, Duration::from_secs(1)).await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while processor.processed.load(Ordering::SeqCst) < 5 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("jobs not processed in time");

        assert_eq!(*processor.seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_all_workers_receive_work() {
        let processor = Recording::new(false);
        let pool = start("test", Arc::clone(&processor), 4, 16);

        for n in 0..32u64 {
            pool.submit(n, Duration::from_secs(1)).await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while processor.processed.load(Ordering::SeqCst) < 32 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("jobs not processed in time");
    }

    #[tokio::test]
    async fn test_submit_times_out_when_saturated() {
        let processor = Recording::new(true);
        let pool = start("test", Arc::clone(&processor), 1, 1);

        // First job is pulled by the worker and parked on the gate; the
        // second fills the queue slot.
        pool.submit(1, Duration::from_millis(200)).await.unwrap();
        pool.submit(2, Duration::from_millis(200)).await.unwrap();

        let rejected = pool.submit(3, Duration::from_millis(50)).await;
        assert_eq!(rejected, Err(3));

        processor.hold.store(false, Ordering::SeqCst);
        processor.gate.notify_waiters();
    }

    #[tokio::test]
    async fn test_depth_and_status_track_queue() {
        let processor = Recording::new(true);
        let pool = start("test", Arc::clone(&processor), 1, 10);

        assert_eq!(pool.depth(), 0);
        assert_eq!(pool.status(), QueueStatus::Green);

        // Saturate: one job parks on the worker, the rest sit queued.
        for n in 0..10u64 {
            pool.submit(n, Duration::from_millis(500)).await.unwrap();
        }
        assert!(pool.depth() >= 9);
        assert_eq!(pool.status(), QueueStatus::Red);

        processor.hold.store(false, Ordering::SeqCst);
        processor.gate.notify_waiters();
    }
}
