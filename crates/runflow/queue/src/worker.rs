//! Bounded-concurrency job processing

use crate::queue::JobQueue;
use async_trait::async_trait;
use runflow_types::ScheduledJob;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Consumer of due jobs.
///
/// An `Err` is retried with backoff until the queue's attempt ceiling.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &ScheduledJob) -> Result<(), String>;
}

/// Pulls due jobs from a [`JobQueue`] and runs them on at most
/// `concurrency` tasks at a time.
#[derive(Clone)]
pub struct WorkerPool {
    queue: Arc<JobQueue>,
    processor: Arc<dyn JobProcessor>,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(queue: Arc<JobQueue>, processor: Arc<dyn JobProcessor>) -> Self {
        let concurrency = queue.config().concurrency.max(1);
        Self {
            queue,
            processor,
            permits: Arc::new(Semaphore::new(concurrency)),
        }
    }

    /// Run the polling loop on a background task
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));
        WorkerHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let poll = Duration::from_millis(self.queue.config().poll_interval_ms.max(1));
        info!(
            concurrency = self.queue.config().concurrency,
            "Job worker pool started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            let dispatched = if self.queue.is_enabled() {
                self.dispatch_due().await
            } else {
                0
            };
            let wait = if dispatched > 0 {
                Duration::ZERO
            } else if self.queue.is_paused() {
                poll
            } else {
                self.queue.idle_wait(poll).await
            };
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = self.queue.woken() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
        // Wait for in-flight jobs by taking every permit back.
        let total = self.queue.config().concurrency.max(1) as u32;
        let _ = self.permits.acquire_many(total).await;
        info!("Job worker pool stopped");
    }

    /// Claim as many due jobs as there are free permits and spawn them
    async fn dispatch_due(&self) -> usize {
        let free = self.permits.available_permits();
        if free == 0 {
            // Wait for a slot instead of spinning.
            if let Ok(permit) = self.permits.clone().acquire_owned().await {
                drop(permit);
            }
            return 0;
        }
        let jobs = match self.queue.claim(free).await {
            Ok(jobs) => jobs,
            Err(err) => {
                warn!(error = %err, "Could not claim due jobs");
                return 0;
            }
        };
        let count = jobs.len();
        for job in jobs {
            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                break;
            };
            let pool = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                pool.execute(job).await;
            });
        }
        count
    }

    async fn execute(&self, job: ScheduledJob) {
        debug!(
            job_id = %job.id,
            job_type = %job.job_type(),
            run_id = %job.instance_id(),
            attempt = job.attempts,
            "Processing job"
        );
        let processor = self.processor.clone();
        let running = job.clone();
        let outcome = match tokio::spawn(async move { processor.process(&running).await }).await {
            Ok(outcome) => outcome,
            Err(join_err) => Err(format!("job processor panicked: {}", join_err)),
        };
        if let Err(err) = self.queue.finish(&job, outcome).await {
            warn!(job_id = %job.id, error = %err, "Could not record job outcome");
        }
    }

    /// Process every job due now and wait for all of them; returns how
    /// many were processed. Ignores the concurrency limit.
    pub async fn run_due(&self) -> usize {
        let mut processed = 0;
        loop {
            let jobs = match self.queue.claim(usize::MAX).await {
                Ok(jobs) if !jobs.is_empty() => jobs,
                Ok(_) => return processed,
                Err(err) => {
                    warn!(error = %err, "Could not claim due jobs");
                    return processed;
                }
            };
            processed += jobs.len();
            futures::future::join_all(jobs.into_iter().map(|job| self.execute(job))).await;
        }
    }
}

/// Handle to a running worker pool
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Stop polling and wait for in-flight jobs to finish
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            warn!(error = %err, "Worker pool task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueConfig;
    use crate::MemoryBackend;
    use parking_lot::Mutex;
    use runflow_types::{JobId, JobPayload, JobType, RunId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<JobId>>,
        fail_first: AtomicUsize,
    }

    #[async_trait]
    impl JobProcessor for Recorder {
        async fn process(&self, job: &ScheduledJob) -> Result<(), String> {
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err("transient".into());
            }
            self.seen.lock().push(job.id.clone());
            Ok(())
        }
    }

    fn queue(backoff_base_ms: u64) -> Arc<JobQueue> {
        Arc::new(JobQueue::with_backend(
            Arc::new(MemoryBackend::new()),
            QueueConfig {
                backoff_base_ms,
                poll_interval_ms: 10,
                ..QueueConfig::default()
            },
            "node",
        ))
    }

    fn payload(run: &str) -> JobPayload {
        JobPayload::new(JobType::Resume, RunId::new(run))
    }

    #[tokio::test]
    async fn test_run_due_processes_ready_jobs() {
        let queue = queue(0);
        let recorder = Arc::new(Recorder::default());
        queue.add_job(payload("a"), None).await.unwrap();
        queue.add_job(payload("b"), None).await.unwrap();
        queue
            .add_job(payload("later"), Some(Duration::from_secs(60)))
            .await
            .unwrap();

        let pool = WorkerPool::new(queue.clone(), recorder.clone());
        assert_eq!(pool.run_due().await, 2);
        assert_eq!(recorder.seen.lock().len(), 2);
        assert_eq!(queue.stats().await.unwrap().completed, 2);
        assert_eq!(queue.stats().await.unwrap().delayed, 1);
    }

    #[tokio::test]
    async fn test_failures_retry_until_success() {
        let queue = queue(0);
        let recorder = Arc::new(Recorder::default());
        recorder.fail_first.store(2, Ordering::SeqCst);
        queue.add_job(payload("a"), None).await.unwrap();

        let pool = WorkerPool::new(queue.clone(), recorder.clone());
        // Zero backoff makes each retry immediately due again.
        assert_eq!(pool.run_due().await, 3);
        assert_eq!(recorder.seen.lock().len(), 1);
        assert!(queue.failed_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_job_is_parked() {
        let queue = queue(0);
        let recorder = Arc::new(Recorder::default());
        recorder.fail_first.store(10, Ordering::SeqCst);
        queue.add_job(payload("a"), None).await.unwrap();

        let pool = WorkerPool::new(queue.clone(), recorder.clone());
        assert_eq!(pool.run_due().await, 3);
        let failed = queue.failed_jobs().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts, 3);
    }

    #[tokio::test]
    async fn test_background_pool_picks_up_new_jobs() {
        let queue = queue(0);
        let recorder = Arc::new(Recorder::default());
        let handle = WorkerPool::new(queue.clone(), recorder.clone()).start();

        queue
            .add_job(payload("a"), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while recorder.seen.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        handle.stop().await;
        assert_eq!(queue.stats().await.unwrap().completed, 1);
    }
}
