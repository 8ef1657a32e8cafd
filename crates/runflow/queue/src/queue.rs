//! The scheduling queue facade used by the engine

use crate::backend::{MemoryBackend, QueueBackend};
use crate::errors::{QueueError, QueueResult};
use chrono::Utc;
use runflow_types::{JobId, JobPayload, RunId, ScheduledJob};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Where jobs are stored
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// In-process only; jobs do not survive a restart
    #[default]
    Memory,
    Sqlite {
        url: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        #[serde(default = "default_connect_timeout_secs")]
        connect_timeout_secs: u64,
    },
    /// No queue; callers use their in-process fallback
    Disabled,
}

fn default_max_connections() -> u32 {
    5
}

fn default_connect_timeout_secs() -> u64 {
    5
}

/// Queue and worker pool settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub backend: BackendConfig,
    /// Jobs processed at the same time
    pub concurrency: usize,
    /// Attempts before a job is parked as failed
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt
    pub backoff_base_ms: u64,
    /// Idle poll interval of the worker loop
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::Memory,
            concurrency: 2,
            max_attempts: 3,
            backoff_base_ms: 1000,
            poll_interval_ms: 250,
        }
    }
}

impl QueueConfig {
    /// Delay before retrying after the `attempt`-th failure (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(1u64 << exponent))
    }
}

/// Queue statistics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    /// Completed by this process since start
    pub completed: u64,
    pub failed: usize,
    pub delayed: usize,
    pub paused: bool,
}

/// Durable scheduling queue.
///
/// A disabled queue accepts no jobs: [`JobQueue::add_job`] returns `None`
/// and the caller must fall back to an in-process timer.
pub struct JobQueue {
    backend: Option<Arc<dyn QueueBackend>>,
    deployment_id: String,
    config: QueueConfig,
    paused: AtomicBool,
    completed: AtomicU64,
    wake: Notify,
}

impl JobQueue {
    /// Build the configured backend. A backend that cannot be reached
    /// yields a disabled queue; this is logged once and is not an error.
    pub async fn connect(config: QueueConfig, deployment_id: impl Into<String>) -> Self {
        let deployment_id = deployment_id.into();
        let backend: Option<Arc<dyn QueueBackend>> = match &config.backend {
            BackendConfig::Memory => Some(Arc::new(MemoryBackend::new())),
            BackendConfig::Disabled => None,
            BackendConfig::Sqlite {
                url,
                max_connections,
                connect_timeout_secs,
            } => Self::open_sqlite(url, *max_connections, *connect_timeout_secs).await,
        };

        let queue = Self::build(backend, config, deployment_id);
        match &queue.backend {
            Some(backend) => match backend.recover().await {
                Ok(0) => info!(deployment_id = %queue.deployment_id, "Scheduling queue enabled"),
                Ok(recovered) => info!(
                    deployment_id = %queue.deployment_id,
                    recovered,
                    "Scheduling queue enabled, requeued interrupted jobs"
                ),
                Err(err) => warn!(error = %err, "Could not requeue interrupted jobs"),
            },
            None => warn!(
                deployment_id = %queue.deployment_id,
                "Scheduling queue disabled; waits and timeouts fall back to in-process timers"
            ),
        }
        queue
    }

    #[cfg(feature = "sqlite")]
    async fn open_sqlite(
        url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
    ) -> Option<Arc<dyn QueueBackend>> {
        match crate::SqliteBackend::connect(url, max_connections, connect_timeout_secs).await {
            Ok(backend) => Some(Arc::new(backend)),
            Err(err) => {
                warn!(error = %err, "Scheduling queue backend unreachable");
                None
            }
        }
    }

    #[cfg(not(feature = "sqlite"))]
    async fn open_sqlite(_url: &str, _max: u32, _timeout: u64) -> Option<Arc<dyn QueueBackend>> {
        warn!("SQLite queue backend requested but the `sqlite` feature is not enabled");
        None
    }

    /// Queue over an explicit backend
    pub fn with_backend(
        backend: Arc<dyn QueueBackend>,
        config: QueueConfig,
        deployment_id: impl Into<String>,
    ) -> Self {
        Self::build(Some(backend), config, deployment_id.into())
    }

    pub fn in_memory(deployment_id: impl Into<String>) -> Self {
        Self::with_backend(
            Arc::new(MemoryBackend::new()),
            QueueConfig::default(),
            deployment_id,
        )
    }

    pub fn disabled(deployment_id: impl Into<String>) -> Self {
        Self::build(
            None,
            QueueConfig {
                backend: BackendConfig::Disabled,
                ..QueueConfig::default()
            },
            deployment_id.into(),
        )
    }

    fn build(backend: Option<Arc<dyn QueueBackend>>, config: QueueConfig, deployment_id: String) -> Self {
        Self {
            backend,
            deployment_id,
            config,
            paused: AtomicBool::new(false),
            completed: AtomicU64::new(0),
            wake: Notify::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn deployment_id(&self) -> &str {
        &self.deployment_id
    }

    fn backend(&self) -> QueueResult<&Arc<dyn QueueBackend>> {
        self.backend.as_ref().ok_or(QueueError::Disabled)
    }

    /// Schedule a job `delay` from now.
    ///
    /// Returns `None` when the queue is disabled or the backend rejects the
    /// write; the caller must then use its non-durable fallback.
    pub async fn add_job(&self, payload: JobPayload, delay: Option<Duration>) -> Option<JobId> {
        let backend = self.backend.as_ref()?;
        let now = Utc::now();
        let id = JobId::deterministic(
            &self.deployment_id,
            payload.job_type,
            &payload.instance_id,
            payload.node_id.as_ref(),
            now.timestamp_millis(),
        );
        let delay = delay.unwrap_or_default();
        let not_before = now
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let job = ScheduledJob::new(id.clone(), payload, not_before);

        match backend.insert(job).await {
            Ok(inserted) => {
                if inserted {
                    debug!(job_id = %id, delay_ms = delay.as_millis() as u64, "Job scheduled");
                } else {
                    debug!(job_id = %id, "Duplicate job ignored");
                }
                self.wake.notify_one();
                Some(id)
            }
            Err(err) => {
                warn!(job_id = %id, error = %err, "Could not schedule job");
                None
            }
        }
    }

    /// Cancel a queued job; false if it was not queued
    pub async fn cancel_job(&self, id: &JobId) -> QueueResult<bool> {
        let removed = self.backend()?.remove(id).await?;
        if removed {
            debug!(job_id = %id, "Job cancelled");
        }
        Ok(removed)
    }

    /// Cancel every queued job of a run; in-flight jobs are not interrupted
    pub async fn cancel_instance_jobs(&self, instance: &RunId) -> QueueResult<usize> {
        let Some(backend) = &self.backend else {
            return Ok(0);
        };
        let removed = backend.remove_for_instance(instance).await?;
        if removed > 0 {
            debug!(run_id = %instance, removed, "Cancelled queued jobs for run");
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> QueueResult<QueueStats> {
        let counts = self.backend()?.counts(Utc::now()).await?;
        Ok(QueueStats {
            waiting: counts.waiting,
            active: counts.active,
            completed: self.completed.load(Ordering::Relaxed),
            failed: counts.failed,
            delayed: counts.delayed,
            paused: self.is_paused(),
        })
    }

    /// Stop handing out jobs; jobs already running finish normally
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!("Scheduling queue paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("Scheduling queue resumed");
            self.wake.notify_one();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Requeue every parked failed job
    pub async fn retry_failed(&self) -> QueueResult<usize> {
        let count = self.backend()?.requeue_failed(Utc::now()).await?;
        if count > 0 {
            info!(count, "Requeued failed jobs");
            self.wake.notify_one();
        }
        Ok(count)
    }

    pub async fn failed_jobs(&self) -> QueueResult<Vec<ScheduledJob>> {
        self.backend()?.failed_jobs().await
    }

    // ── Worker-facing operations ───────────────────────────────────

    pub(crate) async fn claim(&self, limit: usize) -> QueueResult<Vec<ScheduledJob>> {
        if self.is_paused() || limit == 0 {
            return Ok(Vec::new());
        }
        self.backend()?.claim_due(Utc::now(), limit).await
    }

    pub(crate) async fn finish(&self, job: &ScheduledJob, outcome: Result<(), String>) -> QueueResult<()> {
        let backend = self.backend()?;
        match outcome {
            Ok(()) => {
                backend.complete(&job.id).await?;
                self.completed.fetch_add(1, Ordering::Relaxed);
                debug!(job_id = %job.id, job_type = %job.job_type(), "Job completed");
            }
            Err(error) if job.attempts >= self.config.max_attempts => {
                backend.fail(&job.id, &error, None).await?;
                warn!(
                    job_id = %job.id,
                    attempts = job.attempts,
                    error = %error,
                    "Job failed permanently"
                );
            }
            Err(error) => {
                let delay = self.config.backoff(job.attempts);
                let retry_at = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                backend.fail(&job.id, &error, Some(retry_at)).await?;
                warn!(
                    job_id = %job.id,
                    attempt = job.attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %error,
                    "Job failed, retrying"
                );
            }
        }
        Ok(())
    }

    /// Time until the next queued job is due, capped at `max`
    pub(crate) async fn idle_wait(&self, max: Duration) -> Duration {
        let Some(backend) = &self.backend else {
            return max;
        };
        match backend.next_due().await {
            Ok(Some(at)) => (at - Utc::now()).to_std().unwrap_or_default().min(max),
            _ => max,
        }
    }

    pub(crate) async fn woken(&self) {
        self.wake.notified().await
    }
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("deployment_id", &self.deployment_id)
            .field("enabled", &self.is_enabled())
            .field("paused", &self.is_paused())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runflow_types::{JobType, StepId};

    fn payload(run: &str) -> JobPayload {
        JobPayload::new(JobType::WaitComplete, RunId::new(run)).with_step(StepId::new("w"))
    }

    #[test]
    fn test_backoff_doubles() {
        let config = QueueConfig::default();
        assert_eq!(config.backoff(1), Duration::from_millis(1000));
        assert_eq!(config.backoff(2), Duration::from_millis(2000));
        assert_eq!(config.backoff(3), Duration::from_millis(4000));
    }

    #[test]
    fn test_config_parses_tagged_backend() {
        let config: QueueConfig = serde_json::from_value(serde_json::json!({
            "backend": {"kind": "sqlite", "url": "sqlite://jobs.db"},
            "concurrency": 4
        }))
        .unwrap();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.max_attempts, 3);
        assert!(matches!(
            config.backend,
            BackendConfig::Sqlite { max_connections: 5, .. }
        ));
    }

    #[tokio::test]
    async fn test_disabled_queue_returns_none() {
        let queue = JobQueue::disabled("node");
        assert!(!queue.is_enabled());
        assert!(queue.add_job(payload("r"), None).await.is_none());
        assert_eq!(queue.cancel_instance_jobs(&RunId::new("r")).await.unwrap(), 0);
        assert_eq!(queue.stats().await, Err(QueueError::Disabled));
    }

    #[tokio::test]
    async fn test_connect_disabled_backend() {
        let config = QueueConfig {
            backend: BackendConfig::Disabled,
            ..QueueConfig::default()
        };
        assert!(!JobQueue::connect(config, "node").await.is_enabled());
    }

    #[tokio::test]
    async fn test_add_and_cancel_jobs() {
        let queue = JobQueue::in_memory("node");
        let id = queue
            .add_job(payload("r1"), Some(Duration::from_secs(60)))
            .await
            .unwrap();
        assert!(id.0.starts_with("node:wait_complete:r1:w:"));
        queue.add_job(payload("r1"), Some(Duration::from_secs(60))).await;
        queue.add_job(payload("r2"), None).await;

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.waiting, 1);
        assert!(stats.delayed >= 1);

        assert!(queue.cancel_job(&id).await.unwrap());
        assert!(!queue.cancel_job(&id).await.unwrap());
        queue.cancel_instance_jobs(&RunId::new("r1")).await.unwrap();
        assert_eq!(queue.stats().await.unwrap().delayed, 0);
    }

    #[tokio::test]
    async fn test_finish_retries_then_parks() {
        let queue = JobQueue::in_memory("node");
        queue.add_job(payload("r"), None).await.unwrap();

        let job = queue.claim(1).await.unwrap().remove(0);
        queue.finish(&job, Err("first".into())).await.unwrap();
        assert_eq!(queue.stats().await.unwrap().delayed, 1);

        // Pretend the remaining attempts were used up.
        let mut exhausted = job.clone();
        exhausted.attempts = queue.config().max_attempts;
        queue.finish(&exhausted, Err("last".into())).await.unwrap();
        let failed = queue.failed_jobs().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].last_error.as_deref(), Some("last"));

        assert_eq!(queue.retry_failed().await.unwrap(), 1);
        let job = queue.claim(1).await.unwrap().remove(0);
        queue.finish(&job, Ok(())).await.unwrap();
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn test_paused_queue_hands_out_nothing() {
        let queue = JobQueue::in_memory("node");
        queue.add_job(payload("r"), None).await.unwrap();
        queue.pause();
        assert!(queue.stats().await.unwrap().paused);
        assert!(queue.claim(10).await.unwrap().is_empty());
        queue.resume();
        assert_eq!(queue.claim(10).await.unwrap().len(), 1);
    }
}
