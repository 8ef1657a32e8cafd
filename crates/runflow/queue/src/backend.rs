//! Job storage backends
//!
//! A backend only stores jobs and hands out due ones; retry policy, pausing
//! and worker concurrency live in [`JobQueue`](crate::JobQueue).

use crate::errors::{QueueError, QueueResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use runflow_types::{JobId, JobStatus, RunId, ScheduledJob};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Job counts by state, as seen by a backend
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendCounts {
    /// Queued and already due
    pub waiting: usize,
    /// Queued with `not_before` in the future
    pub delayed: usize,
    pub active: usize,
    pub failed: usize,
}

/// Storage interface for scheduled jobs.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Store a new job; false if a job with the same id already exists.
    async fn insert(&self, job: ScheduledJob) -> QueueResult<bool>;

    /// Mark up to `limit` due jobs active, oldest `not_before` first, and
    /// return them with `attempts` already incremented.
    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> QueueResult<Vec<ScheduledJob>>;

    /// Remove a successfully processed job.
    async fn complete(&self, id: &JobId) -> QueueResult<()>;

    /// Record a failed attempt: requeue at `retry_at`, or park as failed
    /// when `retry_at` is `None`.
    async fn fail(&self, id: &JobId, error: &str, retry_at: Option<DateTime<Utc>>) -> QueueResult<()>;

    /// Remove a queued job; active and failed jobs are left alone.
    async fn remove(&self, id: &JobId) -> QueueResult<bool>;

    /// Remove every queued job of a run.
    async fn remove_for_instance(&self, instance: &RunId) -> QueueResult<usize>;

    async fn counts(&self, now: DateTime<Utc>) -> QueueResult<BackendCounts>;

    async fn failed_jobs(&self) -> QueueResult<Vec<ScheduledJob>>;

    /// Requeue every parked failed job for immediate delivery.
    async fn requeue_failed(&self, now: DateTime<Utc>) -> QueueResult<usize>;

    /// Requeue jobs left active by a previous process.
    async fn recover(&self) -> QueueResult<usize>;

    /// Earliest `not_before` among queued jobs.
    async fn next_due(&self) -> QueueResult<Option<DateTime<Utc>>>;
}

// ── In-memory backend ───────────────────────────────────────────────

/// Non-durable backend; jobs are lost when the process exits
#[derive(Debug, Default)]
pub struct MemoryBackend {
    jobs: Mutex<HashMap<JobId, ScheduledJob>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn insert(&self, job: ScheduledJob) -> QueueResult<bool> {
        let mut jobs = self.jobs.lock();
        if jobs.contains_key(&job.id) {
            return Ok(false);
        }
        jobs.insert(job.id.clone(), job);
        Ok(true)
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> QueueResult<Vec<ScheduledJob>> {
        let mut jobs = self.jobs.lock();
        let mut due: Vec<&mut ScheduledJob> = jobs.values_mut().filter(|j| j.is_due(now)).collect();
        due.sort_by(|a, b| a.not_before.cmp(&b.not_before).then_with(|| a.id.0.cmp(&b.id.0)));
        Ok(due
            .into_iter()
            .take(limit)
            .map(|job| {
                job.status = JobStatus::Active;
                job.attempts += 1;
                job.clone()
            })
            .collect())
    }

    async fn complete(&self, id: &JobId) -> QueueResult<()> {
        self.jobs.lock().remove(id);
        Ok(())
    }

    async fn fail(&self, id: &JobId, error: &str, retry_at: Option<DateTime<Utc>>) -> QueueResult<()> {
        let mut jobs = self.jobs.lock();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;
        job.last_error = Some(error.to_string());
        match retry_at {
            Some(at) => {
                job.status = JobStatus::Queued;
                job.not_before = at;
            }
            None => job.status = JobStatus::Failed,
        }
        Ok(())
    }

    async fn remove(&self, id: &JobId) -> QueueResult<bool> {
        let mut jobs = self.jobs.lock();
        match jobs.get(id) {
            Some(job) if job.status == JobStatus::Queued => {
                jobs.remove(id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove_for_instance(&self, instance: &RunId) -> QueueResult<usize> {
        let mut jobs = self.jobs.lock();
        let before = jobs.len();
        jobs.retain(|_, j| !(j.status == JobStatus::Queued && j.instance_id() == instance));
        Ok(before - jobs.len())
    }

    async fn counts(&self, now: DateTime<Utc>) -> QueueResult<BackendCounts> {
        let jobs = self.jobs.lock();
        let mut counts = BackendCounts::default();
        for job in jobs.values() {
            match job.status {
                JobStatus::Queued if job.not_before <= now => counts.waiting += 1,
                JobStatus::Queued => counts.delayed += 1,
                JobStatus::Active => counts.active += 1,
                JobStatus::Failed => counts.failed += 1,
                JobStatus::Completed => {}
            }
        }
        Ok(counts)
    }

    async fn failed_jobs(&self) -> QueueResult<Vec<ScheduledJob>> {
        let jobs = self.jobs.lock();
        let mut failed: Vec<ScheduledJob> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Failed)
            .cloned()
            .collect();
        failed.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(failed)
    }

    async fn requeue_failed(&self, now: DateTime<Utc>) -> QueueResult<usize> {
        let mut jobs = self.jobs.lock();
        let mut count = 0;
        for job in jobs.values_mut().filter(|j| j.status == JobStatus::Failed) {
            job.status = JobStatus::Queued;
            job.attempts = 0;
            job.not_before = now;
            count += 1;
        }
        Ok(count)
    }

    async fn recover(&self) -> QueueResult<usize> {
        let mut jobs = self.jobs.lock();
        let mut count = 0;
        for job in jobs.values_mut().filter(|j| j.status == JobStatus::Active) {
            job.status = JobStatus::Queued;
            count += 1;
        }
        Ok(count)
    }

    async fn next_due(&self) -> QueueResult<Option<DateTime<Utc>>> {
        Ok(self
            .jobs
            .lock()
            .values()
            .filter(|j| j.status == JobStatus::Queued)
            .map(|j| j.not_before)
            .min())
    }
}
