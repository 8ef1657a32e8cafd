//! SQLite job storage

use crate::backend::{BackendCounts, QueueBackend};
use crate::errors::{QueueError, QueueResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use runflow_types::{JobId, JobPayload, JobStatus, RunId, ScheduledJob};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;

const JOB_COLUMNS: &str =
    "id, payload, not_before, status, attempts, last_error, created_at";

/// Durable backend over a SQLite database (`runflow_jobs` table)
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Open (creating if missing) the database and initialize the schema
    pub async fn connect(
        url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
    ) -> QueueResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| QueueError::Connection(e.to_string()))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(connect_timeout_secs))
            .connect_with(options)
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        let backend = Self { pool };
        backend.initialize_schema().await?;
        Ok(backend)
    }

    async fn initialize_schema(&self) -> QueueResult<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS runflow_jobs (
                id TEXT PRIMARY KEY,
                job_type TEXT NOT NULL,
                instance_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                not_before INTEGER NOT NULL,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at INTEGER NOT NULL
            );
            "#,
            r#"CREATE INDEX IF NOT EXISTS runflow_jobs_due ON runflow_jobs(status, not_before);"#,
            r#"CREATE INDEX IF NOT EXISTS runflow_jobs_instance ON runflow_jobs(instance_id);"#,
        ];

        for stmt in statements {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(backend_error)?;
        }
        Ok(())
    }

    fn row_to_job(row: &SqliteRow) -> QueueResult<ScheduledJob> {
        let id: String = row.try_get("id").map_err(backend_error)?;
        let payload: String = row.try_get("payload").map_err(backend_error)?;
        let not_before: i64 = row.try_get("not_before").map_err(backend_error)?;
        let status: String = row.try_get("status").map_err(backend_error)?;
        let attempts: i64 = row.try_get("attempts").map_err(backend_error)?;
        let last_error: Option<String> = row.try_get("last_error").map_err(backend_error)?;
        let created_at: i64 = row.try_get("created_at").map_err(backend_error)?;

        let payload: JobPayload = serde_json::from_str(&payload)?;
        let status = JobStatus::parse(&status)
            .ok_or_else(|| QueueError::Serialization(format!("unknown job status '{}'", status)))?;
        Ok(ScheduledJob {
            id: JobId::new(id),
            payload,
            not_before: from_millis(not_before)?,
            status,
            attempts: attempts.max(0) as u32,
            last_error,
            created_at: from_millis(created_at)?,
        })
    }
}

fn backend_error(err: sqlx::Error) -> QueueError {
    QueueError::Backend(err.to_string())
}

fn from_millis(ms: i64) -> QueueResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| QueueError::Serialization(format!("timestamp out of range: {}", ms)))
}

#[async_trait]
impl QueueBackend for SqliteBackend {
    async fn insert(&self, job: ScheduledJob) -> QueueResult<bool> {
        let payload = serde_json::to_string(&job.payload)?;
        let result = sqlx::query(
            r#"
            INSERT INTO runflow_jobs
                (id, job_type, instance_id, payload, not_before, status, attempts, last_error, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&job.id.0)
        .bind(job.job_type().as_str())
        .bind(&job.instance_id().0)
        .bind(payload)
        .bind(job.not_before.timestamp_millis())
        .bind(job.status.as_str())
        .bind(job.attempts as i64)
        .bind(&job.last_error)
        .bind(job.created_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(backend_error)?;
        Ok(result.rows_affected() == 1)
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> QueueResult<Vec<ScheduledJob>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut tx = self.pool.begin().await.map_err(backend_error)?;
        let rows = sqlx::query(&format!(
            "SELECT {} FROM runflow_jobs WHERE status = 'queued' AND not_before <= ? \
             ORDER BY not_before, id LIMIT ?",
            JOB_COLUMNS
        ))
        .bind(now.timestamp_millis())
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(backend_error)?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut job = Self::row_to_job(row)?;
            let updated = sqlx::query(
                "UPDATE runflow_jobs SET status = 'active', attempts = attempts + 1 \
                 WHERE id = ? AND status = 'queued'",
            )
            .bind(&job.id.0)
            .execute(&mut *tx)
            .await
            .map_err(backend_error)?;
            if updated.rows_affected() == 1 {
                job.status = JobStatus::Active;
                job.attempts += 1;
                claimed.push(job);
            }
        }
        tx.commit().await.map_err(backend_error)?;
        Ok(claimed)
    }

    async fn complete(&self, id: &JobId) -> QueueResult<()> {
        sqlx::query("DELETE FROM runflow_jobs WHERE id = ?")
            .bind(&id.0)
            .execute(&self.pool)
            .await
            .map_err(backend_error)?;
        Ok(())
    }

    async fn fail(&self, id: &JobId, error: &str, retry_at: Option<DateTime<Utc>>) -> QueueResult<()> {
        let result = match retry_at {
            Some(at) => sqlx::query(
                "UPDATE runflow_jobs SET status = 'queued', not_before = ?, last_error = ? WHERE id = ?",
            )
            .bind(at.timestamp_millis())
            .bind(error)
            .bind(&id.0),
            None => sqlx::query(
                "UPDATE runflow_jobs SET status = 'failed', last_error = ? WHERE id = ?",
            )
            .bind(error)
            .bind(&id.0),
        }
        .execute(&self.pool)
        .await
        .map_err(backend_error)?;
        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(id.clone()));
        }
        Ok(())
    }

    async fn remove(&self, id: &JobId) -> QueueResult<bool> {
        let result = sqlx::query("DELETE FROM runflow_jobs WHERE id = ? AND status = 'queued'")
            .bind(&id.0)
            .execute(&self.pool)
            .await
            .map_err(backend_error)?;
        Ok(result.rows_affected() == 1)
    }

    async fn remove_for_instance(&self, instance: &RunId) -> QueueResult<usize> {
        let result =
            sqlx::query("DELETE FROM runflow_jobs WHERE instance_id = ? AND status = 'queued'")
                .bind(&instance.0)
                .execute(&self.pool)
                .await
                .map_err(backend_error)?;
        Ok(result.rows_affected() as usize)
    }

    async fn counts(&self, now: DateTime<Utc>) -> QueueResult<BackendCounts> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN status = 'queued' AND not_before <= ? THEN 1 ELSE 0 END), 0) AS waiting,
                COALESCE(SUM(CASE WHEN status = 'queued' AND not_before > ? THEN 1 ELSE 0 END), 0) AS delayed,
                COALESCE(SUM(CASE WHEN status = 'active' THEN 1 ELSE 0 END), 0) AS active,
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failed
            FROM runflow_jobs
            "#,
        )
        .bind(now.timestamp_millis())
        .bind(now.timestamp_millis())
        .fetch_one(&self.pool)
        .await
        .map_err(backend_error)?;

        let get = |column: &str| -> QueueResult<usize> {
            let n: i64 = row.try_get(column).map_err(backend_error)?;
            Ok(n.max(0) as usize)
        };
        Ok(BackendCounts {
            waiting: get("waiting")?,
            delayed: get("delayed")?,
            active: get("active")?,
            failed: get("failed")?,
        })
    }

    async fn failed_jobs(&self) -> QueueResult<Vec<ScheduledJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM runflow_jobs WHERE status = 'failed' ORDER BY created_at",
            JOB_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(backend_error)?;
        rows.iter().map(Self::row_to_job).collect()
    }

    async fn requeue_failed(&self, now: DateTime<Utc>) -> QueueResult<usize> {
        let result = sqlx::query(
            "UPDATE runflow_jobs SET status = 'queued', attempts = 0, not_before = ? WHERE status = 'failed'",
        )
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(backend_error)?;
        Ok(result.rows_affected() as usize)
    }

    async fn recover(&self) -> QueueResult<usize> {
        let result = sqlx::query("UPDATE runflow_jobs SET status = 'queued' WHERE status = 'active'")
            .execute(&self.pool)
            .await
            .map_err(backend_error)?;
        Ok(result.rows_affected() as usize)
    }

    async fn next_due(&self) -> QueueResult<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT MIN(not_before) AS next FROM runflow_jobs WHERE status = 'queued'")
            .fetch_one(&self.pool)
            .await
            .map_err(backend_error)?;
        let next: Option<i64> = row.try_get("next").map_err(backend_error)?;
        next.map(from_millis).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use runflow_types::{JobType, StepId};

    fn job(id: &str, run: &str, not_before: DateTime<Utc>) -> ScheduledJob {
        ScheduledJob::new(
            JobId::new(id),
            JobPayload::new(JobType::WaitComplete, RunId::new(run))
                .with_step(StepId::new("pause"))
                .with_data(serde_json::json!({"k": 1})),
            not_before,
        )
    }

    async fn open(dir: &tempfile::TempDir) -> SqliteBackend {
        let url = format!("sqlite://{}", dir.path().join("jobs.db").display());
        SqliteBackend::connect(&url, 2, 5).await.unwrap()
    }

    #[tokio::test]
    async fn test_jobs_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        {
            let backend = open(&dir).await;
            assert!(backend.insert(job("a", "r1", now)).await.unwrap());
            assert!(!backend.insert(job("a", "r1", now)).await.unwrap());
            backend.pool.close().await;
        }

        let backend = open(&dir).await;
        let claimed = backend.claim_due(now, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].payload.node_id, Some(StepId::new("pause")));
        assert_eq!(claimed[0].payload.data, Some(serde_json::json!({"k": 1})));
        assert_eq!(claimed[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_recover_after_crash() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        {
            let backend = open(&dir).await;
            backend.insert(job("a", "r1", now)).await.unwrap();
            backend.claim_due(now, 10).await.unwrap();
            backend.pool.close().await;
        }

        let backend = open(&dir).await;
        assert_eq!(backend.counts(now).await.unwrap().active, 1);
        assert_eq!(backend.recover().await.unwrap(), 1);
        assert_eq!(backend.claim_due(now, 10).await.unwrap()[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_fail_cancel_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open(&dir).await;
        let now = Utc::now();
        backend.insert(job("a", "r1", now)).await.unwrap();
        backend.insert(job("b", "r1", now + ChronoDuration::hours(1))).await.unwrap();
        backend.insert(job("c", "r2", now)).await.unwrap();

        let counts = backend.counts(now).await.unwrap();
        assert_eq!((counts.waiting, counts.delayed), (2, 1));

        let claimed = backend.claim_due(now, 1).await.unwrap();
        assert_eq!(claimed[0].id, JobId::new("a"));
        backend.fail(&JobId::new("a"), "boom", None).await.unwrap();
        assert_eq!(backend.failed_jobs().await.unwrap()[0].last_error.as_deref(), Some("boom"));

        assert_eq!(backend.remove_for_instance(&RunId::new("r1")).await.unwrap(), 1);
        assert_eq!(backend.next_due().await.unwrap().map(|t| t.timestamp_millis()), Some(now.timestamp_millis()));
        assert_eq!(backend.requeue_failed(now).await.unwrap(), 1);
        assert_eq!(backend.counts(now).await.unwrap().waiting, 2);

        assert!(matches!(
            backend.fail(&JobId::new("missing"), "x", None).await,
            Err(QueueError::NotFound(_))
        ));
    }
}
