use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;
use uuid::Uuid;

use siret_sync_core::{JobKind, JobStatus, SyncJob};

use crate::to_rfc3339;

const INTERRUPTED: &str = "worker interrupted";

const RETURNING_COLUMNS: &str = "id, kind, etablissement_id, procedure_id, status, attempts, \
     max_attempts, last_error, run_at, created_at, updated_at";

/// Repository for the persisted synchronization job queue.
#[derive(Clone)]
pub struct SyncJobRepository {
    pool: SqlitePool,
}

impl SyncJobRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts a job due immediately.
    pub async fn enqueue(&self, job: &NewSyncJob) -> Result<SyncJob, SyncJobError> {
        let now = to_rfc3339(job.enqueued_at);
        let row = sqlx::query_as::<_, SyncJobRow>(&format!(
            "INSERT INTO sync_jobs \
             (id, kind, etablissement_id, procedure_id, status, attempts, max_attempts, run_at, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?, ?) \
             RETURNING {RETURNING_COLUMNS}"
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(job.kind.as_str())
        .bind(job.etablissement_id)
        .bind(job.procedure_id)
        .bind(JobStatus::Enqueued.as_str())
        .bind(i64::from(job.max_attempts.max(1)))
        .bind(&now)
        .bind(&now)
        .bind(&now)
        .fetch_one(&self.pool)
        .await?;

        row.into_domain()
    }

    pub async fn fetch(&self, id: &str) -> Result<Option<SyncJob>, SyncJobError> {
        let row = sqlx::query_as::<_, SyncJobRow>(&format!(
            "SELECT {RETURNING_COLUMNS} FROM sync_jobs WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SyncJobRow::into_domain).transpose()
    }

    /// Lists the jobs of an establishment, oldest first.
    pub async fn list_for_etablissement(
        &self,
        etablissement_id: i64,
    ) -> Result<Vec<SyncJob>, SyncJobError> {
        let rows = sqlx::query_as::<_, SyncJobRow>(&format!(
            "SELECT {RETURNING_COLUMNS} FROM sync_jobs \
             WHERE etablissement_id = ? \
             ORDER BY created_at ASC, kind ASC"
        ))
        .bind(etablissement_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SyncJobRow::into_domain).collect()
    }

    /// Moves up to `limit` due jobs to `running`, counting the new attempt.
    ///
    /// The selection and the update happen in one statement, so concurrent
    /// workers never claim the same job twice.
    pub async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<SyncJob>, SyncJobError> {
        let now = to_rfc3339(now);
        let rows = sqlx::query_as::<_, SyncJobRow>(&format!(
            "UPDATE sync_jobs \
             SET status = 'running', attempts = attempts + 1, updated_at = ? \
             WHERE id IN ( \
                 SELECT id FROM sync_jobs \
                 WHERE status IN ('enqueued', 'retrying') AND run_at <= ? \
                 ORDER BY run_at ASC, created_at ASC \
                 LIMIT ? \
             ) \
             RETURNING {RETURNING_COLUMNS}"
        ))
        .bind(&now)
        .bind(&now)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = rows
            .into_iter()
            .map(SyncJobRow::into_domain)
            .collect::<Result<Vec<_>, _>>()?;
        jobs.sort_by(|a, b| a.run_at.cmp(&b.run_at).then(a.created_at.cmp(&b.created_at)));
        Ok(jobs)
    }

    pub async fn mark_succeeded(&self, id: &str, now: DateTime<Utc>) -> Result<(), SyncJobError> {
        self.finish(id, JobStatus::Succeeded, None, now).await
    }

    /// Ends the job on an expected registry outcome.
    pub async fn mark_suppressed(
        &self,
        id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), SyncJobError> {
        self.finish(id, JobStatus::Suppressed, Some(reason), now)
            .await
    }

    /// Ends the job after its last attempt failed.
    pub async fn mark_failed(
        &self,
        id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), SyncJobError> {
        self.finish(id, JobStatus::Failed, Some(error), now).await
    }

    /// Puts a running job back in the queue, due at `run_at`.
    pub async fn schedule_retry(
        &self,
        id: &str,
        error: &str,
        run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), SyncJobError> {
        let result = sqlx::query(
            "UPDATE sync_jobs SET status = 'retrying', last_error = ?, run_at = ?, updated_at = ? \
             WHERE id = ? AND status = 'running'",
        )
        .bind(error)
        .bind(to_rfc3339(run_at))
        .bind(to_rfc3339(now))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SyncJobError::NotRunning(id.to_string()));
        }
        Ok(())
    }

    /// Removes jobs of an establishment that have not started yet.
    pub async fn discard_pending_for_etablissement(
        &self,
        etablissement_id: i64,
    ) -> Result<u64, SyncJobError> {
        let result = sqlx::query(
            "DELETE FROM sync_jobs \
             WHERE etablissement_id = ? AND status IN ('enqueued', 'retrying')",
        )
        .bind(etablissement_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Returns jobs stuck in `running` since before `stale_before` to the queue.
    ///
    /// A worker that dies mid-job leaves its row running; this gives the job
    /// another delivery. Jobs that already used their last attempt are marked
    /// `failed` and handed back so the caller can report them.
    pub async fn requeue_stale(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<StaleJobs, SyncJobError> {
        let now = to_rfc3339(now);
        let stale_before = to_rfc3339(stale_before);
        let mut tx = self.pool.begin().await?;

        let exhausted = sqlx::query_as::<_, SyncJobRow>(&format!(
            "UPDATE sync_jobs \
             SET status = 'failed', \
                 last_error = COALESCE(last_error, '{INTERRUPTED}'), \
                 updated_at = ? \
             WHERE status = 'running' AND updated_at < ? AND attempts >= max_attempts \
             RETURNING {RETURNING_COLUMNS}"
        ))
        .bind(&now)
        .bind(&stale_before)
        .fetch_all(&mut *tx)
        .await?;

        let requeued = sqlx::query(&format!(
            "UPDATE sync_jobs \
             SET status = 'retrying', \
                 last_error = COALESCE(last_error, '{INTERRUPTED}'), \
                 run_at = ?, \
                 updated_at = ? \
             WHERE status = 'running' AND updated_at < ?"
        ))
        .bind(&now)
        .bind(&now)
        .bind(&stale_before)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        Ok(StaleJobs {
            requeued,
            exhausted: exhausted
                .into_iter()
                .map(SyncJobRow::into_domain)
                .collect::<Result<_, _>>()?,
        })
    }

    async fn finish(
        &self,
        id: &str,
        status: JobStatus,
        last_error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), SyncJobError> {
        let result = sqlx::query(
            "UPDATE sync_jobs SET status = ?, last_error = ?, updated_at = ? \
             WHERE id = ? AND status = 'running'",
        )
        .bind(status.as_str())
        .bind(last_error)
        .bind(to_rfc3339(now))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SyncJobError::NotRunning(id.to_string()));
        }
        Ok(())
    }
}

/// Payload required to enqueue a job.
#[derive(Debug, Clone)]
pub struct NewSyncJob {
    pub kind: JobKind,
    pub etablissement_id: i64,
    pub procedure_id: i64,
    pub max_attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// Outcome of [`SyncJobRepository::requeue_stale`].
#[derive(Debug, Default)]
pub struct StaleJobs {
    /// Jobs put back in the queue for another attempt.
    pub requeued: u64,
    /// Jobs that had no attempt left, now `failed`.
    pub exhausted: Vec<SyncJob>,
}

/// Errors that can occur while operating the job queue.
#[derive(Debug, Error)]
pub enum SyncJobError {
    #[error("job {0} is not running")]
    NotRunning(String),
    #[error("corrupt job row: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, sqlx::FromRow)]
struct SyncJobRow {
    id: String,
    kind: String,
    etablissement_id: i64,
    procedure_id: i64,
    status: String,
    attempts: i64,
    max_attempts: i64,
    last_error: Option<String>,
    run_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl SyncJobRow {
    fn into_domain(self) -> Result<SyncJob, SyncJobError> {
        let kind = self
            .kind
            .parse::<JobKind>()
            .map_err(|err| SyncJobError::Corrupt(err.to_string()))?;
        let status = self
            .status
            .parse::<JobStatus>()
            .map_err(|err| SyncJobError::Corrupt(err.to_string()))?;

        Ok(SyncJob {
            id: self.id,
            kind,
            etablissement_id: self.etablissement_id,
            procedure_id: self.procedure_id,
            status,
            attempts: self.attempts.max(0) as u32,
            max_attempts: self.max_attempts.max(1) as u32,
            last_error: self.last_error,
            run_at: self.run_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
