use std::{sync::Arc, time::Instant};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::{counter, histogram};
use thiserror::Error;
use tracing::{error, info, warn};

use siret_sync_core::{
    Establishment, FailureClass, JobKind, RetryDecision, RetryPolicy, SyncJob,
};
use siret_sync_storage::{Database, EstablishmentError, SyncJobError};

use crate::adapter::{AdapterError, Fetched, RegistryAdapter};
use crate::Clock;

/// Receives failures that outlived every retry.
///
/// Expected registry refusals never reach the reporter.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, job: &SyncJob, error: &str);
}

/// Reports exhausted jobs as error events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, job: &SyncJob, error: &str) {
        counter!("sync_jobs_reported_total", "kind" => job.kind.as_str()).increment(1);
        error!(
            stage = "sync",
            job_id = %job.id,
            kind = %job.kind,
            etablissement_id = job.etablissement_id,
            attempts = job.attempts,
            error = %error,
            "sync job failed after last attempt"
        );
    }
}

/// How a single execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobRun {
    Succeeded,
    /// Ended quietly; the label names the cause.
    Suppressed(&'static str),
    Retrying { run_at: DateTime<Utc> },
    Failed,
}

impl JobRun {
    fn outcome(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Suppressed(_) => "suppressed",
            Self::Retrying { .. } => "retrying",
            Self::Failed => "failed",
        }
    }
}

/// Runs claimed sync jobs against the registry and settles them in the queue.
#[derive(Clone)]
pub struct SyncExecutor {
    database: Database,
    adapter: RegistryAdapter,
    policy: RetryPolicy,
    reporter: Arc<dyn ErrorReporter>,
    clock: Clock,
}

impl SyncExecutor {
    pub fn new(
        database: Database,
        adapter: RegistryAdapter,
        policy: RetryPolicy,
        reporter: Arc<dyn ErrorReporter>,
        clock: Clock,
    ) -> Self {
        Self {
            database,
            adapter,
            policy,
            reporter,
            clock,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Executes one attempt of a job already claimed as `running`.
    pub async fn execute(&self, job: &SyncJob) -> Result<JobRun, SyncError> {
        let started = Instant::now();

        let run = match self.attempt(job).await {
            Ok(Attempt::Applied) => {
                self.database
                    .sync_jobs()
                    .mark_succeeded(&job.id, self.now())
                    .await?;
                info!(
                    stage = "sync",
                    job_id = %job.id,
                    kind = %job.kind,
                    etablissement_id = job.etablissement_id,
                    "establishment synchronized"
                );
                JobRun::Succeeded
            }
            Ok(Attempt::EstablishmentGone) => {
                self.database
                    .sync_jobs()
                    .mark_suppressed(&job.id, "establishment no longer exists", self.now())
                    .await?;
                info!(
                    stage = "sync",
                    job_id = %job.id,
                    etablissement_id = job.etablissement_id,
                    "establishment deleted before sync, dropping job"
                );
                JobRun::Suppressed("establishment_missing")
            }
            Ok(Attempt::Refused(class, detail)) => self.settle(job, class, &detail).await?,
            Err(err) => {
                self.settle(job, FailureClass::Transient, &err.to_string())
                    .await?
            }
        };

        counter!(
            "sync_jobs_total",
            "kind" => job.kind.as_str(),
            "outcome" => run.outcome()
        )
        .increment(1);
        histogram!("sync_job_duration_seconds", "kind" => job.kind.as_str())
            .record(started.elapsed().as_secs_f64());

        Ok(run)
    }

    /// Reports a job whose last attempt was cut short by a worker crash.
    ///
    /// The queue already marked it `failed`; this only closes the books.
    pub fn report_abandoned(&self, job: &SyncJob) {
        let detail = job.last_error.as_deref().unwrap_or("worker interrupted");
        self.reporter.report(job, detail);
        counter!(
            "sync_jobs_total",
            "kind" => job.kind.as_str(),
            "outcome" => JobRun::Failed.outcome()
        )
        .increment(1);
    }

    async fn attempt(&self, job: &SyncJob) -> Result<Attempt, AttemptError> {
        let Some(establishment) = self
            .database
            .establishments()
            .fetch(job.etablissement_id)
            .await?
        else {
            return Ok(Attempt::EstablishmentGone);
        };

        match job.kind {
            JobKind::Entreprise => self.sync_entreprise(job, &establishment).await,
            JobKind::Exercices => self.sync_exercices(job, &establishment).await,
        }
    }

    async fn sync_entreprise(
        &self,
        job: &SyncJob,
        establishment: &Establishment,
    ) -> Result<Attempt, AttemptError> {
        let attributes = match self
            .adapter
            .entreprise(&establishment.siret, job.procedure_id)
            .await?
        {
            Fetched::Found(attributes) => attributes,
            Fetched::NotFound => return Ok(Attempt::not_found()),
            Fetched::BadRequest(body) => return Ok(Attempt::bad_request(body)),
        };

        match self
            .database
            .establishments()
            .apply_entreprise(establishment.id, &attributes, self.now())
            .await
        {
            Ok(()) => Ok(Attempt::Applied),
            Err(EstablishmentError::NotFound) => Ok(Attempt::EstablishmentGone),
            Err(err) => Err(err.into()),
        }
    }

    async fn sync_exercices(
        &self,
        job: &SyncJob,
        establishment: &Establishment,
    ) -> Result<Attempt, AttemptError> {
        let years = match self
            .adapter
            .exercices(&establishment.siret, job.procedure_id)
            .await?
        {
            Fetched::Found(years) => years,
            Fetched::NotFound => return Ok(Attempt::not_found()),
            Fetched::BadRequest(body) => return Ok(Attempt::bad_request(body)),
        };

        match self
            .database
            .establishments()
            .replace_fiscal_years(establishment.id, &years, self.now())
            .await
        {
            Ok(()) => Ok(Attempt::Applied),
            Err(EstablishmentError::NotFound) => Ok(Attempt::EstablishmentGone),
            Err(err) => Err(err.into()),
        }
    }

    async fn settle(
        &self,
        job: &SyncJob,
        class: FailureClass,
        detail: &str,
    ) -> Result<JobRun, SyncError> {
        let now = self.now();
        let policy = self.policy.with_max_attempts(job.max_attempts);
        let jobs = self.database.sync_jobs();

        match policy.decide(job.attempts, class) {
            RetryDecision::Suppress => {
                let reason = format!("{}: {detail}", class.as_str());
                jobs.mark_suppressed(&job.id, &reason, now).await?;
                if class == FailureClass::BadRequest {
                    warn!(
                        stage = "sync",
                        job_id = %job.id,
                        kind = %job.kind,
                        etablissement_id = job.etablissement_id,
                        detail = %detail,
                        "registry rejected request"
                    );
                } else {
                    info!(
                        stage = "sync",
                        job_id = %job.id,
                        kind = %job.kind,
                        etablissement_id = job.etablissement_id,
                        "siret unknown to registry"
                    );
                }
                Ok(JobRun::Suppressed(class.as_str()))
            }
            RetryDecision::RetryAt(delay) => {
                let delay = ChronoDuration::from_std(delay).unwrap_or(ChronoDuration::days(1));
                let run_at = now + delay;
                jobs.schedule_retry(&job.id, detail, run_at, now).await?;
                warn!(
                    stage = "sync",
                    job_id = %job.id,
                    kind = %job.kind,
                    attempt = job.attempts,
                    max_attempts = policy.max_attempts(),
                    %run_at,
                    error = %detail,
                    "sync attempt failed, retry scheduled"
                );
                Ok(JobRun::Retrying { run_at })
            }
            RetryDecision::GiveUp => {
                jobs.mark_failed(&job.id, detail, now).await?;
                self.reporter.report(job, detail);
                Ok(JobRun::Failed)
            }
        }
    }
}

enum Attempt {
    Applied,
    EstablishmentGone,
    Refused(FailureClass, String),
}

impl Attempt {
    fn not_found() -> Self {
        Self::Refused(FailureClass::NotFound, "siret unknown to registry".to_string())
    }

    fn bad_request(body: String) -> Self {
        Self::Refused(FailureClass::BadRequest, body)
    }
}

#[derive(Debug, Error)]
enum AttemptError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("failed to update establishment: {0}")]
    Establishment(#[from] EstablishmentError),
}

/// Queue bookkeeping failed; the job stays `running` until the stale sweep.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("job queue error: {0}")]
    Queue(#[from] SyncJobError),
}
