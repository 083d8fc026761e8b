use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::counter;
use thiserror::Error;
use tokio::{
    sync::mpsc,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, error, info};

use siret_sync_core::{JobKind, SyncJob};
use siret_sync_storage::{Database, NewSyncJob, SyncJobError};

use crate::sync::{JobRun, SyncError, SyncExecutor};
use crate::Clock;

/// Jobs left `running` longer than this are considered abandoned.
const STALE_AFTER_MINUTES: i64 = 10;

/// Handle used to enqueue sync jobs and wake the worker.
#[derive(Clone)]
pub struct SyncService {
    database: Database,
    sender: mpsc::Sender<()>,
    max_attempts: u32,
    clock: Clock,
}

impl SyncService {
    pub fn new(
        database: Database,
        executor: SyncExecutor,
        clock: Clock,
        max_attempts: u32,
        interval: Duration,
        batch_size: u32,
    ) -> (Self, SyncWorker) {
        let (sender, receiver) = mpsc::channel(1);
        let worker = SyncWorker {
            database: database.clone(),
            executor,
            clock: clock.clone(),
            receiver,
            interval,
            batch_size: batch_size.max(1),
        };
        let service = Self {
            database,
            sender,
            max_attempts,
            clock,
        };
        (service, worker)
    }

    /// Enqueues one job of `kind` for an establishment.
    pub async fn enqueue(
        &self,
        kind: JobKind,
        etablissement_id: i64,
        procedure_id: i64,
    ) -> Result<SyncJob, SyncError> {
        let job = self
            .database
            .sync_jobs()
            .enqueue(&NewSyncJob {
                kind,
                etablissement_id,
                procedure_id,
                max_attempts: self.max_attempts,
                enqueued_at: (self.clock)(),
            })
            .await?;

        counter!("sync_jobs_enqueued_total", "kind" => kind.as_str()).increment(1);
        debug!(stage = "sync", job_id = %job.id, %kind, etablissement_id, "sync job enqueued");
        self.notify();
        Ok(job)
    }

    /// Enqueues both the identity and the fiscal-year job.
    pub async fn enqueue_all(
        &self,
        etablissement_id: i64,
        procedure_id: i64,
    ) -> Result<Vec<SyncJob>, SyncError> {
        let mut jobs = Vec::with_capacity(JobKind::ALL.len());
        for kind in JobKind::ALL {
            jobs.push(self.enqueue(kind, etablissement_id, procedure_id).await?);
        }
        Ok(jobs)
    }

    /// Wakes the worker. A wake-up already pending covers this one.
    pub fn notify(&self) {
        let _ = self.sender.try_send(());
    }
}

/// Background loop draining the job queue.
pub struct SyncWorker {
    database: Database,
    executor: SyncExecutor,
    clock: Clock,
    receiver: mpsc::Receiver<()>,
    interval: Duration,
    batch_size: u32,
}

impl SyncWorker {
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(mut self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                Some(()) = self.receiver.recv() => {}
                else => break,
            }
            if let Err(err) = self.drain().await {
                error!(stage = "sync", error = %err, "sync worker run failed");
            }
        }
    }

    /// Runs batches until no job is due.
    async fn drain(&self) -> Result<(), WorkerError> {
        while self.run_once().await? == self.batch_size as usize {}
        Ok(())
    }

    /// Requeues abandoned jobs, reports those with no attempt left, then
    /// executes one batch of due jobs.
    ///
    /// Returns how many jobs were claimed.
    pub async fn run_once(&self) -> Result<usize, WorkerError> {
        let now = self.now();
        let jobs = self.database.sync_jobs();

        let stale = jobs
            .requeue_stale(now - ChronoDuration::minutes(STALE_AFTER_MINUTES), now)
            .await?;
        if stale.requeued > 0 {
            info!(stage = "sync", requeued = stale.requeued, "requeued interrupted sync jobs");
        }
        for job in &stale.exhausted {
            self.executor.report_abandoned(job);
        }

        let claimed = jobs.claim_due(now, self.batch_size).await?;
        let count = claimed.len();
        for job in &claimed {
            match self.executor.execute(job).await {
                Ok(JobRun::Retrying { run_at }) => {
                    debug!(stage = "sync", job_id = %job.id, %run_at, "job will retry");
                }
                Ok(_) => {}
                Err(err) => {
                    error!(stage = "sync", job_id = %job.id, error = %err, "failed to settle sync job");
                }
            }
        }
        Ok(count)
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("job queue error: {0}")]
    Queue(#[from] SyncJobError),
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use httpmock::prelude::*;
    use serde_json::json;
    use siret_sync_core::{Backoff, JobStatus, RetryPolicy};

    use super::*;
    use crate::adapter::RegistryAdapter;
    use crate::sync::{ErrorReporter, TracingReporter};
    use crate::test_support::{
        fixed_clock, registry_client, seed_dossier, seed_establishment, setup_db, t0,
        RecordingReporter,
    };

    async fn service(server: &MockServer, db: &Database, batch_size: u32) -> (SyncService, SyncWorker) {
        service_with(server, db, batch_size, fixed_clock(t0()), Arc::new(TracingReporter))
    }

    fn service_with(
        server: &MockServer,
        db: &Database,
        batch_size: u32,
        clock: Clock,
        reporter: Arc<dyn ErrorReporter>,
    ) -> (SyncService, SyncWorker) {
        let executor = SyncExecutor::new(
            db.clone(),
            RegistryAdapter::new(registry_client(server), db.clone(), None),
            RetryPolicy::new(2).with_backoff(Backoff::Fixed(Duration::ZERO)),
            reporter,
            clock.clone(),
        );
        SyncService::new(
            db.clone(),
            executor,
            clock,
            2,
            Duration::from_secs(60),
            batch_size,
        )
    }

    #[tokio::test]
    async fn enqueue_all_creates_one_job_per_kind() {
        let server = MockServer::start_async().await;
        let db = setup_db().await;
        let dossier = seed_dossier(&db, Some("token")).await;
        let id = seed_establishment(&db, dossier.id, "12345678901234").await;
        let (service, _worker) = service(&server, &db, 10).await;

        let jobs = service
            .enqueue_all(id, dossier.procedure_id)
            .await
            .expect("enqueue");
        let kinds: Vec<_> = jobs.iter().map(|job| job.kind).collect();
        assert_eq!(kinds, vec![JobKind::Entreprise, JobKind::Exercices]);
        assert!(jobs.iter().all(|job| job.max_attempts == 2));
        assert!(jobs.iter().all(|job| job.status == JobStatus::Enqueued));
    }

    #[tokio::test]
    async fn run_once_executes_due_jobs() {
        let server = MockServer::start_async().await;
        let db = setup_db().await;
        let dossier = seed_dossier(&db, Some("token")).await;
        let id = seed_establishment(&db, dossier.id, "12345678901234").await;
        let (service, worker) = service(&server, &db, 10).await;

        server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/entreprises/123456789");
                then.status(200).json_body(json!({
                    "entreprise": { "siren": "123456789", "raison_sociale": "ACME" }
                }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/exercices/12345678901234");
                then.status(200).json_body(json!({
                    "exercices": [{ "ca": 42, "date_fin_exercice_timestamp": 1672441200 }]
                }));
            })
            .await;

        service
            .enqueue_all(id, dossier.procedure_id)
            .await
            .expect("enqueue");
        assert_eq!(worker.run_once().await.expect("run"), 2);

        let jobs = db.sync_jobs().list_for_etablissement(id).await.expect("list");
        assert!(jobs.iter().all(|job| job.status == JobStatus::Succeeded));
        let years = db.establishments().fiscal_years(id).await.expect("years");
        assert_eq!(years.len(), 1);
        assert_eq!(years[0].year(), 2022);
        assert_eq!(worker.run_once().await.expect("idle run"), 0);
    }

    #[tokio::test]
    async fn drain_runs_retries_until_settled() {
        let server = MockServer::start_async().await;
        let db = setup_db().await;
        let dossier = seed_dossier(&db, Some("token")).await;
        let id = seed_establishment(&db, dossier.id, "12345678901234").await;
        let (service, worker) = service(&server, &db, 1).await;

        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/exercices/12345678901234");
                then.status(503);
            })
            .await;

        let job = service
            .enqueue(JobKind::Exercices, id, dossier.procedure_id)
            .await
            .expect("enqueue");
        worker.drain().await.expect("drain");

        mock.assert_hits_async(2).await;
        let stored = db.sync_jobs().fetch(&job.id).await.expect("fetch").expect("job");
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts, 2);
    }

    #[tokio::test]
    async fn crash_on_last_attempt_is_reported_once() {
        let server = MockServer::start_async().await;
        let db = setup_db().await;
        let dossier = seed_dossier(&db, Some("token")).await;
        let id = seed_establishment(&db, dossier.id, "12345678901234").await;
        let reporter = Arc::new(RecordingReporter::default());
        let later = t0() + ChronoDuration::minutes(30);
        let (_service, worker) =
            service_with(&server, &db, 10, fixed_clock(later), reporter.clone());

        let job = db
            .sync_jobs()
            .enqueue(&NewSyncJob {
                kind: JobKind::Exercices,
                etablissement_id: id,
                procedure_id: dossier.procedure_id,
                max_attempts: 1,
                enqueued_at: t0(),
            })
            .await
            .expect("enqueue");
        // Claimed by a worker that died before settling it.
        db.sync_jobs().claim_due(t0(), 1).await.expect("claim");

        assert_eq!(worker.run_once().await.expect("run"), 0);

        let stored = db.sync_jobs().fetch(&job.id).await.expect("fetch").expect("job");
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(
            reporter.reports(),
            vec![(job.id.clone(), "worker interrupted".to_string())]
        );

        worker.run_once().await.expect("second run");
        assert_eq!(reporter.reports().len(), 1);
    }

    #[tokio::test]
    async fn interrupted_job_with_attempts_left_runs_again() {
        let server = MockServer::start_async().await;
        let db = setup_db().await;
        let dossier = seed_dossier(&db, Some("token")).await;
        let id = seed_establishment(&db, dossier.id, "12345678901234").await;
        let reporter = Arc::new(RecordingReporter::default());
        let later = t0() + ChronoDuration::minutes(30);
        let (_service, worker) =
            service_with(&server, &db, 10, fixed_clock(later), reporter.clone());

        server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/exercices/12345678901234");
                then.status(200).json_body(json!({
                    "exercices": [{ "ca": 42, "date_fin_exercice_timestamp": 1672441200 }]
                }));
            })
            .await;

        let job = db
            .sync_jobs()
            .enqueue(&NewSyncJob {
                kind: JobKind::Exercices,
                etablissement_id: id,
                procedure_id: dossier.procedure_id,
                max_attempts: 2,
                enqueued_at: t0(),
            })
            .await
            .expect("enqueue");
        db.sync_jobs().claim_due(t0(), 1).await.expect("claim");

        assert_eq!(worker.run_once().await.expect("run"), 1);

        let stored = db.sync_jobs().fetch(&job.id).await.expect("fetch").expect("job");
        assert_eq!(stored.status, JobStatus::Succeeded);
        assert_eq!(stored.attempts, 2);
        assert!(reporter.reports().is_empty());
    }
}
