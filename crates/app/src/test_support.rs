use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, TimeZone, Utc};
use httpmock::MockServer;
use reqwest::Client;
use url::Url;

use siret_sync_core::{Backoff, RetryPolicy, SyncJob};
use siret_sync_registry::{ApiEntrepriseClient, RequestOptions};
use siret_sync_storage::{Database, Dossier, NewEstablishment, NewProcedure};

use crate::adapter::RegistryAdapter;
use crate::capture::CaptureService;
use crate::sync::{ErrorReporter, SyncExecutor, TracingReporter};
use crate::worker::{SyncService, SyncWorker};
use crate::Clock;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub fn fixed_clock(now: DateTime<Utc>) -> Clock {
    Arc::new(move || now)
}

/// Keeps every report as `(job id, error)`.
#[derive(Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<(String, String)>>,
}

impl RecordingReporter {
    pub fn reports(&self) -> Vec<(String, String)> {
        self.reports.lock().expect("reporter lock").clone()
    }
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, job: &SyncJob, error: &str) {
        self.reports
            .lock()
            .expect("reporter lock")
            .push((job.id.clone(), error.to_string()));
    }
}

pub async fn setup_db() -> Database {
    let db = Database::connect("sqlite::memory:").await.expect("connect");
    db.run_migrations().await.expect("migrations");
    db
}

pub async fn seed_dossier(db: &Database, token: Option<&str>) -> Dossier {
    let procedure_id = db
        .procedures()
        .insert(&NewProcedure {
            libelle: "Aide aux entreprises",
            api_entreprise_token: token,
            created_at: t0(),
        })
        .await
        .expect("insert procedure");
    let dossier_id = db
        .dossiers()
        .insert(procedure_id, t0())
        .await
        .expect("insert dossier");
    Dossier {
        id: dossier_id,
        procedure_id,
    }
}

pub async fn seed_establishment(db: &Database, dossier_id: i64, siret: &str) -> i64 {
    db.establishments()
        .insert(&NewEstablishment::for_siret(Some(dossier_id), siret, t0()))
        .await
        .expect("insert establishment")
}

pub fn client_for(base_url: &str) -> ApiEntrepriseClient {
    ApiEntrepriseClient::new(
        Url::parse(base_url).expect("base url"),
        Client::new(),
        RequestOptions {
            context: "test".to_string(),
            recipient: None,
        },
    )
}

pub fn registry_client(server: &MockServer) -> ApiEntrepriseClient {
    client_for(&server.url("/v2/"))
}

/// Capture and sync services wired on a fixed clock, with no retry delay.
pub fn test_services(db: &Database, registry_url: &str) -> (CaptureService, SyncService, SyncWorker) {
    let clock = fixed_clock(t0());
    let executor = SyncExecutor::new(
        db.clone(),
        RegistryAdapter::new(client_for(registry_url), db.clone(), None),
        RetryPolicy::default().with_backoff(Backoff::Fixed(Duration::ZERO)),
        Arc::new(TracingReporter),
        clock.clone(),
    );
    let (sync, worker) = SyncService::new(
        db.clone(),
        executor,
        clock.clone(),
        5,
        Duration::from_secs(60),
        10,
    );
    let capture = CaptureService::new(db.clone(), sync.clone(), clock);
    (capture, sync, worker)
}
