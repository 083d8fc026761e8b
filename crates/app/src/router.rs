use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tracing::error;

use siret_sync_core::{Entreprise, Establishment, JobKind, JobStatus, SyncJob};
use siret_sync_storage::Database;

use crate::capture::CaptureService;
use crate::problem::ProblemResponse;
use crate::telemetry;
use crate::worker::SyncService;

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    sync: SyncService,
    capture: CaptureService,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        storage: Database,
        sync: SyncService,
        capture: CaptureService,
    ) -> Self {
        Self {
            metrics,
            storage,
            sync,
            capture,
        }
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn sync(&self) -> &SyncService {
        &self.sync
    }

    pub fn capture(&self) -> &CaptureService {
        &self.capture
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/dossiers/:id/siret", post(capture_siret).delete(reset_siret))
        .route("/jobs", post(enqueue_job))
        .route("/etablissements/:id", get(show_etablissement))
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> StatusCode {
    match state.storage().ping().await {
        Ok(()) => StatusCode::OK,
        Err(err) => {
            error!(stage = "app", error = %err, "health check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

async fn metrics(State(state): State<AppState>) -> Response {
    let body = telemetry::render_metrics(state.metrics());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        Body::from(body),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct CaptureRequest {
    siret: String,
}

#[derive(Debug, Serialize)]
struct JobSummary {
    id: String,
    kind: JobKind,
    status: &'static str,
    attempts: u32,
    max_attempts: u32,
    last_error: Option<String>,
}

impl From<&SyncJob> for JobSummary {
    fn from(job: &SyncJob) -> Self {
        Self {
            id: job.id.clone(),
            kind: job.kind,
            status: job.status.as_str(),
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            last_error: job.last_error.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct CaptureResponse {
    etablissement_id: i64,
    siret: String,
    jobs: Vec<JobSummary>,
}

async fn capture_siret(
    State(state): State<AppState>,
    Path(dossier_id): Path<i64>,
    Json(request): Json<CaptureRequest>,
) -> Result<(StatusCode, Json<CaptureResponse>), ProblemResponse> {
    let result = state.capture().capture_siret(dossier_id, &request.siret).await;
    let label = if result.is_ok() { "accepted" } else { "rejected" };
    counter!("api_capture_requests_total", "result" => label).increment(1);

    let capture = result?;
    Ok((
        StatusCode::ACCEPTED,
        Json(CaptureResponse {
            etablissement_id: capture.etablissement_id,
            siret: capture.siret.as_str().to_string(),
            jobs: capture.jobs.iter().map(JobSummary::from).collect(),
        }),
    ))
}

async fn reset_siret(
    State(state): State<AppState>,
    Path(dossier_id): Path<i64>,
) -> Result<StatusCode, ProblemResponse> {
    if state.capture().reset_siret(dossier_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ProblemResponse::not_found(
            "siret_not_set",
            format!("dossier {dossier_id} has no establishment"),
        ))
    }
}

#[derive(Debug, Deserialize)]
struct EnqueueRequest {
    kind: String,
    etablissement_id: i64,
    procedure_id: i64,
}

async fn enqueue_job(
    State(state): State<AppState>,
    Json(request): Json<EnqueueRequest>,
) -> Result<(StatusCode, Json<JobSummary>), ProblemResponse> {
    let kind = request
        .kind
        .parse::<JobKind>()
        .map_err(|err| ProblemResponse::unprocessable("invalid_job_kind", err.to_string()))?;

    let exists = state
        .storage()
        .establishments()
        .fetch(request.etablissement_id)
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?
        .is_some();
    if !exists {
        return Err(ProblemResponse::not_found(
            "etablissement_not_found",
            format!("etablissement {} does not exist", request.etablissement_id),
        ));
    }

    let job = state
        .sync()
        .enqueue(kind, request.etablissement_id, request.procedure_id)
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?;
    Ok((StatusCode::ACCEPTED, Json(JobSummary::from(&job))))
}

#[derive(Debug, Serialize)]
struct FiscalYearView {
    ca: i64,
    date_fin_exercice: chrono::NaiveDate,
    year: i32,
}

#[derive(Debug, Serialize)]
struct EtablissementView {
    etablissement: Establishment,
    entreprise: Entreprise,
    display_name: String,
    exercices: Vec<FiscalYearView>,
    jobs: Vec<JobSummary>,
    synchronized: bool,
}

async fn show_etablissement(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<EtablissementView>, ProblemResponse> {
    let establishments = state.storage().establishments();
    let etablissement = establishments
        .fetch(id)
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?
        .ok_or_else(|| {
            ProblemResponse::not_found(
                "etablissement_not_found",
                format!("etablissement {id} does not exist"),
            )
        })?;
    let exercices = establishments
        .fiscal_years(id)
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?
        .into_iter()
        .map(|year| FiscalYearView {
            ca: year.ca,
            date_fin_exercice: year.date_fin_exercice,
            year: year.year(),
        })
        .collect();
    let jobs = state
        .storage()
        .sync_jobs()
        .list_for_etablissement(id)
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?;

    let synchronized = !jobs.is_empty()
        && jobs
            .iter()
            .all(|job| job.status.is_terminal() && job.status != JobStatus::Failed);

    let entreprise = etablissement.entreprise();
    Ok(Json(EtablissementView {
        display_name: entreprise.raison_sociale_or_name(),
        entreprise,
        etablissement,
        exercices,
        jobs: jobs.iter().map(JobSummary::from).collect(),
        synchronized,
    }))
}
