use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{error, info, warn};

use siret_sync_core::{Siret, SiretError, SyncJob};
use siret_sync_storage::{
    Database, DossierError, EstablishmentError, NewEstablishment, SyncJobError,
};

use crate::sync::SyncError;
use crate::worker::SyncService;
use crate::Clock;

/// Establishment recorded for a dossier, with the jobs that will fill it in.
#[derive(Debug, Clone)]
pub struct Capture {
    pub etablissement_id: i64,
    pub siret: Siret,
    pub jobs: Vec<SyncJob>,
}

/// Attaches SIRETs to dossiers and schedules their registry sync.
#[derive(Clone)]
pub struct CaptureService {
    database: Database,
    sync: SyncService,
    clock: Clock,
}

impl CaptureService {
    pub fn new(database: Database, sync: SyncService, clock: Clock) -> Self {
        Self {
            database,
            sync,
            clock,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Records `raw` as the dossier's establishment and enqueues both sync jobs.
    pub async fn capture_siret(&self, dossier_id: i64, raw: &str) -> Result<Capture, CaptureError> {
        let siret = Siret::parse_checked(raw)?;
        let dossier = self.database.dossiers().fetch(dossier_id).await?;

        let etablissement_id = self
            .database
            .establishments()
            .insert(&NewEstablishment::for_siret(
                Some(dossier.id),
                siret.as_str(),
                self.now(),
            ))
            .await?;

        let jobs = match self
            .sync
            .enqueue_all(etablissement_id, dossier.procedure_id)
            .await
        {
            Ok(jobs) => jobs,
            Err(err) => {
                self.undo_capture(dossier.id, etablissement_id).await;
                return Err(err.into());
            }
        };

        info!(
            stage = "capture",
            dossier_id,
            etablissement_id,
            siret = %siret.as_str(),
            "siret captured"
        );
        Ok(Capture {
            etablissement_id,
            siret,
            jobs,
        })
    }

    /// Removes an establishment whose jobs could not all be enqueued, so the
    /// dossier can be captured again.
    async fn undo_capture(&self, dossier_id: i64, etablissement_id: i64) {
        if let Err(err) = self
            .database
            .sync_jobs()
            .discard_pending_for_etablissement(etablissement_id)
            .await
        {
            warn!(stage = "capture", etablissement_id, error = %err, "failed to discard partial jobs");
        }
        match self.database.establishments().delete_for_dossier(dossier_id).await {
            Ok(_) => {
                warn!(stage = "capture", dossier_id, etablissement_id, "capture rolled back");
            }
            Err(err) => {
                error!(
                    stage = "capture",
                    dossier_id,
                    etablissement_id,
                    error = %err,
                    "failed to roll back capture"
                );
            }
        }
    }

    /// Detaches the dossier's establishment, dropping jobs that have not run yet.
    ///
    /// Returns `false` when the dossier had no establishment.
    pub async fn reset_siret(&self, dossier_id: i64) -> Result<bool, CaptureError> {
        let establishments = self.database.establishments();
        let Some(existing) = establishments.fetch_by_dossier(dossier_id).await? else {
            return Ok(false);
        };

        let discarded = self
            .database
            .sync_jobs()
            .discard_pending_for_etablissement(existing.id)
            .await?;
        let deleted = establishments.delete_for_dossier(dossier_id).await?;

        info!(
            stage = "capture",
            dossier_id,
            etablissement_id = existing.id,
            discarded,
            "siret reset"
        );
        Ok(deleted.is_some())
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error(transparent)]
    InvalidSiret(#[from] SiretError),
    #[error("dossier not found")]
    DossierNotFound,
    #[error("dossier already has an establishment")]
    AlreadyCaptured,
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<DossierError> for CaptureError {
    fn from(value: DossierError) -> Self {
        match value {
            DossierError::NotFound => Self::DossierNotFound,
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<EstablishmentError> for CaptureError {
    fn from(value: EstablishmentError) -> Self {
        match value {
            EstablishmentError::DossierTaken => Self::AlreadyCaptured,
            EstablishmentError::MissingDossier => Self::DossierNotFound,
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<SyncJobError> for CaptureError {
    fn from(value: SyncJobError) -> Self {
        Self::Storage(value.to_string())
    }
}

impl From<SyncError> for CaptureError {
    fn from(value: SyncError) -> Self {
        Self::Storage(value.to_string())
    }
}
