mod establishments;
mod jobs;

use std::{str::FromStr, time::Duration};

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    migrate::MigrateError,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    Row, SqlitePool,
};
use thiserror::Error;

pub use establishments::{EstablishmentError, EstablishmentRepository, NewEstablishment};
pub use jobs::{NewSyncJob, StaleJobs, SyncJobError, SyncJobRepository};

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        // Pragmas are set on the connect options so every pooled connection gets them.
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StorageError::Connect)?
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(StorageError::Connect)?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle for procedures and their registry credentials.
    pub fn procedures(&self) -> ProcedureRepository {
        ProcedureRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for dossiers.
    pub fn dossiers(&self) -> DossierRepository {
        DossierRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for establishments and their fiscal years.
    pub fn establishments(&self) -> EstablishmentRepository {
        EstablishmentRepository::new(self.pool.clone())
    }

    /// Returns a handle for the persisted synchronization job queue.
    pub fn sync_jobs(&self) -> SyncJobRepository {
        SyncJobRepository::new(self.pool.clone())
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Runs a trivial query to check the database answers.
    pub async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// An administrative procedure, as far as registry access is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Procedure {
    pub id: i64,
    pub libelle: String,
    pub api_entreprise_token: Option<String>,
}

/// Payload required to create a procedure.
pub struct NewProcedure<'a> {
    pub libelle: &'a str,
    pub api_entreprise_token: Option<&'a str>,
    pub created_at: DateTime<Utc>,
}

/// Repository used to query procedures.
#[derive(Clone)]
pub struct ProcedureRepository {
    pool: SqlitePool,
}

impl ProcedureRepository {
    pub async fn insert(&self, record: &NewProcedure<'_>) -> Result<i64, ProcedureError> {
        let created_at = to_rfc3339(record.created_at);
        let row = sqlx::query(
            "INSERT INTO procedures (libelle, api_entreprise_token, created_at, updated_at) \
             VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(record.libelle)
        .bind(record.api_entreprise_token)
        .bind(&created_at)
        .bind(&created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("id"))
    }

    pub async fn fetch(&self, id: i64) -> Result<Procedure, ProcedureError> {
        let row = sqlx::query(
            "SELECT id, libelle, api_entreprise_token FROM procedures WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(ProcedureError::NotFound)?;

        Ok(Procedure {
            id: row.get("id"),
            libelle: row.get("libelle"),
            api_entreprise_token: row.get("api_entreprise_token"),
        })
    }
}

/// Errors that can occur while reading procedures.
#[derive(Debug, Error)]
pub enum ProcedureError {
    #[error("procedure not found")]
    NotFound,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// A case file filed against a procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dossier {
    pub id: i64,
    pub procedure_id: i64,
}

/// Repository for dossiers.
#[derive(Clone)]
pub struct DossierRepository {
    pool: SqlitePool,
}

impl DossierRepository {
    pub async fn insert(
        &self,
        procedure_id: i64,
        created_at: DateTime<Utc>,
    ) -> Result<i64, DossierError> {
        let created_at = to_rfc3339(created_at);
        let result = sqlx::query(
            "INSERT INTO dossiers (procedure_id, created_at, updated_at) \
             VALUES (?, ?, ?) RETURNING id",
        )
        .bind(procedure_id)
        .bind(&created_at)
        .bind(&created_at)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Ok(row.get("id")),
            Err(sqlx::Error::Database(db_err))
                if db_err.code().as_deref() == Some(SQLITE_FOREIGN_KEY) =>
            {
                Err(DossierError::MissingProcedure)
            }
            Err(err) => Err(DossierError::Database(err)),
        }
    }

    pub async fn fetch(&self, id: i64) -> Result<Dossier, DossierError> {
        let row = sqlx::query("SELECT id, procedure_id FROM dossiers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DossierError::NotFound)?;

        Ok(Dossier {
            id: row.get("id"),
            procedure_id: row.get("procedure_id"),
        })
    }
}

/// Errors that can occur while reading or creating dossiers.
#[derive(Debug, Error)]
pub enum DossierError {
    #[error("dossier not found")]
    NotFound,
    #[error("procedure does not exist")]
    MissingProcedure,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// SQLITE_CONSTRAINT_UNIQUE extended result code.
pub(crate) const SQLITE_UNIQUE: &str = "2067";
/// SQLITE_CONSTRAINT_FOREIGNKEY extended result code.
pub(crate) const SQLITE_FOREIGN_KEY: &str = "787";

pub(crate) fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
