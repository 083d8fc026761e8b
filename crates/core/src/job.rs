use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which registry data a synchronization job fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Company identity fields.
    Entreprise,
    /// Fiscal-year summaries.
    Exercices,
}

impl JobKind {
    pub const ALL: [JobKind; 2] = [JobKind::Entreprise, JobKind::Exercices];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Entreprise => "entreprise",
            Self::Exercices => "exercices",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = UnknownValue;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "entreprise" => Ok(Self::Entreprise),
            "exercices" => Ok(Self::Exercices),
            other => Err(UnknownValue::new("job kind", other)),
        }
    }
}

/// Lifecycle of a persisted job.
///
/// `Enqueued -> Running -> {Succeeded | Retrying | Suppressed | Failed}`, with
/// `Retrying` returning to `Running` once due.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Enqueued,
    Running,
    Succeeded,
    Retrying,
    /// Ended on an expected registry outcome; not reported.
    Suppressed,
    /// Ended after exhausting attempts; reported to operators.
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enqueued => "enqueued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Retrying => "retrying",
            Self::Suppressed => "suppressed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Suppressed | Self::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = UnknownValue;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "enqueued" => Ok(Self::Enqueued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "retrying" => Ok(Self::Retrying),
            "suppressed" => Ok(Self::Suppressed),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownValue::new("job status", other)),
        }
    }
}

/// A synchronization job for one (establishment, procedure) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncJob {
    pub id: String,
    pub kind: JobKind,
    pub etablissement_id: i64,
    pub procedure_id: i64,
    pub status: JobStatus,
    /// Attempts started so far, including the running one.
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {what}: {value}")]
pub struct UnknownValue {
    what: &'static str,
    value: String,
}

impl UnknownValue {
    fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_and_status_parse_their_own_names() {
        for kind in JobKind::ALL {
            assert_eq!(kind.as_str().parse::<JobKind>(), Ok(kind));
        }
        for status in [
            JobStatus::Enqueued,
            JobStatus::Running,
            JobStatus::Succeeded,
            JobStatus::Retrying,
            JobStatus::Suppressed,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>(), Ok(status));
        }
        assert!("siren".parse::<JobKind>().is_err());
    }

    #[test]
    fn only_final_states_are_terminal() {
        assert!(!JobStatus::Retrying.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Suppressed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }
}
