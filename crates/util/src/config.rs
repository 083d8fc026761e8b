use std::{env, fmt, net::SocketAddr, time::Duration};

use url::Url;

use super::{non_empty_var, server_bind_address};

pub const DEFAULT_DATABASE_URL: &str = "sqlite://siret-sync.db?mode=rwc";
pub const DEFAULT_API_ENTREPRISE_URL: &str = "https://entreprise.api.gouv.fr/v2/";
pub const DEFAULT_API_ENTREPRISE_CONTEXT: &str = "demarches-simplifiees.fr";
pub const DEFAULT_API_ENTREPRISE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_ATTEMPTS_API_ENTREPRISE_JOBS: u32 = 5;
pub const DEFAULT_WORKER_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_WORKER_BATCH_SIZE: u32 = 10;

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Settings for the business-registry (API Entreprise) client.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub base_url: Url,
    /// Token used when a procedure carries no credential of its own.
    pub default_token: Option<String>,
    pub context: String,
    pub recipient: Option<String>,
    pub timeout: Duration,
}

/// Settings for the synchronization job worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub max_attempts: u32,
    pub interval: Duration,
    pub batch_size: u32,
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub registry: RegistryConfig,
    pub worker: WorkerConfig,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;
        let database_url =
            non_empty_var("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            registry: RegistryConfig::from_env()?,
            worker: WorkerConfig::from_env()?,
        })
    }
}

impl RegistryConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let raw_url = non_empty_var("API_ENTREPRISE_URL")
            .unwrap_or_else(|| DEFAULT_API_ENTREPRISE_URL.to_string());
        // Url::join drops the last path segment unless the base ends with a slash.
        let normalized = if raw_url.ends_with('/') {
            raw_url
        } else {
            format!("{raw_url}/")
        };
        let base_url = Url::parse(&normalized)
            .map_err(|err| ConfigError::InvalidUrl("API_ENTREPRISE_URL", err))?;

        let timeout_secs = parse_number(
            "API_ENTREPRISE_TIMEOUT_SECS",
            DEFAULT_API_ENTREPRISE_TIMEOUT_SECS,
        )?;

        Ok(Self {
            base_url,
            default_token: non_empty_var("API_ENTREPRISE_TOKEN"),
            context: non_empty_var("API_ENTREPRISE_CONTEXT")
                .unwrap_or_else(|| DEFAULT_API_ENTREPRISE_CONTEXT.to_string()),
            recipient: non_empty_var("API_ENTREPRISE_RECIPIENT"),
            timeout: Duration::from_secs(timeout_secs),
        })
    }
}

impl WorkerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let max_attempts = parse_number(
            "MAX_ATTEMPTS_API_ENTREPRISE_JOBS",
            DEFAULT_MAX_ATTEMPTS_API_ENTREPRISE_JOBS,
        )?;
        if max_attempts == 0 {
            return Err(ConfigError::InvalidNumber(
                "MAX_ATTEMPTS_API_ENTREPRISE_JOBS",
                "0".to_string(),
            ));
        }

        let interval_secs = parse_number("SYNC_WORKER_INTERVAL_SECS", DEFAULT_WORKER_INTERVAL_SECS)?;
        let batch_size = parse_number("SYNC_WORKER_BATCH_SIZE", DEFAULT_WORKER_BATCH_SIZE)?;

        Ok(Self {
            max_attempts,
            interval: Duration::from_secs(interval_secs.max(1)),
            batch_size: batch_size.max(1),
        })
    }
}

fn parse_number<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    match non_empty_var(key) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidNumber(key, value)),
        None => Ok(default),
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    InvalidUrl(&'static str, url::ParseError),
    InvalidNumber(&'static str, String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::InvalidUrl(key, err) => write!(f, "invalid {key} value: {err}"),
            Self::InvalidNumber(key, value) => {
                write!(f, "{key} must be a positive integer (got {value})")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
