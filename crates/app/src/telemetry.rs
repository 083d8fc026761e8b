use std::{
    sync::{Mutex, OnceLock},
    time::Instant,
};

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use thiserror::Error;
use tracing_subscriber::{
    fmt::{self as tracing_fmt, time::UtcTime},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter, Layer,
};

use siret_sync_util::{AppConfig, Environment};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to initialize tracing: {0}")]
    Tracing(#[from] TryInitError),
    #[error("failed to initialize prometheus recorder: {0}")]
    Metrics(#[from] BuildError),
}

/// The process-wide recorder handle. `None` until the first `init_metrics`.
static RECORDER: Mutex<Option<PrometheusHandle>> = Mutex::new(None);
static STARTED_AT: OnceLock<Instant> = OnceLock::new();

const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");

fn build_git_sha() -> &'static str {
    option_env!("GIT_SHA").unwrap_or("unknown")
}

/// Installs the global subscriber: pretty output locally, JSON lines in production.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let output = tracing_fmt::layer()
        .with_target(false)
        .with_timer(UtcTime::rfc_3339());
    let output = match config.environment {
        Environment::Production => output.json().boxed(),
        Environment::Development | Environment::Test => output.pretty().boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(output)
        .try_init()?;

    tracing::info!(
        stage = "telemetry",
        env = %config.environment.as_str(),
        version = BUILD_VERSION,
        git_sha = build_git_sha(),
        "tracing initialized"
    );
    Ok(())
}

/// Installs the Prometheus recorder on first call and returns its handle.
pub fn init_metrics() -> Result<PrometheusHandle, TelemetryError> {
    let mut recorder = RECORDER
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(handle) = recorder.as_ref() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    STARTED_AT.get_or_init(Instant::now);
    *recorder = Some(handle.clone());
    Ok(handle)
}

fn describe_metrics() {
    describe_gauge!("app_build_info", "Build metadata for the running binary");
    describe_gauge!("app_uptime_seconds", "Seconds since the recorder was installed");
    describe_counter!(
        "registry_requests_total",
        "API Entreprise requests by endpoint and result"
    );
    describe_counter!(
        "api_capture_requests_total",
        "SIRET capture requests by result"
    );
    describe_counter!("sync_jobs_enqueued_total", "Sync jobs enqueued by kind");
    describe_counter!(
        "sync_jobs_total",
        "Sync job executions by kind and outcome"
    );
    describe_counter!(
        "sync_jobs_reported_total",
        "Sync jobs handed to the error reporter after their last attempt"
    );
    describe_histogram!(
        "sync_job_duration_seconds",
        "Wall time of one sync job execution"
    );
}

/// Renders the recorder plus the build and uptime gauges, which are computed per scrape.
pub fn render_metrics(handle: &PrometheusHandle) -> String {
    let mut body = handle.render();
    if !body.is_empty() && !body.ends_with('\n') {
        body.push('\n');
    }

    let uptime = STARTED_AT
        .get()
        .map(|start| start.elapsed().as_secs_f64())
        .unwrap_or_default();
    body.push_str(&format!(
        "# TYPE app_build_info gauge\n\
         app_build_info{{version=\"{BUILD_VERSION}\",git=\"{}\"}} 1\n\
         # TYPE app_uptime_seconds gauge\n\
         app_uptime_seconds {uptime}\n",
        build_git_sha()
    ));
    body
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn concurrent_init_shares_one_recorder() {
        let handles: Vec<_> = (0..4)
            .map(|_| thread::spawn(init_metrics))
            .collect();
        for handle in handles {
            handle
                .join()
                .expect("init thread")
                .expect("every caller gets the handle");
        }

        let handle = init_metrics().expect("later call");
        metrics::counter!("sync_jobs_enqueued_total", "kind" => "entreprise").increment(1);
        let body = render_metrics(&handle);
        assert!(body.contains("sync_jobs_enqueued_total"));
        assert!(body.contains("app_build_info{version=\""));
        assert!(body.ends_with('\n'));
    }
}
