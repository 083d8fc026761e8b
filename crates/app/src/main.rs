mod adapter;
mod capture;
mod problem;
mod router;
mod sync;
mod telemetry;
mod worker;

#[cfg(test)]
mod test_support;

use std::{net::SocketAddr, sync::Arc};

use chrono::{DateTime, Utc};
use tracing::info;

use siret_sync_core::RetryPolicy;
use siret_sync_registry::{ApiEntrepriseClient, RequestOptions};
use siret_sync_storage::Database;
use siret_sync_util::{load_env_file, AppConfig};

/// Source of the current time, swappable in tests.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;

    let http = reqwest::Client::builder()
        .timeout(config.registry.timeout)
        .build()?;
    let client = ApiEntrepriseClient::new(
        config.registry.base_url.clone(),
        http,
        RequestOptions {
            context: config.registry.context.clone(),
            recipient: config.registry.recipient.clone(),
        },
    );

    let clock: Clock = Arc::new(Utc::now);
    let adapter = adapter::RegistryAdapter::new(
        client,
        database.clone(),
        config.registry.default_token.clone(),
    );
    let executor = sync::SyncExecutor::new(
        database.clone(),
        adapter,
        RetryPolicy::new(config.worker.max_attempts),
        Arc::new(sync::TracingReporter),
        clock.clone(),
    );
    let (sync_service, sync_worker) = worker::SyncService::new(
        database.clone(),
        executor,
        clock.clone(),
        config.worker.max_attempts,
        config.worker.interval,
        config.worker.batch_size,
    );
    sync_worker.spawn();

    let capture = capture::CaptureService::new(database.clone(), sync_service.clone(), clock);
    let state = router::AppState::new(metrics, database, sync_service, capture);

    let addr: SocketAddr = config.bind_addr;
    info!(
        stage = "app",
        %addr,
        env = %config.environment.as_str(),
        registry = %config.registry.base_url,
        max_attempts = config.worker.max_attempts,
        "starting HTTP server"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
