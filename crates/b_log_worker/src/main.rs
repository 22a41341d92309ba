mod config;

use crate::config::ServiceConfig;
use anyhow::Context;
use b_log_runner::Runner;
use common::nats::NatsClient;
use common::postgres::PostgresClient;
use common::telemetry::{init_telemetry, shutdown_telemetry, TelemetryProviders};
use goose::MigrationRunner;
use md_worker::{ArtifactResolver, MdWorker, MdWorkerConfig, PostgresPostRepository};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() {
    let config = match ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let telemetry_providers: Option<TelemetryProviders> =
        match init_telemetry(&config.telemetry_config()) {
            Ok(providers) => providers,
            Err(e) => {
                eprintln!("Failed to initialize telemetry: {}", e);
                std::process::exit(1);
            }
        };

    info!(
        otel_enabled = config.otel_enabled,
        otel_endpoint = %config.otel_endpoint,
        "starting b-log md-worker"
    );
    debug!("configuration: {:?}", config.redacted());

    let (resolver, postgres_client, nats_client) =
        match initialize_shared_dependencies(&config).await {
            Ok(deps) => deps,
            Err(e) => {
                error!("failed to initialize shared dependencies: {:#}", e);
                shutdown_telemetry(telemetry_providers);
                std::process::exit(1);
            }
        };

    let md_worker = match MdWorker::new(
        Arc::new(PostgresPostRepository::new(postgres_client)),
        resolver,
        nats_client.create_consumer_client(),
        MdWorkerConfig {
            consumer: config.consumer_config(),
            operation_timeout: Duration::from_secs(config.operation_timeout_secs),
        },
    )
    .await
    {
        Ok(worker) => worker,
        Err(e) => {
            error!("failed to initialize md worker: {:#}", e);
            shutdown_telemetry(telemetry_providers);
            std::process::exit(1);
        }
    };

    // processes get past the consumer drain before they are aborted
    let shutdown_timeout = Duration::from_secs(config.drain_timeout_secs + 5);

    Runner::new()
        .with_named_process("md_worker", md_worker.into_runner_process())
        .with_closer(move || async move {
            info!("running cleanup tasks");
            nats_client.close().await;

            // flush pending traces
            shutdown_telemetry(telemetry_providers);

            info!("cleanup complete");
            Ok(())
        })
        .with_shutdown_timeout(shutdown_timeout)
        .with_closer_timeout(Duration::from_secs(10))
        .run()
        .await;
}

async fn initialize_shared_dependencies(
    config: &ServiceConfig,
) -> anyhow::Result<(ArtifactResolver, PostgresClient, NatsClient)> {
    let startup_timeout = Duration::from_secs(config.startup_timeout_secs);

    info!(shared_dir = %config.shared_dir, "preparing storage root");
    tokio::fs::create_dir_all(&config.shared_dir)
        .await
        .with_context(|| format!("failed to create storage root {}", config.shared_dir))?;
    let resolver = ArtifactResolver::new(&config.shared_dir).await?;

    info!("initializing PostgreSQL");
    if config.run_migrations {
        run_postgres_migrations(config).await?;
    }
    let postgres_client = PostgresClient::new(&config.postgres_config())?;
    tokio::time::timeout(startup_timeout, postgres_client.ping())
        .await
        .context("timed out connecting to PostgreSQL")?
        .context("failed to connect to PostgreSQL")?;

    info!("initializing NATS");
    let nats_client = NatsClient::connect(&config.nats_connect_config()).await?;
    nats_client
        .ensure_stream(&config.uploads_stream_settings())
        .await?;

    Ok((resolver, postgres_client, nats_client))
}

async fn run_postgres_migrations(config: &ServiceConfig) -> anyhow::Result<()> {
    let postgres = config.postgres_config();
    let runner = MigrationRunner::new(
        postgres.goose_binary_path,
        postgres.migrations_dir,
        "postgres".to_string(),
        postgres.database_url,
    );
    runner
        .run_migrations()
        .await
        .context("failed to run PostgreSQL migrations")?;

    match runner.migration_status().await {
        Ok(status) => debug!("migration status:\n{}", status),
        Err(e) => debug!(error = %e, "could not read migration status"),
    }
    Ok(())
}
