//! Sensor producer entry point.
//!
//! This binary is the composition root. Responsibilities:
//!
//! 1. **Load configuration**: layer `producer.toml` under the environment and
//!    validate it ([`config`]).
//! 2. **Wire observability**: JSON or pretty `tracing` output plus optional
//!    OTLP export ([`observability`]), and the global Prometheus recorder.
//! 3. **Start the probes**: `/health` and `/ready` on the health port,
//!    `/metrics` on the metrics port.
//! 4. **Construct infrastructure**: managed identity credential, dataset
//!    (local file, Blob storage, or synthetic), and the Event Hubs publisher
//!    authenticated by Key Vault connection string or Azure AD token
//!    ([`startup`]).
//! 5. **Run the producer** until SIGINT/SIGTERM, dataset exhaustion, or a
//!    fatal error, then drain the probe servers.
//!
//! Exit status is 0 on a clean stop and non-zero otherwise.

mod config;
mod observability;
mod startup;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use azure::{BlobClient, EventHubPublisher, KeyVaultClient, ManagedIdentityCredential, TokenCredential};
use config::{ProducerConfig, DEFAULT_CONFIG_FILE};
use domain::{EventPublisher, MemoryStore, SecretProvider, SensorRepository};
use simulator::{FailureTracker, Fleet, HealthState, LogPublisher, Producer};
use startup::DatasetBlob;

#[derive(Parser)]
#[command(name = "producer")]
#[command(about = "Replays sensor readings to Azure Event Hubs")]
#[command(version)]
struct Cli {
    /// TOML configuration file; environment variables take precedence
    #[arg(short, long, env = "PRODUCER_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Log events instead of sending them to Event Hubs
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match ProducerConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(2);
        }
    };

    let telemetry = match observability::init(
        config.log_format,
        config.otel_exporter_otlp_endpoint.as_deref(),
    ) {
        Ok(telemetry) => telemetry,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let result = run(&cli, config).await;
    if let Err(e) = &result {
        error!(error = %format!("{e:#}"), "Producer failed");
    }
    telemetry.shutdown();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}

async fn run(cli: &Cli, config: ProducerConfig) -> anyhow::Result<()> {
    info!(
        hub = %config.eventhub_name,
        namespace = %config.eventhub_namespace,
        machines = config.num_sensors,
        interval_ms = config.simulation_interval_ms,
        dry_run = cli.dry_run,
        "Sensor producer starting"
    );

    let prometheus = probes::install_recorder().context("failed to install metrics recorder")?;
    let health = Arc::new(HealthState::new());
    let cancel = CancellationToken::new();

    let health_listener = probes::bind(config.health_addr()).await?;
    let metrics_listener = probes::bind(config.metrics_addr()).await?;
    let mut servers = JoinSet::new();
    servers.spawn(probes::serve(
        "health",
        health_listener,
        probes::health_router(health.clone()),
        cancel.clone(),
    ));
    servers.spawn(probes::serve(
        "metrics",
        metrics_listener,
        probes::metrics_router(prometheus),
        cancel.clone(),
    ));

    tokio::spawn(shutdown_signal(cancel.clone()));

    let credential: Arc<dyn TokenCredential> = Arc::new(
        ManagedIdentityCredential::new(config.azure_client_id.clone())
            .context("failed to create managed identity credential")?,
    );
    let blob_client = match (&config.storage_container, &config.storage_account_url) {
        (Some(_), Some(account)) => Some(BlobClient::new(account, credential.clone())?),
        _ => None,
    };
    let blob = match (&blob_client, &config.storage_container) {
        (Some(client), Some(container)) => Some(DatasetBlob {
            client,
            container,
            name: config
                .dataset_blob_name()
                .context("SENSOR_DATA_FILE has no file name")?,
        }),
        _ => None,
    };
    let dataset = startup::load_dataset(&config.sensor_data_file, blob).await?;
    let publisher = build_publisher(&config, cli.dry_run, credential).await?;

    let repository = SensorRepository::new(Arc::new(MemoryStore::new()));
    let producer = Producer::new(
        Fleet::new(Arc::new(dataset), config.num_sensors, config.loop_dataset),
        FailureTracker::new(repository),
        publisher,
        health,
        config.producer_settings(),
    );

    let outcome = producer.run(cancel.clone()).await;

    cancel.cancel();
    while let Some(joined) = servers.join_next().await {
        joined.context("probe server task failed")??;
    }

    let summary = outcome?;
    info!(
        stop_reason = ?summary.stop_reason,
        ticks = summary.ticks,
        events = summary.events_published,
        failed_batches = summary.batches_failed,
        retries = summary.retries,
        "Sensor producer finished"
    );
    Ok(())
}

async fn build_publisher(
    config: &ProducerConfig,
    dry_run: bool,
    credential: Arc<dyn TokenCredential>,
) -> anyhow::Result<Arc<dyn EventPublisher>> {
    if dry_run {
        info!("Dry run: events will be logged, not sent");
        return Ok(Arc::new(LogPublisher));
    }

    let vault = config
        .key_vault_url
        .as_deref()
        .map(|url| KeyVaultClient::new(url, credential.clone()))
        .transpose()?;
    let auth = startup::publisher_auth(
        vault.as_ref().map(|v| v as &dyn SecretProvider),
        &config.eventhub_connection_secret,
        &config.eventhub_namespace,
        &config.eventhub_name,
        credential,
    )
    .await?;

    let publisher = EventHubPublisher::new(&config.eventhub_namespace, &config.eventhub_name, auth)?
        .with_max_batch_events(config.publish_batch_size);
    Ok(Arc::new(publisher))
}

/// Cancels `cancel` on SIGINT or SIGTERM.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
    cancel.cancel();
}
