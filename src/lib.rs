pub mod adapters;
pub mod capture;
pub mod config;
pub mod error;
pub mod grouping;
pub mod inference;
pub mod models;
pub mod relay;
pub mod storage;
pub mod transfer;
pub mod uid;

use anyhow::Context;
use dimse::scp::static_policy;
use dimse::DimseScu;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{prelude::*, EnvFilter};

use crate::capture::SessionCapture;
use crate::config::{Config, LoggingConfig};
use crate::inference::{HttpInferenceClient, InferenceClientConfig};
use crate::relay::{RelaySettings, ResultRelay, WorkItemQueue};
use crate::transfer::DimseTransferClient;

/// Install the global subscriber. Later calls in the same process are no-ops.
pub fn init_logging(log_level: &str, logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let file_layer = if logging.log_to_file {
        let file = std::fs::File::create(&logging.log_file_path)
            .with_context(|| format!("Failed to create log file '{}'", logging.log_file_path))?;
        Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true)
                .with_writer(Arc::new(file)),
        )
    } else {
        None
    };

    let stdout_layer = tracing_subscriber::fmt::layer().with_file(true).with_line_number(true);

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init();
    Ok(())
}

pub fn relay_settings(config: &Config, results_dir: &Path) -> RelaySettings {
    RelaySettings {
        own_aet: config.receiver.local_aet.clone(),
        reply_port: config.relay.reply_port,
        destination: config.relay.destination.clone(),
        poll_interval: config.inference.poll_interval(),
        result_timeout: config.inference.result_timeout(),
        required_channels: config.channels.required.clone(),
        results_dir: results_dir.to_path_buf(),
        retry: config.relay.retry_policy(),
    }
}

/// Run the gateway until Ctrl-C
pub async fn run(config: Config) -> anyhow::Result<()> {
    init_logging(&config.gateway.log_level, &config.logging)?;
    tracing::info!("🔧 Starting seggate '{}'", config.gateway.id);

    let data_dir = storage::resolve_data_dir(config.gateway.data_dir.as_deref())?;
    tracing::info!("Data directory: {}", data_dir.display());

    let queue = WorkItemQueue::open(&data_dir)
        .context("Failed to open the work item queue")?
        .with_claim_lease(config.relay.claim_lease());

    let inference = HttpInferenceClient::new(InferenceClientConfig {
        base_url: config.inference.base_url.clone(),
        model_id: config.inference.model_id.clone(),
        api_key: config.inference.api_key.clone(),
        request_timeout: config.inference.request_timeout(),
    })?;
    let dimse_config = config.receiver.dimse_config();
    let transfer = DimseTransferClient::new(Arc::new(DimseScu::new(dimse_config.clone())));

    let relay = Arc::new(ResultRelay::new(
        queue,
        Arc::new(inference),
        Arc::new(transfer),
        relay_settings(&config, &data_dir.join("results")),
    ));
    relay.recover().context("Failed to recover the work item queue")?;

    let shutdown = CancellationToken::new();
    let workers = relay.spawn_workers(config.relay.workers, shutdown.clone());
    tracing::info!("⚙️ Started {} relay workers", workers.len());

    let storage_dir = config
        .receiver
        .storage_dir
        .clone()
        .unwrap_or_else(|| data_dir.join("received"));
    let capture = SessionCapture::with_handoff_retry(
        dimse_config,
        &storage_dir,
        &config.channels.tag,
        relay.clone(),
        config.relay.retry_policy(),
    )?;
    let redelivered = capture
        .redeliver_pending()
        .await
        .context("Failed to redeliver pending sessions")?;
    if redelivered > 0 {
        tracing::info!("📥 Redelivered {} sessions left pending by the last run", redelivered);
    }

    let listening = capture
        .start(
            config.receiver.port,
            static_policy(config.receiver.accepted_transfer_syntaxes.clone()),
            config.receiver.listen_timeout(),
        )
        .await?;
    if !listening {
        shutdown.cancel();
        anyhow::bail!(
            "Session capture could not listen on {}:{}",
            config.receiver.bind_addr,
            config.receiver.port
        );
    }

    tokio::signal::ctrl_c().await.context("Failed to wait for Ctrl-C")?;
    tracing::info!("🛑 Shutdown requested");

    capture.stop().await;
    shutdown.cancel();
    for worker in workers {
        if let Err(e) = worker.await {
            tracing::error!("Relay worker ended abnormally: {}", e);
        }
    }

    tracing::info!("👋 seggate '{}' stopped", config.gateway.id);
    Ok(())
}
