//! Snob - Gitea webhook receiver and AI pull-request reviewer.
//!
//! Serves `/ping` and `/webhook`, queues accepted review requests and
//! processes them on a background worker pool until SIGINT/SIGTERM.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use snob::{Config, HttpServer, Recoverer, Reviewer, Supervisor, WebhookService};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "snob_starting");

    // Load configuration
    let config = Config::from_env();
    info!(
        listen_addr = %config.http_listen_addr,
        signature_configured = config.webhook_secret.is_some(),
        debug = config.webhook_debug,
        workers = config.webhook_workers,
        queue_capacity = config.webhook_queue_capacity,
        max_in_flight = ?config.webhook_max_in_flight,
        request_timeout_ms = ?config.request_timeout.map(|d| d.as_millis()),
        shutdown_timeout_ms = config.shutdown_timeout.as_millis() as u64,
        gitea_base_url = %config.gitea_base_url,
        ai_model = %config.ai_model,
        "config_loaded"
    );

    let reviewer = Reviewer::from_config(&config).context("Invalid review configuration")?;

    let mut webhook = WebhookService::new(reviewer.into_processor(), Recoverer::new("webhook"))
        .with_workers(config.webhook_workers)
        .with_queue_capacity(config.webhook_queue_capacity)
        .with_processing_limit(config.processing_limit());
    if let Some(secret) = &config.webhook_secret {
        webhook = webhook.with_secret(secret.clone());
    }
    if config.webhook_debug {
        webhook = webhook.with_debug(config.webhook_debug_dir.clone());
    }

    let mut pipeline = webhook
        .pipeline()
        .with_body_limit(config.webhook_max_body_bytes);
    if let Some(timeout) = config.request_timeout {
        pipeline = pipeline.with_request_timeout(timeout);
    }

    let server = HttpServer::new(config.http_listen_addr.clone())
        .with_ping()
        .with_pipeline("/webhook", pipeline);

    let supervisor = Supervisor::new(Recoverer::new("app"))
        .with_module(Arc::new(server))
        .with_module(Arc::new(webhook))
        .with_shutdown_timeout(config.shutdown_timeout);

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    supervisor.run(cancel).await.context("App exited with error")?;

    info!("snob_shutdown_complete");

    Ok(())
}

/// Cancel `cancel` once a shutdown signal is received.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "sigint_handler_failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "sigterm_handler_failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
        _ = cancel.cancelled() => return,
    }

    info!("snob_shutting_down");
    cancel.cancel();
}
