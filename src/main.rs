//! Proxied daemon entry point.
//!
//! Watches the container runtime and keeps the reverse proxy's upstream and
//! location files in step with the running containers.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;

mod apply;
mod audit;
mod config;
mod error;
mod metadata;
mod reconcile;
mod render;
mod routes;
mod runtime;
mod types;
mod validate;

use apply::{Applier, ArtifactPaths, CommandReloader};
use audit::FileAuditSink;
use config::Config;
use metadata::MetadataExtractor;
use reconcile::Reconciler;
use render::Renderer;
use runtime::{DockerRuntime, EventSource};
use validate::CommandValidator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting proxied with config: {:?}", cfg);

    // Container Runtime (Docker)
    let docker = DockerRuntime::connect()?;
    let network_name = match cfg.network_name.clone() {
        Some(name) => name,
        None => loop {
            match DockerRuntime::autodetect_network(&docker).await {
                Ok(name) => break name,
                Err(e) => {
                    error!("Network discovery failed: {}. Retrying in 10s...", e);
                    sleep(Duration::from_secs(10)).await;
                }
            }
        },
    };
    let runtime = Arc::new(DockerRuntime::new(docker, network_name));
    info!("Managing routes for network {}", runtime.network_name());

    let audit = Arc::new(FileAuditSink::open(cfg.audit_log.clone()).await?);
    let validator = CommandValidator::new(
        cfg.staging_dir.clone(),
        cfg.listen_port,
        cfg.validate_command.clone(),
    )
    .with_template(cfg.validate_template.clone());
    let applier = Applier::new(
        ArtifactPaths {
            upstreams: cfg.upstreams_path.clone(),
            locations: cfg.locations_path.clone(),
        },
        Box::new(CommandReloader::new(cfg.reload_command.clone())),
    );
    let reconciler = Reconciler::new(
        runtime.clone(),
        MetadataExtractor::new(runtime.network_name(), cfg.label_prefix.clone()),
        Box::new(validator),
        applier,
        audit,
    )
    .with_policy(cfg.collision_policy)
    .with_renderer(Renderer::new(cfg.keepalive))
    .with_deadline(cfg.cycle_timeout());

    // Trigger channel
    let (trigger_tx, trigger_rx) = mpsc::channel(128);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Event Watcher
    let watcher = Arc::clone(&runtime);
    let watcher_handle = tokio::spawn(async move {
        if let Err(e) = watcher.watch(trigger_tx).await {
            error!("Event watcher failed: {}", e);
        }
    });

    // Reconcile loop, starting with one unconditional pass
    let reconcile_handle = tokio::spawn(reconciler.run(trigger_rx, shutdown_rx));

    // Graceful Shutdown
    shutdown_signal().await;

    watcher_handle.abort();
    let _ = shutdown_tx.send(true);
    if let Err(e) = reconcile_handle.await {
        error!("Reconcile loop ended abnormally: {}", e);
    }

    info!("Shutdown complete.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("Unable to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!("Unable to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
