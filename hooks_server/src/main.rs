//! Cyhooks server — push-driven build hooks.
//!
//! Receives push webhooks, runs the sync/provision pipeline for the watched
//! branch, streams progress to dashboard sockets, and keeps build history
//! in a snapshot file across restarts.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;

use cyhooks_server::config::{Cli, HookConfig};
use cyhooks_server::routes::{self, HooksState};
use cyhooks_server::services::broadcast_hub::BroadcastHub;
use cyhooks_server::services::event_store::EventStore;
use cyhooks_server::services::executor::{BuildExecutor, CommandExecutor};
use cyhooks_server::services::notify_service::{DisabledNotifier, Notifier, SlackNotifier};
use cyhooks_server::services::pipeline::BuildPipeline;
use cyhooks_server::services::snapshot::Snapshotter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    }

    let config = HookConfig::from_cli(Cli::parse());

    tracing::info!(
        branch = %config.target_branch,
        workdir = %config.workdir.display(),
        "Starting cyhooks server..."
    );

    tokio::fs::create_dir_all(&config.workdir).await?;

    // Event store, rehydrated from the last snapshot
    let hub = Arc::new(BroadcastHub::new(config.queue_capacity));
    let store = Arc::new(EventStore::new(hub.clone()));
    let snapshotter = Arc::new(Snapshotter::new(&config.snapshot_path));
    snapshotter.load(&store).await;

    let executor: Arc<dyn BuildExecutor> = Arc::new(
        CommandExecutor::new(&config.workdir, &config.provision_command)
            .with_timeout(config.step_timeout),
    );
    let notifier: Arc<dyn Notifier> = match &config.slack {
        Some(slack) => Arc::new(SlackNotifier::for_company(&slack.company, &slack.token)),
        None => Arc::new(DisabledNotifier),
    };

    let pipeline = Arc::new(
        BuildPipeline::new(
            store.clone(),
            executor,
            notifier,
            snapshotter.clone(),
            config.target_branch.clone(),
        )
        .with_tick_interval(config.tick_interval),
    );

    let state = HooksState {
        store: store.clone(),
        hub,
        pipeline,
    };
    let app = routes::hooks_router(state, &config.static_dir);

    if let Some(addr) = config.metrics_addr {
        cyhooks_server::metrics::init_metrics(addr);
    }

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Cyhooks server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Builds still running are abandoned; they keep a non-terminal status.
    tracing::info!("Saving final snapshot...");
    if let Err(e) = snapshotter.save(&store).await {
        tracing::error!("Final snapshot failed: {e}");
    }
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
