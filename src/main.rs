mod archive;
mod cli;
mod config;
mod db;
mod dialog;
mod error;
mod gateway;
mod models;
mod peer;
mod session;
mod tools;
mod transport;
mod worker;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::archive::ArchiveStore;
use crate::cli::{Cli, Commands};
use crate::config::{Config, ensure_data_dir, load_config, validate_config};
use crate::dialog::DialogIndex;
use crate::gateway::TelegramGateway;
use crate::tools::ToolDispatcher;
use crate::worker::SyncWorker;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config().context("loading configuration from environment")?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if matches!(cli.command, Some(Commands::Validate)) {
        validate_config(&config)?;
        println!("Configuration is valid.");
        return Ok(());
    }

    run(config).await
}

async fn run(config: Config) -> Result<()> {
    validate_config(&config).context("config validation failed")?;
    ensure_data_dir(&config.data_dir)?;

    let pool = db::create_pool(&config).await.context("creating database")?;
    let archive = ArchiveStore::new(pool);

    let gateway = Arc::new(TelegramGateway::connect(&config).await.context("connecting to Telegram")?);
    gateway.authenticate().await.context("authenticating with Telegram")?;
    info!("authenticated with Telegram");

    // Populate the dialog index right after authenticating, before accepting any tool calls.
    let dialog_index = Arc::new(DialogIndex::new());
    dialog_index.refresh(&gateway).await.context("populating dialog index")?;

    let worker = SyncWorker::new(archive.clone(), gateway.clone(), dialog_index.clone(), &config);
    // Kick off any pending sync jobs left over from a prior run.
    worker.resume();

    let dispatcher = Arc::new(ToolDispatcher::new(
        gateway.clone(),
        dialog_index.clone(),
        archive,
        worker.clone(),
        config.default_sync_target as i64,
    ));
    let state = transport::AppState::new(dispatcher);
    let router = transport::build_router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr())
        .await
        .with_context(|| format!("binding to {}", config.listen_addr()))?;
    info!(addr = %config.listen_addr(), "transport host listening");

    let shutdown = CancellationToken::new();
    let server_shutdown = shutdown.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                server_shutdown.cancelled().await;
            })
            .await
    });

    wait_for_shutdown().await;
    info!("shutdown signal received");

    shutdown.cancel();
    let _ = server_handle.await;

    // Stop accepting connections, let the current sync job finish, then disconnect.
    worker.shutdown().await;
    gateway.close();

    info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
