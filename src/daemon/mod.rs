//! Daemon lifecycle
//!
//! Startup order: resolve paths, create the config directory (0700), point
//! the log at `jim-server.log` (truncated), spawn the state manager and
//! idle-lock timer, then bind the socket and serve until a signal arrives.
//! Startup failure and signal-driven shutdown both exit with code 1; the
//! daemon has no successful exit.

pub mod idle;
pub mod pipeline;
pub mod protocol;
pub mod server;
pub mod service;
pub mod state;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::info;

use crate::config::{self, JimPaths};
use idle::IdleTimer;
use server::IpcServer;
use service::JimService;

/// Run the daemon. Returns only on error; on SIGINT/SIGTERM the process
/// exits directly after removing the socket.
pub async fn run() -> Result<()> {
    let paths = JimPaths::resolve()?;
    paths.ensure_config_dir()?;
    init_logging(&paths.log_file())?;

    info!("jim daemon starting");
    info!("config directory: {}", paths.config_dir().display());

    let state = state::spawn_state_manager();
    let timer = IdleTimer::spawn(state.clone(), config::idle_lock_duration());
    let service = Arc::new(JimService::new(state, timer, paths.indices_dir()));
    let ipc = IpcServer::new(paths.socket(), service);

    tokio::select! {
        result = ipc.run() => {
            // The accept loop only returns on a startup error.
            result?;
        }
        _ = signal::ctrl_c() => {
            info!("received SIGINT, exiting");
        }
        _ = wait_for_sigterm() => {
            info!("received SIGTERM, exiting");
        }
    }

    let _ = std::fs::remove_file(paths.socket());
    std::process::exit(1);
}

fn init_logging(log_file: &Path) -> Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(log_file)
        .with_context(|| format!("failed to open log file {}", log_file.display()))?;

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_target(false)
        .with_writer(Arc::new(file))
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to install the log subscriber")?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!("failed to register SIGTERM handler: {e}");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await
}
