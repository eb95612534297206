//! # switchyard
//!
//! Gateway binary: loads settings, opens the durable store, and serves the
//! Bot and Worker WebSocket endpoints until interrupted.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use switchyard_gateway::Gateway;
use switchyard_settings::{resolve_data_path, StoreBackend, SwitchyardSettings};
use switchyard_store::{MemoryKv, SharedStore, SqliteKv};
use switchyard_telemetry::{init_telemetry, TelemetryConfig};

const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Bot/Worker message gateway.
#[derive(Parser, Debug)]
#[command(name = "switchyard", about = "Bot/Worker message gateway")]
struct Cli {
    /// Settings file (defaults to `~/.switchyard/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind, overriding settings.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign), overriding settings.
    #[arg(long)]
    port: Option<u16>,

    /// Durable store backend: `memory` or `sqlite`.
    #[arg(long)]
    store: Option<StoreBackend>,

    /// Log level, overridden by `RUST_LOG`.
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn load(&self) -> Result<SwitchyardSettings> {
        let mut settings = match &self.config {
            Some(path) => switchyard_settings::load_settings_from_path(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => switchyard_settings::load_settings().context("Failed to load settings")?,
        };
        if let Some(host) = &self.host {
            settings.server.host = host.clone();
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(backend) = self.store {
            settings.store.backend = backend;
        }
        if let Some(level) = &self.log_level {
            settings.telemetry.level = level.clone();
        }
        Ok(settings)
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

/// Open the configured store. The SQLite backend also gets an expiry sweep.
fn open_store(
    settings: &SwitchyardSettings,
    cancel: CancellationToken,
) -> Result<(SharedStore, Option<JoinHandle<()>>)> {
    match settings.store.backend {
        StoreBackend::Memory => {
            let store: SharedStore = Arc::new(MemoryKv::new());
            Ok((store, None))
        }
        StoreBackend::Sqlite => {
            let path = resolve_data_path(&settings.store.path);
            ensure_parent_dir(&path)?;
            let kv = Arc::new(
                SqliteKv::open(&path)
                    .with_context(|| format!("Failed to open store at {}", path.display()))?,
            );
            tracing::info!(path = %path.display(), "sqlite store opened");

            let sweeper = kv.clone();
            let purge = tokio::spawn(async move {
                let mut tick = tokio::time::interval(PURGE_INTERVAL);
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        _ = tick.tick() => match sweeper.purge_expired().await {
                            Ok(0) => {}
                            Ok(n) => tracing::debug!(purged = n, "expired keys purged"),
                            Err(e) => tracing::warn!(error = %e, "expiry sweep failed"),
                        },
                    }
                }
            });
            let store: SharedStore = kv;
            Ok((store, Some(purge)))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.load()?;

    let log_db_path = settings
        .telemetry
        .log_db
        .as_deref()
        .map(resolve_data_path);
    if let Some(path) = &log_db_path {
        ensure_parent_dir(path)?;
    }
    let telemetry = init_telemetry(TelemetryConfig {
        log_level: TelemetryConfig::parse_level(&settings.telemetry.level),
        json: settings.telemetry.json,
        log_db_path,
        metrics_enabled: settings.telemetry.metrics,
    });

    tracing::info!(
        host = %settings.server.host,
        port = settings.server.port,
        store = ?settings.store.backend,
        queue = settings.dispatch.queue_enabled,
        "starting switchyard"
    );

    let store_cancel = CancellationToken::new();
    let (store, purge) = open_store(&settings, store_cancel.clone())?;
    let gateway = Gateway::new(settings, store);

    let handle = switchyard_gateway::start(gateway.clone(), telemetry.prometheus())
        .await
        .context("Failed to start server")?;
    tracing::info!(addr = %handle.addr, "switchyard ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;
    tracing::info!("shutting down");

    store_cancel.cancel();
    let mut tasks = handle.tasks;
    tasks.extend(purge);
    gateway.shutdown.graceful_shutdown(tasks, None).await;
    Ok(())
}
