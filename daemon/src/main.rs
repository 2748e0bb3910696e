//! Chronolog daemon (chronologd)
//!
//! Long-running service owning the activity log:
//! - Typed event store on SQLite with schema upgrades
//! - Blacklist and data-source extensions
//! - Monitor fan-out to subscribed clients
//!
//! Architecture:
//! - Unix socket listener at `<data dir>/chronologd.sock`
//! - Newline-delimited JSON messages (IpcMessage/IpcResponse)
//! - One instance per data directory, negotiated over the socket

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use tokio::sync::{Mutex, Notify};
use tracing::info;

mod blacklist;
mod datasource;
mod db;
mod extension;
mod handlers;
mod lru;
mod notify;
mod server;
mod singleton;

use blacklist::Blacklist;
use chronolog_core::ipc::{self, IpcClient};
use datasource::DataSourceRegistry;
use db::{Engine, DEFAULT_CACHE_SIZE};
use extension::ExtensionRegistry;
use notify::MonitorRegistry;

#[derive(Parser)]
#[command(name = "chronologd", version, about = "Activity log daemon")]
struct Args {
    /// Take over the socket from a running instance
    #[arg(long)]
    replace: bool,

    /// Ask a running instance to quit, then exit
    #[arg(long)]
    quit: bool,
}

/// Global state for the daemon.
pub struct DaemonState {
    /// When the daemon started
    start_time: Instant,

    /// Shutdown signal
    shutdown: Notify,

    /// Hands out per-connection ids for monitor bookkeeping
    next_connection_id: AtomicU64,

    /// Path to the Unix socket
    pub socket_path: PathBuf,

    /// The log engine; one writer at a time
    pub engine: Mutex<Engine>,

    /// Installed monitors
    pub monitors: Mutex<MonitorRegistry>,
}

impl DaemonState {
    pub fn new() -> Result<Self> {
        let data_path = ipc::data_path();
        std::fs::create_dir_all(&data_path)?;

        let cache_size = std::env::var("CHRONOLOG_CACHE_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_CACHE_SIZE);

        let mut extensions = ExtensionRegistry::new();
        extensions.register(Box::new(Blacklist::load(data_path.join("blacklist.json"))))?;
        extensions.register(Box::new(DataSourceRegistry::load(
            data_path.join("datasources.json"),
        )))?;

        let engine = Engine::new(ipc::database_path(), cache_size, extensions);

        Ok(Self {
            start_time: Instant::now(),
            shutdown: Notify::new(),
            next_connection_id: AtomicU64::new(1),
            socket_path: ipc::socket_path(),
            engine: Mutex::new(engine),
            monitors: Mutex::new(MonitorRegistry::new()),
        })
    }

    /// Get uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Request a graceful shutdown.
    pub fn request_shutdown(&self) {
        self.shutdown.notify_one();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("chronologd=info".parse()?),
        )
        .init();

    let args = Args::parse();

    if args.quit {
        let client = IpcClient::new();
        if client.daemon_available() {
            client.quit()?;
            info!("Asked running instance to quit");
        } else {
            info!("No running instance");
        }
        return Ok(());
    }

    info!("Starting chronologd v{}", env!("CARGO_PKG_VERSION"));

    singleton::acquire(&ipc::socket_path(), args.replace)?;

    let state = Arc::new(DaemonState::new()?);
    server::run(state).await
}
