//! Loom relay binary.
//!
//! Serves one WebSocket endpoint per document name and persists every
//! update to a RocksDB log (or memory, when no storage path is given).
//! With `--redis`, the log and the fan-out bus live in Redis instead, so
//! several relay processes can serve the same documents.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::info;
use loom_collab::{
    FanOutLink, LocalFanOut, MemoryLog, RedisBus, Relay, RelayServer, RocksLog, ServerConfig, StoreConfig,
    UpdateLog,
};

/// Relay command line arguments.
#[derive(Parser, Debug)]
#[command(name = "loom-relay")]
#[command(about = "CRDT document sync relay")]
struct Args {
    /// Address to listen on
    #[arg(short, long, env = "LOOM_BIND", default_value = "127.0.0.1:1234")]
    bind: String,

    /// RocksDB directory for the update log; in-memory when absent
    #[arg(short, long, env = "LOOM_STORAGE", value_name = "PATH")]
    storage: Option<PathBuf>,

    /// Redis URL holding the update log and fan-out bus shared with sibling relays
    #[arg(long, env = "LOOM_REDIS_URL", value_name = "URL", conflicts_with = "storage")]
    redis: Option<String>,

    /// Seconds of silence before a remote awareness state is dropped
    #[arg(long, env = "LOOM_AWARENESS_TIMEOUT", default_value_t = 30)]
    awareness_timeout: u64,

    /// Seconds a handshake waits for the document to catch up
    #[arg(long, default_value_t = 10)]
    sync_timeout: u64,

    /// Skip fsync on every append
    #[arg(long)]
    no_sync_writes: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    info!("Starting loom-relay");

    let (log, link): (Arc<dyn UpdateLog>, FanOutLink) = match (&args.redis, &args.storage) {
        (Some(url), _) => {
            let bus = RedisBus::connect(url).await?;
            info!("Update log and fan-out bus on {url}");
            let log: Arc<dyn UpdateLog> = bus.log;
            (log, bus.link)
        }
        (None, Some(path)) => {
            let config = StoreConfig {
                path: path.clone(),
                sync_writes: !args.no_sync_writes,
                ..StoreConfig::default()
            };
            let store = RocksLog::open(config)?;
            info!("Update log at {}", path.display());
            let log: Arc<dyn UpdateLog> = Arc::new(store);
            (log, LocalFanOut::new().connect())
        }
        (None, None) => {
            info!("No storage path, keeping updates in memory");
            let log: Arc<dyn UpdateLog> = Arc::new(MemoryLog::new());
            (log, LocalFanOut::new().connect())
        }
    };

    let relay = Relay::new(log, link);
    let config = ServerConfig {
        bind_addr: args.bind,
        awareness_timeout: Duration::from_secs(args.awareness_timeout),
        sync_timeout: Duration::from_secs(args.sync_timeout),
        ..ServerConfig::default()
    };
    let server = RelayServer::new(config, relay.clone());

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
    }

    relay.shutdown().await;
    Ok(())
}
