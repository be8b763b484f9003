//! Shared shopping list WebSocket server
//! Hosts list workers and streams list events to connected clients

mod connection;

use anyhow::Context;
use clap::Parser;
use listsync::{Authenticator, FileStore, ListRegistry, ListStore, MemoryStore, StaticTokens, SyncConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "list-server")]
#[command(about = "Real-time sync server for shared shopping lists")]
#[command(version)]
struct Args {
    /// Address to accept WebSocket connections on
    #[arg(long, env = "LIST_SERVER_LISTEN", default_value = "127.0.0.1:8080")]
    listen: String,

    /// Directory for list files; lists are kept in memory when omitted
    #[arg(long, env = "LIST_SERVER_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// JSON file mapping access tokens to user ids
    #[arg(long, env = "LIST_SERVER_TOKENS")]
    tokens: Option<PathBuf>,

    /// JSON file with sync tunables
    #[arg(long, env = "LIST_SERVER_CONFIG")]
    config: Option<PathBuf>,

    /// Events buffered per session before it is dropped
    #[arg(long, env = "LIST_SERVER_QUEUE_CAPACITY")]
    queue_capacity: Option<usize>,

    /// Seconds without activity before a user is no longer present
    #[arg(long, env = "LIST_SERVER_PRESENCE_TIMEOUT")]
    presence_timeout: Option<u64>,

    /// Log filter, used when RUST_LOG is not set
    #[arg(long, default_value = "list_server=info,listsync=info")]
    log: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = load_config(&args).await?;

    let store: Arc<dyn ListStore> = match &args.data_dir {
        Some(dir) => {
            info!("Storing lists under {}", dir.display());
            Arc::new(FileStore::open(dir).await?)
        }
        None => {
            warn!("No data directory given; lists are lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    let auth: Arc<dyn Authenticator> = match &args.tokens {
        Some(path) => {
            let tokens = StaticTokens::load(path).await?;
            info!("Loaded {} access tokens", tokens.len());
            Arc::new(tokens)
        }
        None => {
            warn!("No tokens file given; every connection will be refused");
            Arc::new(StaticTokens::new())
        }
    };

    let registry = Arc::new(ListRegistry::new(store, config));

    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!("List server listening on: {}", args.listen);

    while let Ok((stream, addr)) = listener.accept().await {
        info!("New connection from: {}", addr);
        tokio::spawn(connection::handle_connection(
            stream,
            addr,
            registry.clone(),
            auth.clone(),
        ));
    }

    Ok(())
}

/// Defaults, then the config file, then command line overrides
async fn load_config(args: &Args) -> anyhow::Result<SyncConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let json = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read config {}", path.display()))?;
            serde_json::from_str(&json)
                .with_context(|| format!("invalid config {}", path.display()))?
        }
        None => SyncConfig::default(),
    };

    if let Some(capacity) = args.queue_capacity {
        config.session_queue_capacity = capacity;
    }
    if let Some(timeout) = args.presence_timeout {
        config.presence_timeout_secs = timeout;
    }

    config.validate()?;
    Ok(config)
}
