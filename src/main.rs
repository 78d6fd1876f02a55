//! Feedhub daemon - subscription feed push notification server

use anyhow::{Context, Result};
use clap::Parser;
use feedhub::auth::TokenService;
use feedhub::dispatch;
use feedhub::hub::spawn_ingestor;
use feedhub::server::{build_router, AppState};
use feedhub::storage::{MemoryStore, PostgresConfig, PostgresStore, Store};
use feedhub::upstream::{HttpMetadataClient, PoolConfig, PoolMode, UpstreamPool};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "feedhub")]
#[command(about = "Subscription feed push notification daemon")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:3000", env = "FEEDHUB_BIND")]
    bind: String,

    /// Shared secret for webhook verification tokens and signatures
    #[arg(long, env = "FEEDHUB_HUB_SECRET")]
    hub_secret: String,

    /// Capability token signing secret; omitted means an ephemeral one
    #[arg(long, env = "FEEDHUB_TOKEN_SECRET")]
    token_secret: Option<String>,

    /// Database URL; omitted runs on the in-memory store
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Base URL of the upstream origin API
    #[arg(long, env = "FEEDHUB_UPSTREAM_URL")]
    upstream_url: String,

    /// Upstream pool capacity
    #[arg(long, default_value_t = 10, env = "FEEDHUB_POOL_CAPACITY")]
    pool_capacity: usize,

    /// Upstream pool mode: "single" or "multiplexed"
    #[arg(long, default_value = "single", env = "FEEDHUB_POOL_MODE")]
    pool_mode: String,

    /// Upstream request timeout in seconds
    #[arg(long, default_value_t = 10, env = "FEEDHUB_REQUEST_TIMEOUT")]
    request_timeout: u64,

    /// Log level
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    run_server(args).await
}

async fn run_server(args: Args) -> Result<()> {
    let store: Arc<dyn Store> = match &args.database_url {
        Some(url) => {
            let config = PostgresConfig::from_url(url).context("Invalid DATABASE_URL")?;
            Arc::new(PostgresStore::new(config).await?)
        }
        None => {
            warn!("no DATABASE_URL set, state will not survive restart");
            Arc::new(MemoryStore::new())
        }
    };

    let token_secret = match args.token_secret {
        Some(secret) => secret.into_bytes(),
        None => {
            warn!("no token secret set, issued tokens will not survive restart");
            let mut bytes = [0u8; 32];
            rand::rng().fill(&mut bytes);
            bytes.to_vec()
        }
    };
    let tokens = Arc::new(TokenService::new(token_secret));

    let pool_mode = match args.pool_mode.as_str() {
        "single" => PoolMode::Single,
        "multiplexed" => PoolMode::Multiplexed,
        other => anyhow::bail!("unknown pool mode '{}'", other),
    };
    let pool = UpstreamPool::new(PoolConfig {
        capacity: args.pool_capacity,
        mode: pool_mode,
        lease_timeout: None,
        request_timeout: Duration::from_secs(args.request_timeout),
    })?;
    let client = Arc::new(HttpMetadataClient::new(pool, args.upstream_url));

    let dispatcher = dispatch::spawn();

    // Prefer the store's own change feed: it carries inserts from every
    // process sharing the database. Only a feed-less store publishes from
    // the ingest path directly, so each insert reaches subscribers once.
    let publish_direct = match store.changes().await? {
        Some(mut changes) => {
            let bridge = dispatcher.clone();
            tokio::spawn(async move {
                while let Some(event) = changes.recv().await {
                    bridge.publish(event);
                }
                warn!("store change feed closed");
            });
            false
        }
        None => true,
    };

    let ingest = spawn_ingestor(store.clone(), client, dispatcher.clone(), publish_direct);

    let state = AppState {
        store,
        tokens,
        dispatcher,
        ingest,
        hub_secret: Arc::new(args.hub_secret.into_bytes()),
    };

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("Failed to bind {}", args.bind))?;

    info!(addr = %args.bind, "feedhub daemon starting");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("feedhub daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
