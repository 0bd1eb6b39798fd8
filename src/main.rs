mod cache;
mod config;
mod forge;
mod health;
mod http;
mod metrics;
mod storage;

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::cache::{CacheManager, CachedResource, ViewBuilder};
use crate::config::Config;
use crate::http::proxy::ReverseProxy;
use crate::metrics::MetricsRegistry;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "orgcache", about = "Read-through cache for a GitHub organization")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/orgcache/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cache_manager: CacheManager,
    pub views: ViewBuilder,
    pub proxy: Arc<ReverseProxy>,
    /// Resolved paths answered from the store.
    pub cached_paths: Arc<HashSet<String>>,
    pub metrics: MetricsRegistry,
    pub http_client: reqwest::Client,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        cache_manager: CacheManager,
        views: ViewBuilder,
        proxy: ReverseProxy,
        metrics: MetricsRegistry,
        http_client: reqwest::Client,
    ) -> Self {
        let cached_paths = CachedResource::from_config(&config.cache)
            .into_iter()
            .map(|r| r.path)
            .collect();
        Self {
            config,
            cache_manager,
            views,
            proxy: Arc::new(proxy),
            cached_paths: Arc::new(cached_paths),
            metrics,
            http_client,
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState, shutdown: CancellationToken) -> Result<()> {
    let app = http::handler::create_router(Arc::new(state.clone()));

    let listen_addr: std::net::SocketAddr = state
        .config
        .proxy
        .http_listen
        .parse()
        .context("invalid http_listen address")?;

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .context("failed to install Ctrl+C handler")
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?
            .recv()
            .await;
        Ok::<(), anyhow::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        res = ctrl_c => {
            res?;
            tracing::info!("received SIGINT");
        }
        res = terminate => {
            res?;
            tracing::info!("received SIGTERM");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;
    let config = Arc::new(config);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(
        config_path = %cli.config,
        org = %config.cache.org,
        "starting orgcache"
    );

    // ---- Infrastructure clients ----
    let store = storage::build_store(&config.store).await?;

    let http_client = reqwest::Client::builder()
        .user_agent(concat!("orgcache/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(config.upstream.connect_timeout())
        .build()
        .context("failed to build reqwest client")?;

    let proxy = ReverseProxy::new(&config.upstream).context("failed to build reverse proxy")?;

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    // ---- Cache ----
    let fetcher = Arc::new(forge::GitHubClient::new(
        &config.upstream,
        http_client.clone(),
        metrics.clone(),
    ));
    let cache_manager = CacheManager::new(fetcher, Arc::clone(&store));
    let views = ViewBuilder::new(store, metrics.clone());

    // ---- App state ----
    let state = AppState::new(
        Arc::clone(&config),
        cache_manager.clone(),
        views.clone(),
        proxy,
        metrics.clone(),
        http_client,
    );

    // ---- Shutdown ----
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = shutdown_signal().await {
                tracing::error!(error = %e, "signal handler failed");
            }
            shutdown.cancel();
        }
    });

    // ---- Spawn services ----
    let workers = cache::scheduler::spawn_workers(
        &config.cache,
        cache_manager,
        views,
        metrics,
        shutdown.clone(),
    );

    let http_handle = tokio::spawn({
        let s = state.clone();
        let shutdown = shutdown.clone();
        async move {
            let result = run_http_server(s, shutdown.clone()).await;
            if let Err(e) = &result {
                tracing::error!(error = %e, "HTTP server failed");
                shutdown.cancel();
            }
            result
        }
    });

    // ---- Await shutdown ----
    // A worker only returns an error after cancelling the token, so the
    // server is already winding down when we see it.
    let mut fatal = cache::scheduler::join_workers(workers, &shutdown)
        .await
        .err()
        .map(|e| anyhow::Error::new(e).context("refresh worker failed"));
    match http_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => fatal = fatal.or(Some(e)),
        Err(e) => tracing::error!(error = %e, "HTTP server task panicked"),
    }

    if let Some(e) = fatal {
        return Err(e);
    }
    tracing::info!("orgcache shut down cleanly");
    Ok(())
}
