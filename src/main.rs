//! Quarry - Redis-protocol serving layer over a transactional KV store

// Use jemalloc for better multi-threaded performance
#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use quarry::config::{Config, KvConfig, ServerConfig};
use quarry::db::expire::ExpireEngine;
use quarry::db::limiter::LimitersMgr;
use quarry::server::{AppState, Server};
use quarry::status::StatusServer;
use quarry::store::{MemStore, Store};
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            info!(path = %path, "loading configuration file");
            Config::from_file(&path)?
        }
        None => {
            info!("no config file given, using defaults with QUARRY_* overrides");
            Config::from_env()
        }
    };
    debug!(config = ?config, "resolved configuration");

    build_runtime(&config.server)?.block_on(run(config))
}

fn build_runtime(server: &ServerConfig) -> anyhow::Result<Runtime> {
    let mut builder = Builder::new_multi_thread();
    builder.enable_all();
    if server.worker_threads > 0 {
        builder.worker_threads(server.worker_threads);
    }
    Ok(builder.build()?)
}

fn open_store(kv: &KvConfig) -> anyhow::Result<Arc<dyn Store>> {
    match kv.backend.as_str() {
        "memory" => {
            if !kv.pd_addrs.is_empty() {
                warn!("pd-addrs are ignored by the memory backend");
            }
            Ok(Arc::new(MemStore::new()))
        }
        other => anyhow::bail!(
            "unknown kv backend '{other}' (the distributed engine adapter is wired at deploy time)"
        ),
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let store = open_store(&config.kv)?;

    let status = if config.status.enabled {
        let status = Arc::new(StatusServer::new());
        let worker = Arc::clone(&status);
        let status_config = config.status.clone();
        std::thread::spawn(move || {
            if let Err(err) = worker.run(&status_config) {
                error!(error = %err, "status server failed");
            }
        });
        Some(status)
    } else {
        None
    };

    let _leader_status = ExpireEngine::start(
        Arc::clone(&store),
        config.kv.expire.clone(),
        shutdown.clone(),
    );

    let limiters = if config.kv.rate_limit.limiter_namespace.is_empty() {
        info!("rate limiting disabled, no limiter-namespace configured");
        None
    } else {
        let mgr = LimitersMgr::new(Arc::clone(&store), &config.kv.rate_limit)?;
        mgr.start(shutdown.clone());
        Some(mgr)
    };

    let state = Arc::new(AppState::new(
        config.server.clone(),
        store,
        limiters,
        shutdown.clone(),
    ));

    // one task owns signal handling; everything else watches the token
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    if let Some(status) = &status {
        status.set_ready(true);
    }

    info!(listen = %config.server.listen, "quarry ready");
    let result = Server::new(state).run().await;

    if let Some(status) = &status {
        status.graceful_stop();
    }
    info!("quarry stopped");
    result
}

/// Resolves once the process is asked to stop: interrupt, plus SIGTERM
/// where the platform has one.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
                    _ = sigterm.recv() => info!("terminate received, shutting down"),
                }
            }
            Err(err) => {
                error!(error = %err, "sigterm handler unavailable, watching interrupt only");
                let _ = tokio::signal::ctrl_c().await;
                info!("interrupt received, shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("interrupt received, shutting down");
    }
}
