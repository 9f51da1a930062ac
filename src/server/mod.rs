//! RESP TCP server

mod connection;

use crate::config::ServerConfig;
use crate::db::limiter::LimitersMgr;
use crate::metrics;
use crate::store::Store;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shared state every connection task sees.
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<dyn Store>,
    pub limiters: Option<Arc<LimitersMgr>>,
    pub cancel_token: CancellationToken,
    next_client_id: AtomicU64,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn Store>,
        limiters: Option<Arc<LimitersMgr>>,
        cancel_token: CancellationToken,
    ) -> AppState {
        AppState {
            config,
            store,
            limiters,
            cancel_token,
            next_client_id: AtomicU64::new(1),
        }
    }

    fn next_client_id(&self) -> u64 {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Main server struct
pub struct Server {
    state: Arc<AppState>,
    connection_permits: Arc<Semaphore>,
}

impl Server {
    /// Create a new server
    pub fn new(state: Arc<AppState>) -> Server {
        let connection_permits = Arc::new(Semaphore::new(state.config.max_connection));
        Server {
            state,
            connection_permits,
        }
    }

    /// Accept connections until shutdown. Each accepted socket gets its own
    /// task; the permit it carries caps concurrent connections.
    pub async fn run(self) -> anyhow::Result<()> {
        let addr: SocketAddr = self.state.config.listen.parse()?;
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "accepting connections");

        loop {
            let accepted = tokio::select! {
                _ = self.state.cancel_token.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => self.dispatch(stream, peer),
                Err(err) => error!(error = %err, "accept failed"),
            }
        }

        info!("accept loop stopped");
        Ok(())
    }

    /// Hand one accepted socket to its connection task, or drop it when the
    /// connection table is full.
    fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        let Ok(permit) = self.connection_permits.clone().try_acquire_owned() else {
            metrics::global().rejected_connections.inc();
            warn!(%peer, "connection table full, dropping");
            return;
        };

        if let Err(err) = stream.set_nodelay(true) {
            debug!(%peer, error = %err, "set_nodelay failed");
        }

        let client_id = self.state.next_client_id();
        debug!(%peer, client_id, "connection accepted");
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            connection::serve(state, stream, client_id).await;
            drop(permit);
        });
    }
}
