//! Core server: owns the session registry and the gateway accept loop.

use crate::config::ServerConfig;
use crate::gateway;
use crate::session::registry::SessionRegistry;
use hpcsh_core::{HpcshError, HpcshResult};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// The hpcsh server instance.
pub struct HpcshServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    next_conn_id: AtomicU64,
}

impl HpcshServer {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.clone()));
        Self {
            config,
            registry,
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Handle to the session registry, for the surrounding HTTP layer and
    /// for tests.
    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Bind the configured port and serve until the process is stopped.
    pub async fn run(&self) -> HpcshResult<()> {
        let addr: SocketAddr = format!("0.0.0.0:{}", self.config.port)
            .parse()
            .map_err(|e| HpcshError::Other(format!("invalid address: {e}")))?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HpcshError::Transport(format!("bind failed: {e}")))?;
        info!(addr = %addr, "gateway listening");
        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener (tests bind their own).
    pub async fn serve(&self, listener: TcpListener) -> HpcshResult<()> {
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
                    let registry = self.registry.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            gateway::handle_connection(registry, stream, remote, conn_id).await
                        {
                            warn!(remote = %remote, conn_id, error = %e, "connection error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    }

    /// Force-terminate and reap every session. Called on process-wide
    /// shutdown; any session state goes straight to reaped.
    pub async fn shutdown(&self) {
        self.registry.shutdown_all().await;
    }
}
