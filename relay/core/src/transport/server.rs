//! Relay Server
//!
//! Binds a TCP listener and serves both transports from one axum router.
//!
//! # Shutdown
//!
//! When the shutdown future resolves: every running generation is
//! cancelled (ending open SSE responses), every socket is closed with 1001,
//! the heartbeat task stops, and axum drains remaining requests.

use std::future::Future;
use std::net::SocketAddr;

use tokio::net::TcpListener;

use super::{router, AppState};
use crate::error::TransportError;

/// HTTP + WebSocket server
pub struct RelayServer {
    listener: TcpListener,
    state: AppState,
}

impl RelayServer {
    /// Bind `addr` (e.g. `127.0.0.1:8080`, port 0 for an ephemeral port)
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Bind`] if the address cannot be bound.
    pub async fn bind(addr: &str, state: AppState) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        Ok(Self { listener, state })
    }

    /// Address actually bound
    ///
    /// # Errors
    ///
    /// Propagates the socket error.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` resolves
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Serve`] if the accept loop fails.
    pub async fn run<F>(self, shutdown: F) -> Result<(), TransportError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.local_addr()?;
        let sockets = self.state.sockets.clone();
        let multiplexer = self.state.multiplexer.clone();
        sockets.start();

        tracing::info!(addr = %addr, "Relay server listening");

        let drain_sockets = sockets.clone();
        let drain_generations = multiplexer.clone();
        let result = axum::serve(self.listener, router(self.state))
            .with_graceful_shutdown(async move {
                shutdown.await;
                tracing::info!(
                    active_generations = drain_generations.active_count(),
                    "Shutdown requested"
                );
                drain_generations.cancel_all();
                drain_sockets.shutdown().await;
            })
            .await;

        // Covers the accept loop failing without a shutdown request
        multiplexer.cancel_all();
        sockets.shutdown().await;

        tracing::info!("Relay server stopped");
        result.map_err(TransportError::Serve)
    }
}
