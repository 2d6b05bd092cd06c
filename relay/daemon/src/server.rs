//! Daemon Server Wiring
//!
//! Builds the collaborators from [`RelayConfig`] and runs the relay server
//! until SIGINT/SIGTERM:
//!
//! ```text
//!   RelayConfig ─► OpenAiCompatibleBackend ┐
//!                  InMemoryMessageStore    ├─► StreamMultiplexer ─► SocketManager
//!                  StaticAgentDirectory    ┘            │                 │
//!                  SignedTokenVerifier ─────────────► AppState ◄──────────┘
//!                                                       │
//!                                                  RelayServer
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{info, warn};

use relay_core::{
    AppState, InMemoryMessageStore, OpenAiCompatibleBackend, RelayConfig, RelayServer, SignedTokenVerifier,
    SocketManager, StaticAgentDirectory, StreamMultiplexer,
};

/// Assemble handler state from configuration
pub fn build_state(config: &RelayConfig) -> Result<AppState> {
    let backend = OpenAiCompatibleBackend::new(config.upstream.clone())
        .context("Failed to create upstream client")?;
    if config.upstream.api_key.is_empty() {
        warn!(base_url = %config.upstream.base_url, "No upstream API key configured");
    }

    let multiplexer = StreamMultiplexer::new(
        Arc::new(backend),
        Arc::new(InMemoryMessageStore::new()),
        Arc::new(StaticAgentDirectory::new()),
        config.multiplexer(),
    );
    let sockets = SocketManager::new(multiplexer.clone(), config.socket.clone());
    let verifier = Arc::new(SignedTokenVerifier::new(config.auth.token_secret.as_bytes()));

    Ok(AppState::new(multiplexer, verifier, sockets).with_keep_alive(config.server.keep_alive()))
}

/// Serve until a shutdown signal
pub async fn serve(config: RelayConfig) -> Result<()> {
    config.validate().context("Configuration is invalid")?;

    let state = build_state(&config)?;
    let server = RelayServer::bind(&config.server.bind, state)
        .await
        .with_context(|| format!("Failed to listen on {}", config.server.bind))?;

    info!(
        addr = %server.local_addr().context("Listener has no address")?,
        model = %config.upstream.default_model,
        heartbeat_ms = config.socket.heartbeat.interval_ms,
        "Relay daemon ready"
    );

    server.run(shutdown_signal()).await.context("Server failed")?;
    info!("Relay daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C"),
        () = terminate => info!("Received SIGTERM"),
    }
}
