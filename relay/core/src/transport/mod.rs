//! Transport Layer
//!
//! Two client-facing transports share one [`StreamMultiplexer`]:
//! - [`http`]: `POST /api/chat/send`, one SSE response per turn, plus
//!   `POST /api/sessions`
//! - [`websocket`]: `GET /ws`, a long-lived socket carrying many turns
//!
//! Both authenticate through the same [`IdentityVerifier`] and map failures
//! to the same error codes. [`router`] assembles the axum application.

pub mod heartbeat;
pub mod http;
mod server;
pub mod websocket;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

pub use heartbeat::{HeartbeatConfig, HeartbeatTask};
pub use http::{ApiError, ErrorBody, SendRequest, SessionCreated, WireEvent};
pub use server::RelayServer;
pub use websocket::{SocketConfig, SocketManager};

use crate::auth::IdentityVerifier;
use crate::streaming::StreamMultiplexer;

/// Shared state of every handler
#[derive(Clone)]
pub struct AppState {
    /// Turn orchestration
    pub multiplexer: StreamMultiplexer,
    /// Token verification
    pub verifier: Arc<dyn IdentityVerifier>,
    /// Socket connections
    pub sockets: SocketManager,
    /// Idle interval between SSE keep-alive comments
    pub keep_alive: Duration,
}

impl AppState {
    /// Assemble handler state
    pub fn new(
        multiplexer: StreamMultiplexer,
        verifier: Arc<dyn IdentityVerifier>,
        sockets: SocketManager,
    ) -> Self {
        Self {
            multiplexer,
            verifier,
            sockets,
            keep_alive: Duration::from_secs(15),
        }
    }

    /// Set the SSE keep-alive interval
    #[must_use]
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }
}

/// Body of `GET /health`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Always `"ok"` when the server answers
    pub status: String,
    /// Open socket connections
    pub connections: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok".to_string(),
        connections: state.sockets.connection_count(),
    })
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat/send", post(http::send_message))
        .route("/api/sessions", post(http::create_session))
        .route("/ws", get(websocket::ws_handler))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
