//! Full-Duplex Socket Transport
//!
//! `GET /ws?token=…` upgrades to a WebSocket carrying the JSON protocol in
//! [`protocol`]. The handshake verifies the token before anything else; a
//! rejected token closes the socket with code 4001.
//!
//! # Components
//!
//! - [`protocol`]: inbound/outbound message types and close codes
//! - [`registry`]: open connections, liveness timestamps, write handles
//! - [`manager`]: reader/writer tasks, generation forwarding, lifecycle

pub mod manager;
pub mod protocol;
pub mod registry;

use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use serde::Deserialize;

pub use manager::{SocketConfig, SocketManager};
pub use protocol::{
    ClientMessage, ServerMessage, CLOSE_AUTH_FAILED, CLOSE_GOING_AWAY, CLOSE_HEARTBEAT_TIMEOUT,
    CLOSE_NORMAL,
};
pub use registry::{ConnectionId, ConnectionRegistry, RegistryStats, SocketConnection};

use super::AppState;
use crate::auth::bearer_token;

/// Query string of the upgrade request
#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    /// Signed bearer token
    pub token: Option<String>,
}

/// Upgrade handler for `GET /ws`
///
/// The token comes from `?token=` or, failing that, an `Authorization`
/// header.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let token = query.token.or_else(|| {
        headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(bearer_token)
            .map(str::to_string)
    });
    let verified = state.verifier.verify(token.as_deref().unwrap_or_default());
    let sockets = state.sockets.clone();

    ws.max_message_size(sockets.config().max_message_bytes)
        .on_upgrade(move |socket| async move {
            match verified {
                Ok(identity) => sockets.serve(socket, identity).await,
                Err(e) => SocketManager::reject(socket, &e).await,
            }
        })
}
