//! Client Side
//!
//! Everything a UI needs to render streamed responses:
//!
//! - [`events`]: the transport-agnostic [`ClientEvent`]
//! - [`reconstructor`]: coalesced rendering with id reconciliation
//! - [`driver`]: the one [`drive`] loop over any [`EventSource`]
//! - [`http_client`] / [`socket_client`]: sources for both transports
//! - [`retry`]: session-race resend and reconnection backoff
//!
//! # Example
//!
//! ```ignore
//! let client = HttpStreamClient::new("http://127.0.0.1:8080", token)?;
//! let reconstructor = Mutex::new(StreamReconstructor::default());
//! let id = reconstructor.lock().begin(session.clone(), agent, Instant::now());
//! let mut source = SessionRaceResolver::default().send(&client, &slot, request).await?;
//! let outcome = drive(&mut source, &reconstructor, id, stop, |repaint| render(repaint)).await;
//! ```

pub mod driver;
pub mod events;
pub mod http_client;
pub mod reconstructor;
pub mod retry;
pub mod socket_client;
pub mod source;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use driver::{drive, DriveOutcome, DriveStatus};
pub use events::ClientEvent;
pub use http_client::{HttpEventSource, HttpStreamClient};
pub use reconstructor::{ReconstructorConfig, Repaint, StreamReconstructor};
pub use retry::{
    ChatApi, ConnectionStatus, ReconnectPolicy, SessionBinding, SessionRaceResolver, SessionSlot,
};
pub use socket_client::{SocketClient, SocketConnector, SocketEventSource};
pub use source::{ChannelSource, EventSource};

/// Client settings (`[client]` section)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Rendering throttle
    #[serde(flatten)]
    pub reconstructor: ReconstructorConfig,
    /// How long a send waits for an unconfirmed session
    pub confirm_wait_ms: u64,
    /// Handshake and send reply timeout for sockets
    pub reply_timeout_ms: u64,
    /// Socket reconnection
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reconstructor: ReconstructorConfig::default(),
            confirm_wait_ms: 1_500,
            reply_timeout_ms: 10_000,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Resolver configured with `confirm_wait_ms`
    #[must_use]
    pub fn resolver(&self) -> SessionRaceResolver {
        SessionRaceResolver::new(Duration::from_millis(self.confirm_wait_ms))
    }

    /// Connector for `url` configured with the reconnect policy
    #[must_use]
    pub fn connector(&self, url: impl Into<String>, token: impl Into<String>) -> SocketConnector {
        SocketConnector::new(url, token, self.reconnect.clone())
            .with_reply_timeout(Duration::from_millis(self.reply_timeout_ms))
    }
}
