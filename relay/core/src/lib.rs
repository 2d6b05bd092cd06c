//! Relay Core - Real-Time Token Streaming for tokenrelay
//!
//! This crate carries model output from an upstream provider to end users
//! as it is generated, over two transports, and rebuilds it on the client.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     Upstream provider (SSE)                      │
//! └───────────────────────────────┬──────────────────────────────────┘
//!                                 │ bytes
//! ┌───────────────────────────────┴──────────────────────────────────┐
//! │  backend: SseDecoder ─► OpenAiCompatibleBackend ─► DeltaStream   │
//! │                                 │                                │
//! │  streaming: StreamMultiplexer + GenerationSession (accumulator)  │
//! │             persist user ─► stream ─► persist assistant ─► done  │
//! │                                 │ TurnEvent                      │
//! │  transport:  POST /api/chat/send (SSE)   GET /ws (WebSocket)     │
//! └───────────────────────────────┬──────────────────────────────────┘
//!                                 │ wire events
//! ┌───────────────────────────────┴──────────────────────────────────┐
//! │  client: HttpStreamClient / SocketClient ─► ClientEvent          │
//! │          drive() ─► StreamReconstructor ─► Repaint               │
//! │          SessionRaceResolver, ReconnectPolicy                    │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Overview
//!
//! - [`backend`]: upstream provider client and the incremental SSE decoder
//! - [`session`]: per-generation state machine and accumulator
//! - [`streaming`]: turn orchestration across store, agents and upstream
//! - [`transport`]: axum router, SSE and WebSocket transports, heartbeat
//! - [`client`]: reconstruction, transport clients, retry/resume
//! - [`store`] / [`auth`]: collaborator traits with reference implementations
//! - [`config`]: TOML + environment configuration
//! - [`messages`] / [`error`]: shared types

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod messages;
pub mod session;
pub mod store;
pub mod streaming;
pub mod transport;

// Re-export main types for convenience
pub use auth::{Identity, IdentityVerifier, SignedTokenVerifier};
pub use backend::{
    OpenAiCompatibleBackend, ProviderConfig, SseDecoder, SseRecord, UpstreamBackend, UpstreamRequest,
};
pub use client::{
    drive, ChatApi, ClientConfig, ClientEvent, ConnectionStatus, DriveOutcome, DriveStatus, EventSource,
    HttpStreamClient, ReconnectPolicy, Repaint, SessionRaceResolver, SessionSlot, SocketClient,
    SocketConnector, StreamReconstructor,
};
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides, ConfigSource,
    RelayConfig,
};
pub use error::{
    AuthError, ClientError, NotFound, ParseError, RelayError, SendError, StoreError, TransportError,
    UpstreamError,
};
pub use messages::{AgentId, ChatMessage, GenerationId, MessageId, MessageRole, SessionId};
pub use session::{GenerationSession, GenerationState};
pub use store::{Agent, AgentDirectory, InMemoryMessageStore, MessageStore, StaticAgentDirectory};
pub use streaming::{MultiplexerConfig, StreamMultiplexer, TurnEvent, TurnHandle, TurnRequest};
pub use transport::{router, AppState, HeartbeatConfig, RelayServer, SocketConfig, SocketManager};
