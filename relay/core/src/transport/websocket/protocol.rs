//! Socket Wire Protocol
//!
//! JSON text frames discriminated by `"type"`; field names are camelCase.
//!
//! ```text
//! client → server                      server → client
//! ───────────────                      ───────────────
//! send_message {sessionId, content,    connected {connectionId}
//!   agentId?, modelOverride?,          message_start {messageId, agentId}
//!   contextData?}                      chunk {messageId, content}
//! ping                                 message_done {messageId, content,
//! cancel {messageId}                     chunkCount, generationId?}
//!                                      error {message, code?, messageId?}
//!                                      pong
//! ```
//!
//! `message_start`, `chunk` and `cancel` carry the generation id as
//! `messageId`; `message_done.messageId` is the durable id and
//! `generationId` links the two.
//!
//! Every `message_start` is answered by exactly one `message_done` or
//! `error` while the connection stays open, unless the client cancels it. A
//! response replaced by a newer send to the same session and agent ends
//! with `error` coded `superseded`.

use serde::{Deserialize, Serialize};

use crate::messages::{AgentId, GenerationId, MessageId, SessionId};

/// Close code sent when the handshake token is rejected
pub const CLOSE_AUTH_FAILED: u16 = 4001;

/// Close code sent when a connection misses its heartbeat window
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4008;

/// Normal closure
pub const CLOSE_NORMAL: u16 = 1000;

/// Server going away (shutdown)
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Inbound control message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start a turn
    #[serde(rename_all = "camelCase")]
    SendMessage {
        /// Target session
        session_id: SessionId,
        /// User text
        content: String,
        /// Target agent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<AgentId>,
        /// Model override
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model_override: Option<String>,
        /// Extra prompt context
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context_data: Option<serde_json::Value>,
    },
    /// Application-level liveness probe
    Ping,
    /// Stop a running generation
    #[serde(rename_all = "camelCase")]
    Cancel {
        /// Generation id from `message_start`
        message_id: GenerationId,
    },
}

/// Outbound message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake accepted
    #[serde(rename_all = "camelCase")]
    Connected {
        /// Registry id of this connection
        connection_id: String,
    },
    /// A generation started
    #[serde(rename_all = "camelCase")]
    MessageStart {
        /// Generation id
        message_id: GenerationId,
        /// Resolved agent
        agent_id: AgentId,
    },
    /// Next delta of a generation
    #[serde(rename_all = "camelCase")]
    Chunk {
        /// Generation id
        message_id: GenerationId,
        /// Delta text
        content: String,
    },
    /// Generation persisted
    #[serde(rename_all = "camelCase")]
    MessageDone {
        /// Durable message id
        message_id: MessageId,
        /// Full text
        content: String,
        /// Number of chunks sent
        chunk_count: u32,
        /// Generation this message completes
        #[serde(default, skip_serializing_if = "Option::is_none")]
        generation_id: Option<GenerationId>,
    },
    /// Failure scoped to a request or generation
    #[serde(rename_all = "camelCase")]
    Error {
        /// Human-readable message
        message: String,
        /// Stable error code
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        /// Generation the error belongs to
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<GenerationId>,
    },
    /// Reply to `ping`
    Pong,
}

impl ServerMessage {
    /// Error without a generation
    pub fn error(message: impl Into<String>, code: &str) -> Self {
        Self::Error {
            message: message.into(),
            code: Some(code.to_string()),
            message_id: None,
        }
    }
}
