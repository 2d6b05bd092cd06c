//! Unified client event model
//!
//! Both transports decode into [`ClientEvent`], so reconstruction is written
//! once. Socket messages carry a generation id and are filtered per turn.

use crate::messages::{GenerationId, MessageId};
use crate::transport::websocket::ServerMessage;
use crate::transport::WireEvent;

/// One event of a streamed response, transport-agnostic
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientEvent {
    /// Next delta
    Chunk {
        /// Delta text
        content: String,
    },
    /// Response complete
    Done {
        /// Durable message id
        message_id: MessageId,
        /// Server-side full text, when sent
        content: Option<String>,
    },
    /// Response failed
    Error {
        /// Human-readable message
        message: String,
        /// Stable error code, when sent
        code: Option<String>,
    },
}

impl ClientEvent {
    /// Whether nothing may follow this event
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Chunk { .. })
    }

    /// Adapt a socket message belonging to `generation`
    ///
    /// Returns `None` for messages that are not about that generation or
    /// carry no stream content (`connected`, `pong`, `message_start`).
    pub fn from_server_message(message: ServerMessage, generation: &GenerationId) -> Option<Self> {
        match message {
            ServerMessage::Chunk {
                message_id,
                content,
            } if &message_id == generation => Some(Self::Chunk { content }),
            ServerMessage::MessageDone {
                message_id,
                content,
                generation_id,
                ..
            } if generation_id.as_ref().map_or(true, |g| g == generation) => Some(Self::Done {
                message_id,
                content: Some(content),
            }),
            ServerMessage::Error {
                message,
                code,
                message_id,
            } if message_id.as_ref().map_or(true, |g| g == generation) => {
                Some(Self::Error { message, code })
            }
            _ => None,
        }
    }
}

impl From<WireEvent> for ClientEvent {
    fn from(event: WireEvent) -> Self {
        match event {
            WireEvent::Chunk { content } => Self::Chunk { content },
            WireEvent::Done {
                message_id,
                content,
                ..
            } => Self::Done {
                message_id,
                content: (!content.is_empty()).then_some(content),
            },
            WireEvent::Error { message, code } => Self::Error { message, code },
        }
    }
}
