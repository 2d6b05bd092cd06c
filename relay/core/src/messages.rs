//! Chat Messages and Identifiers
//!
//! Identifier newtypes and the `ChatMessage` record shared by the server
//! pipeline and the client reconstructor.
//!
//! # Provisional vs durable ids
//!
//! A client mints a provisional [`MessageId`] (`tmp_…`) the moment a user
//! presses send so the UI can render optimistically. The server assigns the
//! durable id when the assistant message is committed to the store; the
//! terminal event carries it and the client rewrites the record in place.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message identifier (provisional or durable)
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

/// Prefix marking client-minted ids
const PROVISIONAL_PREFIX: &str = "tmp_";

impl MessageId {
    /// Mint a durable id (used by stores)
    #[must_use]
    pub fn durable() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Mint a client-side provisional id
    #[must_use]
    pub fn provisional() -> Self {
        Self(format!("{PROVISIONAL_PREFIX}{}", uuid::Uuid::new_v4().simple()))
    }

    /// Whether this id was minted client-side and not yet confirmed
    #[must_use]
    pub fn is_provisional(&self) -> bool {
        self.0.starts_with(PROVISIONAL_PREFIX)
    }

    /// Borrow the raw string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Chat session identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a new session id
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Mint a client-side provisional session id
    #[must_use]
    pub fn provisional() -> Self {
        Self(format!("{PROVISIONAL_PREFIX}{}", uuid::Uuid::new_v4().simple()))
    }

    /// Borrow the raw string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Agent identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    /// Borrow the raw string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of one server-side generation
///
/// Used by the socket protocol (`message_start`, `chunk`, `cancel`) before a
/// durable message id exists.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenerationId(pub String);

impl GenerationId {
    /// Generate a new generation id
    #[must_use]
    pub fn new() -> Self {
        Self(format!("gen_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Borrow the raw string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for GenerationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Role of a message author
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// The human user
    User,
    /// The model
    Assistant,
    /// System instruction
    System,
}

impl MessageRole {
    /// Wire name used by chat-completion APIs
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

/// User feedback on an assistant message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feedback {
    /// Thumbs up
    Positive,
    /// Thumbs down
    Negative,
}

/// A chat message as stored and as rendered
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Provisional until the terminal event supplies the durable id
    pub id: MessageId,
    /// Owning session
    pub session_id: SessionId,
    /// Author role
    pub role: MessageRole,
    /// Message text
    pub content: String,
    /// Whether deltas are still arriving
    pub is_streaming: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Generation cost, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    /// User feedback
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<Feedback>,
    /// Suggested follow-up prompts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow_ups: Option<Vec<String>>,
    /// Error shown alongside any partial content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChatMessage {
    /// Create a complete message
    pub fn new(id: MessageId, session_id: SessionId, role: MessageRole, content: String) -> Self {
        Self {
            id,
            session_id,
            role,
            content,
            is_streaming: false,
            created_at: Utc::now(),
            cost: None,
            feedback: None,
            follow_ups: None,
            error: None,
        }
    }

    /// Create an empty assistant message that will receive deltas
    pub fn streaming(id: MessageId, session_id: SessionId) -> Self {
        Self {
            is_streaming: true,
            ..Self::new(id, session_id, MessageRole::Assistant, String::new())
        }
    }

    /// Append text to the message
    pub fn append(&mut self, text: &str) {
        self.content.push_str(text);
    }

    /// Mark streaming as complete
    pub fn complete(&mut self) {
        self.is_streaming = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provisional_ids_are_marked() {
        let id = MessageId::provisional();
        assert!(id.is_provisional());
        assert!(!MessageId::durable().is_provisional());
        assert_ne!(MessageId::provisional(), id);
    }

    #[test]
    fn test_chat_message_serializes_camel_case() {
        let msg = ChatMessage::streaming(MessageId::from("tmp_1"), SessionId::from("s1"));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["sessionId"], "s1");
        assert_eq!(json["isStreaming"], true);
        assert_eq!(json["role"], "assistant");
        assert!(json.get("followUps").is_none());
    }

    #[test]
    fn test_append_and_complete() {
        let mut msg = ChatMessage::streaming(MessageId::from("tmp_1"), SessionId::from("s1"));
        msg.append("Hi");
        msg.append(" there");
        msg.complete();
        assert_eq!(msg.content, "Hi there");
        assert!(!msg.is_streaming);
    }
}
