//! Client Stream Reconstructor
//!
//! Rebuilds rendered messages from streamed deltas.
//!
//! Each in-flight response is tracked under a client-minted provisional id
//! until its terminal event supplies the durable one. Deltas are coalesced:
//! at most one [`Repaint`] per `repaint_interval`, with everything pending
//! flushed on the terminal event so the final text is exactly the
//! concatenation of the deltas received.
//!
//! The reconstructor is a plain state machine driven with explicit
//! timestamps; [`super::drive`] feeds it from a live source.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::events::ClientEvent;
use crate::messages::{AgentId, ChatMessage, MessageId, MessageRole, SessionId};

/// Error shown when a stream ends without a terminal event
pub const INCOMPLETE_MESSAGE: &str = "Response was interrupted before it finished";

/// Reconstructor tuning
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconstructorConfig {
    /// Minimum time between repaints of one message
    pub repaint_interval_ms: u64,
}

impl Default for ReconstructorConfig {
    fn default() -> Self {
        Self {
            repaint_interval_ms: 33, // ~30 FPS
        }
    }
}

impl ReconstructorConfig {
    /// Repaint interval as a [`Duration`]
    #[must_use]
    pub fn repaint_interval(&self) -> Duration {
        Duration::from_millis(self.repaint_interval_ms)
    }
}

/// Snapshot of a message that needs rendering
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Repaint {
    /// Current id of the message
    pub id: MessageId,
    /// Provisional id this message was tracked under, set once on reconciliation
    pub replaced_id: Option<MessageId>,
    /// Full text so far
    pub content: String,
    /// Whether more deltas may arrive
    pub is_streaming: bool,
    /// Error to show next to the content
    pub error: Option<String>,
}

#[derive(Debug)]
struct TrackedMessage {
    message: ChatMessage,
    agent_id: Option<AgentId>,
    pending: String,
    last_paint: Option<Instant>,
}

impl TrackedMessage {
    fn flush(&mut self, now: Instant) {
        if !self.pending.is_empty() {
            let pending = std::mem::take(&mut self.pending);
            self.message.append(&pending);
        }
        self.last_paint = Some(now);
    }

    fn is_due(&self, now: Instant, interval: Duration) -> bool {
        match self.last_paint {
            Some(last) => now.duration_since(last) >= interval,
            None => true,
        }
    }

    fn snapshot(&self, replaced_id: Option<MessageId>) -> Repaint {
        Repaint {
            id: self.message.id.clone(),
            replaced_id,
            content: self.message.content.clone(),
            is_streaming: self.message.is_streaming,
            error: self.message.error.clone(),
        }
    }

    fn freeze(&mut self, now: Instant) -> Repaint {
        self.flush(now);
        self.message.complete();
        self.snapshot(None)
    }
}

/// Rendered conversation state fed by streamed events
#[derive(Debug, Default)]
pub struct StreamReconstructor {
    config: ReconstructorConfig,
    messages: Vec<TrackedMessage>,
}

impl StreamReconstructor {
    /// Create an empty reconstructor
    #[must_use]
    pub fn new(config: ReconstructorConfig) -> Self {
        Self {
            config,
            messages: Vec::new(),
        }
    }

    /// Current configuration
    #[must_use]
    pub fn config(&self) -> &ReconstructorConfig {
        &self.config
    }

    /// Show the user's own message immediately
    pub fn push_user_message(&mut self, session_id: SessionId, content: &str) -> MessageId {
        let id = MessageId::provisional();
        self.messages.push(TrackedMessage {
            message: ChatMessage::new(id.clone(), session_id, MessageRole::User, content.to_string()),
            agent_id: None,
            pending: String::new(),
            last_paint: None,
        });
        id
    }

    /// Start tracking a new response for `(session_id, agent_id)`
    ///
    /// Any response still streaming for the same pair is frozen first.
    /// Returns the provisional id to feed events under.
    pub fn begin(&mut self, session_id: SessionId, agent_id: AgentId, now: Instant) -> MessageId {
        for tracked in &mut self.messages {
            if tracked.message.is_streaming
                && tracked.message.session_id == session_id
                && tracked.agent_id.as_ref() == Some(&agent_id)
            {
                tracing::debug!(
                    message_id = %tracked.message.id,
                    agent_id = %agent_id,
                    "Freezing superseded response"
                );
                tracked.freeze(now);
            }
        }

        let id = MessageId::provisional();
        self.messages.push(TrackedMessage {
            message: ChatMessage::streaming(id.clone(), session_id),
            agent_id: Some(agent_id),
            pending: String::new(),
            last_paint: None,
        });
        id
    }

    /// Apply one event to the message tracked as `id`
    ///
    /// Returns a repaint when the message should be re-rendered. Events for
    /// unknown or finished messages are ignored.
    pub fn apply(&mut self, id: &MessageId, event: ClientEvent, now: Instant) -> Option<Repaint> {
        let interval = self.config.repaint_interval();
        let tracked = self.streaming_mut(id)?;

        match event {
            ClientEvent::Chunk { content } => {
                tracked.pending.push_str(&content);
                if tracked.is_due(now, interval) {
                    tracked.flush(now);
                    Some(tracked.snapshot(None))
                } else {
                    None
                }
            }
            ClientEvent::Done {
                message_id,
                content,
            } => {
                tracked.flush(now);
                if tracked.message.content.is_empty() {
                    if let Some(content) = content {
                        tracked.message.content = content;
                    }
                }
                let replaced = std::mem::replace(&mut tracked.message.id, message_id);
                tracked.message.complete();
                Some(tracked.snapshot(Some(replaced)))
            }
            ClientEvent::Error { message, .. } => {
                tracked.message.error = Some(message);
                Some(tracked.freeze(now))
            }
        }
    }

    /// Flush every streaming message whose interval has elapsed
    pub fn flush_due(&mut self, now: Instant) -> Vec<Repaint> {
        let interval = self.config.repaint_interval();
        self.messages
            .iter_mut()
            .filter(|t| t.message.is_streaming && !t.pending.is_empty() && t.is_due(now, interval))
            .map(|t| {
                t.flush(now);
                t.snapshot(None)
            })
            .collect()
    }

    /// Stop a response locally, keeping what arrived
    pub fn cancel(&mut self, id: &MessageId, now: Instant) -> Option<Repaint> {
        self.streaming_mut(id).map(|t| t.freeze(now))
    }

    /// Mark a response as failed with `error`
    pub fn fail(&mut self, id: &MessageId, error: &str, now: Instant) -> Option<Repaint> {
        let tracked = self.streaming_mut(id)?;
        tracked.message.error = Some(error.to_string());
        Some(tracked.freeze(now))
    }

    /// The source ended; finalize `id` if no terminal event arrived
    pub fn end_of_stream(&mut self, id: &MessageId, now: Instant) -> Option<Repaint> {
        self.fail(id, INCOMPLETE_MESSAGE, now)
    }

    /// Message currently tracked as `id`
    #[must_use]
    pub fn message(&self, id: &MessageId) -> Option<&ChatMessage> {
        self.messages.iter().map(|t| &t.message).find(|m| &m.id == id)
    }

    /// All messages in display order
    pub fn messages(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter().map(|t| &t.message)
    }

    /// Number of responses still streaming
    #[must_use]
    pub fn streaming_count(&self) -> usize {
        self.messages.iter().filter(|t| t.message.is_streaming).count()
    }

    fn streaming_mut(&mut self, id: &MessageId) -> Option<&mut TrackedMessage> {
        self.messages
            .iter_mut()
            .find(|t| &t.message.id == id && t.message.is_streaming)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn chunk(text: &str) -> ClientEvent {
        ClientEvent::Chunk {
            content: text.to_string(),
        }
    }

    fn done(id: &str) -> ClientEvent {
        ClientEvent::Done {
            message_id: MessageId::from(id),
            content: None,
        }
    }

    fn reconstructor(interval_ms: u64) -> StreamReconstructor {
        StreamReconstructor::new(ReconstructorConfig {
            repaint_interval_ms: interval_ms,
        })
    }

    #[test]
    fn test_first_chunk_paints_then_throttles() {
        let mut r = reconstructor(100);
        let t0 = Instant::now();
        let id = r.begin(SessionId::from("s"), AgentId::from("a"), t0);

        let first = r.apply(&id, chunk("Hi"), t0).unwrap();
        assert_eq!(first.content, "Hi");
        assert!(r.apply(&id, chunk(" the"), t0 + Duration::from_millis(10)).is_none());
        assert!(r.apply(&id, chunk("re"), t0 + Duration::from_millis(20)).is_none());

        let later = r.apply(&id, chunk("!"), t0 + Duration::from_millis(120)).unwrap();
        assert_eq!(later.content, "Hi there!");
    }

    #[test]
    fn test_terminal_flushes_and_reconciles_id() {
        let mut r = reconstructor(1_000);
        let t0 = Instant::now();
        let id = r.begin(SessionId::from("s"), AgentId::from("a"), t0);
        assert!(id.is_provisional());

        r.apply(&id, chunk("Hi"), t0);
        r.apply(&id, chunk(" there"), t0);
        let repaint = r.apply(&id, done("durable-1"), t0).unwrap();

        assert_eq!(repaint.id, MessageId::from("durable-1"));
        assert_eq!(repaint.replaced_id, Some(id.clone()));
        assert_eq!(repaint.content, "Hi there");
        assert!(!repaint.is_streaming);
        assert!(r.message(&id).is_none());
        assert_eq!(r.message(&MessageId::from("durable-1")).unwrap().content, "Hi there");
    }

    #[test]
    fn test_events_after_terminal_are_ignored() {
        let mut r = reconstructor(0);
        let t0 = Instant::now();
        let id = r.begin(SessionId::from("s"), AgentId::from("a"), t0);
        r.apply(&id, done("m"), t0);
        assert!(r.apply(&MessageId::from("m"), chunk("late"), t0).is_none());
        assert_eq!(r.message(&MessageId::from("m")).unwrap().content, "");
    }

    #[test]
    fn test_flush_due_paints_quiet_tail() {
        let mut r = reconstructor(50);
        let t0 = Instant::now();
        let id = r.begin(SessionId::from("s"), AgentId::from("a"), t0);
        r.apply(&id, chunk("a"), t0);
        r.apply(&id, chunk("b"), t0 + Duration::from_millis(5));

        assert!(r.flush_due(t0 + Duration::from_millis(10)).is_empty());
        let repaints = r.flush_due(t0 + Duration::from_millis(60));
        assert_eq!(repaints.len(), 1);
        assert_eq!(repaints[0].content, "ab");
        assert!(r.flush_due(t0 + Duration::from_millis(200)).is_empty());
    }

    #[test]
    fn test_error_keeps_partial_content() {
        let mut r = reconstructor(1_000);
        let t0 = Instant::now();
        let id = r.begin(SessionId::from("s"), AgentId::from("a"), t0);
        r.apply(&id, chunk("par"), t0);
        r.apply(&id, chunk("tial"), t0);
        let repaint = r
            .apply(
                &id,
                ClientEvent::Error {
                    message: "upstream timed out".to_string(),
                    code: Some("upstream_timeout".to_string()),
                },
                t0,
            )
            .unwrap();
        assert_eq!(repaint.content, "partial");
        assert_eq!(repaint.error.as_deref(), Some("upstream timed out"));
        assert!(!repaint.is_streaming);
    }

    #[test]
    fn test_end_without_terminal_is_visible_error() {
        let mut r = reconstructor(0);
        let t0 = Instant::now();
        let id = r.begin(SessionId::from("s"), AgentId::from("a"), t0);
        r.apply(&id, chunk("half"), t0);
        let repaint = r.end_of_stream(&id, t0).unwrap();
        assert_eq!(repaint.error.as_deref(), Some(INCOMPLETE_MESSAGE));
        assert_eq!(r.streaming_count(), 0);
    }

    #[test]
    fn test_new_generation_freezes_prior_for_same_pair() {
        let mut r = reconstructor(1_000);
        let t0 = Instant::now();
        let session = SessionId::from("s");
        let first = r.begin(session.clone(), AgentId::from("a"), t0);
        let other_agent = r.begin(session.clone(), AgentId::from("b"), t0);
        r.apply(&first, chunk("one"), t0);
        r.apply(&first, chunk(" more"), t0);

        let second = r.begin(session, AgentId::from("a"), t0);
        let frozen = r.message(&first).unwrap();
        assert!(!frozen.is_streaming);
        assert_eq!(frozen.content, "one more");
        assert!(r.message(&other_agent).unwrap().is_streaming);
        assert!(r.message(&second).unwrap().is_streaming);
    }

    #[test]
    fn test_cancel_freezes_without_error() {
        let mut r = reconstructor(1_000);
        let t0 = Instant::now();
        let id = r.begin(SessionId::from("s"), AgentId::from("a"), t0);
        r.apply(&id, chunk("x"), t0);
        r.apply(&id, chunk("y"), t0);
        let repaint = r.cancel(&id, t0).unwrap();
        assert_eq!(repaint.content, "xy");
        assert_eq!(repaint.error, None);
        assert!(r.cancel(&id, t0).is_none());
    }

    #[test]
    fn test_user_message_is_rendered_complete() {
        let mut r = reconstructor(0);
        let id = r.push_user_message(SessionId::from("s"), "hello");
        let message = r.message(&id).unwrap();
        assert_eq!(message.role, MessageRole::User);
        assert!(!message.is_streaming);
        assert_eq!(r.messages().count(), 1);
    }
}
