//! Generation Sessions
//!
//! Per-turn state for one assistant generation: target identifiers, the
//! prompt, the text accumulator, the cancellation handle, and the lifecycle
//! state.
//!
//! # Lifecycle
//!
//! ```text
//! Connecting ──► Streaming ──► Finalizing ──► Done
//!     │              │              │
//!     ├──────────────┴──────────────┴──► Errored
//!     └──────────────┴──────────────┴──► Cancelled
//! ```
//!
//! `Done`, `Errored` and `Cancelled` are terminal and absorbing. The
//! multiplexer task owns the session exclusively; the accumulator has a
//! single writer, [`GenerationSession::push_delta`].

use std::fmt;

use tokio_util::sync::CancellationToken;

use crate::messages::{AgentId, GenerationId, SessionId};

/// Lifecycle state of a generation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GenerationState {
    /// Upstream request in flight, no delta yet
    Connecting,
    /// Deltas are arriving
    Streaming,
    /// Upstream finished, output being persisted
    Finalizing,
    /// Output persisted and terminal event sent
    Done,
    /// Terminated by a failure
    Errored,
    /// Terminated by a cancel or a superseding send
    Cancelled,
}

impl GenerationState {
    /// Whether no further transition is possible
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Errored | Self::Cancelled)
    }

    /// Whether `self -> next` is a legal transition
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use GenerationState::{Cancelled, Connecting, Done, Errored, Finalizing, Streaming};
        match (self, next) {
            (Connecting, Streaming | Finalizing) => true,
            (Streaming, Finalizing) => true,
            (Finalizing, Done) => true,
            (from, Errored | Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for GenerationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Finalizing => "finalizing",
            Self::Done => "done",
            Self::Errored => "errored",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Rejected state transition
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid generation transition {from} -> {to}")]
pub struct InvalidTransition {
    /// State before the attempted transition
    pub from: GenerationState,
    /// Requested state
    pub to: GenerationState,
}

/// State of one in-flight generation
#[derive(Debug)]
pub struct GenerationSession {
    session_id: SessionId,
    agent_id: AgentId,
    generation_id: GenerationId,
    prompt: String,
    accumulator: String,
    chunk_count: u32,
    cancel: CancellationToken,
    state: GenerationState,
}

impl GenerationSession {
    /// Create a session in the `Connecting` state
    pub fn new(
        session_id: SessionId,
        agent_id: AgentId,
        generation_id: GenerationId,
        prompt: String,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            agent_id,
            generation_id,
            prompt,
            accumulator: String::new(),
            chunk_count: 0,
            cancel,
            state: GenerationState::Connecting,
        }
    }

    /// Owning chat session
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Target agent
    #[must_use]
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Generation identifier
    #[must_use]
    pub fn generation_id(&self) -> &GenerationId {
        &self.generation_id
    }

    /// Final prompt sent upstream
    #[must_use]
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// Text received so far
    #[must_use]
    pub fn accumulated(&self) -> &str {
        &self.accumulator
    }

    /// Number of deltas received
    #[must_use]
    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> GenerationState {
        self.state
    }

    /// Cancellation handle shared with the upstream stream
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether cancellation was requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Append a delta, moving `Connecting` to `Streaming` on the first one
    ///
    /// # Errors
    ///
    /// Fails if the session is no longer accepting deltas.
    pub fn push_delta(&mut self, delta: &str) -> Result<(), InvalidTransition> {
        match self.state {
            GenerationState::Connecting => self.transition(GenerationState::Streaming)?,
            GenerationState::Streaming => {}
            other => {
                return Err(InvalidTransition {
                    from: other,
                    to: GenerationState::Streaming,
                })
            }
        }
        self.accumulator.push_str(delta);
        self.chunk_count += 1;
        Ok(())
    }

    /// Move to `next` if legal
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] for illegal moves; the state is unchanged.
    pub fn transition(&mut self, next: GenerationState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::trace!(
            generation_id = %self.generation_id,
            from = %self.state,
            to = %next,
            "Generation state transition"
        );
        self.state = next;
        Ok(())
    }

    /// Hand the accumulated text to the store, leaving the accumulator empty
    pub fn take_accumulated(&mut self) -> String {
        std::mem::take(&mut self.accumulator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> GenerationSession {
        GenerationSession::new(
            SessionId::from("s1"),
            AgentId::from("a1"),
            GenerationId::new(),
            "Hello".to_string(),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_happy_path() {
        let mut s = session();
        assert_eq!(s.state(), GenerationState::Connecting);
        s.push_delta("Hi").unwrap();
        s.push_delta(" there").unwrap();
        assert_eq!(s.state(), GenerationState::Streaming);
        assert_eq!(s.accumulated(), "Hi there");
        assert_eq!(s.chunk_count(), 2);

        s.transition(GenerationState::Finalizing).unwrap();
        s.transition(GenerationState::Done).unwrap();
        assert!(s.state().is_terminal());
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        for terminal in [
            GenerationState::Done,
            GenerationState::Errored,
            GenerationState::Cancelled,
        ] {
            for next in [
                GenerationState::Connecting,
                GenerationState::Streaming,
                GenerationState::Finalizing,
                GenerationState::Done,
                GenerationState::Errored,
                GenerationState::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn test_no_delta_after_terminal() {
        let mut s = session();
        s.push_delta("a").unwrap();
        s.transition(GenerationState::Cancelled).unwrap();
        let err = s.push_delta("b").unwrap_err();
        assert_eq!(err.from, GenerationState::Cancelled);
        assert_eq!(s.accumulated(), "a");
    }

    #[test]
    fn test_empty_stream_can_finalize() {
        let mut s = session();
        s.transition(GenerationState::Finalizing).unwrap();
        assert!(s.transition(GenerationState::Streaming).is_err());
        s.transition(GenerationState::Done).unwrap();
    }

    #[test]
    fn test_take_accumulated() {
        let mut s = session();
        s.push_delta("abc").unwrap();
        assert_eq!(s.take_accumulated(), "abc");
        assert_eq!(s.accumulated(), "");
    }
}
