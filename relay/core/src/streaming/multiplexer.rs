//! Stream Multiplexer Implementation
//!
//! Orchestrates one chat turn from send to terminal event:
//!
//! ```text
//! start_turn ──► ownership check ──► agent lookup ──► persist user message
//!            ──► supersede prior generation ──► spawn generation task
//!
//! generation task:
//!   open upstream ──► for each delta: accumulate + forward (bounded channel)
//!                 ──► persist assistant message ──► Done ──► preview ──► follow-up
//! ```
//!
//! Forwarding never waits for persistence. A full event channel pauses
//! upstream reads. Dropping the event receiver cancels the generation.
//! A generation replaced by a newer send ends with an `Error` coded
//! `superseded`; any other cancel emits nothing further.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::backend::{UpstreamBackend, UpstreamRequest};
use crate::error::{NotFound, RelayError, UpstreamError, CODE_SUPERSEDED};
use crate::messages::{AgentId, GenerationId, MessageId, MessageRole, SessionId};
use crate::session::{GenerationSession, GenerationState};
use crate::store::{AgentDirectory, MessageStore};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the multiplexer
#[derive(Clone, Debug)]
pub struct MultiplexerConfig {
    /// Capacity of each turn's event channel
    pub channel_capacity: usize,
    /// Maximum characters kept in a session preview
    pub preview_chars: usize,
    /// Sampling temperature sent upstream
    pub temperature: f32,
    /// Maximum tokens sent upstream
    pub max_tokens: u32,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            preview_chars: 120,
            temperature: 0.7,
            max_tokens: 4096,
        }
    }
}

// ============================================================================
// Turn API
// ============================================================================

/// A user send as seen by the multiplexer
#[derive(Clone, Debug)]
pub struct TurnRequest {
    /// Authenticated caller
    pub user_id: String,
    /// Target session
    pub session_id: SessionId,
    /// User message text
    pub content: String,
    /// Target agent (`None` = directory default)
    pub agent_id: Option<AgentId>,
    /// Model to use instead of the provider default
    pub model_override: Option<String>,
    /// Extra context appended to the prompt
    pub context_data: Option<serde_json::Value>,
}

impl TurnRequest {
    /// Create a request with only the required fields
    pub fn new(user_id: impl Into<String>, session_id: SessionId, content: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id,
            content: content.into(),
            agent_id: None,
            model_override: None,
            context_data: None,
        }
    }

    /// Set the target agent
    #[must_use]
    pub fn with_agent(mut self, agent_id: AgentId) -> Self {
        self.agent_id = Some(agent_id);
        self
    }
}

/// Event of one turn, delivered in order; nothing follows `Done` or `Error`
#[derive(Clone, Debug, PartialEq)]
pub enum TurnEvent {
    /// Next text delta
    Chunk {
        /// Delta text
        content: String,
    },
    /// Assistant message persisted
    Done {
        /// Durable id of the assistant message
        message_id: MessageId,
        /// Full text (equals the concatenation of all chunks)
        content: String,
        /// Number of chunks sent
        chunk_count: u32,
    },
    /// Generation failed
    Error {
        /// Human-readable message
        message: String,
        /// Stable code (see [`RelayError::code`])
        code: &'static str,
    },
}

impl TurnEvent {
    /// Whether this event ends the turn
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Chunk { .. })
    }
}

/// Handle returned to the transport for one turn
#[derive(Debug)]
pub struct TurnHandle {
    /// Generation id
    pub generation_id: GenerationId,
    /// Resolved agent
    pub agent_id: AgentId,
    /// Ordered events
    pub events: mpsc::Receiver<TurnEvent>,
    /// Cancels the generation and aborts the upstream connection
    pub cancel: CancellationToken,
}

/// Best-effort work after a completed turn (e.g. suggested follow-ups)
#[async_trait]
pub trait FollowUpHook: Send + Sync {
    /// Called after `Done` was emitted; never delays it
    async fn on_complete(&self, session_id: &SessionId, message_id: &MessageId, content: &str);
}

// ============================================================================
// Multiplexer
// ============================================================================

type GenerationKey = (SessionId, AgentId);

#[derive(Debug)]
struct ActiveGeneration {
    generation_id: GenerationId,
    cancel: CancellationToken,
    /// Set before `cancel` when a newer send takes the slot
    superseded: CancellationToken,
}

/// Runs turns and tracks the active generation per (session, agent)
#[derive(Clone)]
pub struct StreamMultiplexer {
    backend: Arc<dyn UpstreamBackend>,
    store: Arc<dyn MessageStore>,
    agents: Arc<dyn AgentDirectory>,
    follow_up: Option<Arc<dyn FollowUpHook>>,
    active: Arc<DashMap<GenerationKey, ActiveGeneration>>,
    config: MultiplexerConfig,
}

impl StreamMultiplexer {
    /// Create a multiplexer
    pub fn new(
        backend: Arc<dyn UpstreamBackend>,
        store: Arc<dyn MessageStore>,
        agents: Arc<dyn AgentDirectory>,
        config: MultiplexerConfig,
    ) -> Self {
        Self {
            backend,
            store,
            agents,
            follow_up: None,
            active: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Install a follow-up hook
    #[must_use]
    pub fn with_follow_up(mut self, hook: Arc<dyn FollowUpHook>) -> Self {
        self.follow_up = Some(hook);
        self
    }

    /// Message store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    /// Number of running generations
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Whether a generation is running for (session, agent)
    #[must_use]
    pub fn is_active(&self, session_id: &SessionId, agent_id: &AgentId) -> bool {
        self.active
            .contains_key(&(session_id.clone(), agent_id.clone()))
    }

    /// Cancel the running generation for (session, agent), if any
    pub fn cancel(&self, session_id: &SessionId, agent_id: &AgentId) -> bool {
        match self.active.get(&(session_id.clone(), agent_id.clone())) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every running generation
    pub fn cancel_all(&self) {
        for entry in self.active.iter() {
            entry.cancel.cancel();
        }
    }

    /// Start a turn
    ///
    /// Validation, ownership, agent lookup and the user-message write happen
    /// before this returns; the generation itself runs on a spawned task.
    ///
    /// # Errors
    ///
    /// - [`RelayError::InvalidRequest`] for empty content
    /// - [`RelayError::NotFound`] for an unknown session or agent
    /// - [`RelayError::Forbidden`] if the caller does not own the session
    /// - [`RelayError::Store`] if the user message cannot be persisted
    pub async fn start_turn(&self, request: TurnRequest) -> Result<TurnHandle, RelayError> {
        if request.content.trim().is_empty() {
            return Err(RelayError::InvalidRequest("content must not be empty".to_string()));
        }

        let session_id = request.session_id.clone();
        if !self.store.check_ownership(&session_id, &request.user_id).await? {
            return Err(RelayError::Forbidden(session_id));
        }

        let agent_id = request
            .agent_id
            .clone()
            .unwrap_or_else(|| self.agents.default_agent());
        let agent = self
            .agents
            .get_agent(&agent_id)
            .await
            .ok_or_else(|| NotFound::Agent(agent_id.clone()))?;

        self.store
            .create_message(&session_id, MessageRole::User, &request.content)
            .await?;

        let mut upstream = UpstreamRequest::new(build_prompt(&request.content, request.context_data.as_ref()))
            .with_system(agent.system_instruction)
            .with_temperature(self.config.temperature)
            .with_max_tokens(self.config.max_tokens);
        if let Some(model) = request.model_override.clone() {
            upstream = upstream.with_model(model);
        }

        let generation_id = GenerationId::new();
        let cancel = CancellationToken::new();
        let superseded = CancellationToken::new();
        let key = (session_id.clone(), agent_id.clone());

        if let Some(previous) = self.active.insert(
            key.clone(),
            ActiveGeneration {
                generation_id: generation_id.clone(),
                cancel: cancel.clone(),
                superseded: superseded.clone(),
            },
        ) {
            tracing::info!(
                session_id = %session_id,
                agent_id = %agent_id,
                superseded = %previous.generation_id,
                "Superseding active generation"
            );
            previous.superseded.cancel();
            previous.cancel.cancel();
        }

        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let session = GenerationSession::new(
            session_id.clone(),
            agent_id.clone(),
            generation_id.clone(),
            upstream.prompt.clone(),
            cancel.clone(),
        );

        let span = tracing::info_span!(
            "generation",
            generation_id = %generation_id,
            session_id = %session_id,
            agent_id = %agent_id
        );
        let this = self.clone();
        let own_id = generation_id.clone();
        tokio::spawn(
            async move {
                this.run_generation(session, upstream, tx, &superseded).await;
                // A superseding turn may already own the slot
                this.active
                    .remove_if(&key, |_, active| active.generation_id == own_id);
            }
            .instrument(span),
        );

        Ok(TurnHandle {
            generation_id,
            agent_id,
            events: rx,
            cancel,
        })
    }

    async fn run_generation(
        &self,
        mut session: GenerationSession,
        request: UpstreamRequest,
        tx: mpsc::Sender<TurnEvent>,
        superseded: &CancellationToken,
    ) {
        tracing::debug!(backend = self.backend.name(), "Generation started");

        match self.stream_upstream(&mut session, &request, &tx).await {
            Outcome::Completed => self.finish(session, &tx).await,
            Outcome::Failed(err) => {
                let _ = session.transition(GenerationState::Errored);
                tracing::warn!(error = %err, chunks = session.chunk_count(), "Generation failed");
                self.persist_partial(&mut session).await;
                let err = RelayError::from(err);
                let _ = tx
                    .send(TurnEvent::Error {
                        message: err.to_string(),
                        code: err.code(),
                    })
                    .await;
            }
            Outcome::Cancelled => {
                let _ = session.transition(GenerationState::Cancelled);
                tracing::info!(chunks = session.chunk_count(), "Generation cancelled");
                self.persist_partial(&mut session).await;
                // Only a replaced generation is told why; a plain cancel stays silent
                if superseded.is_cancelled() {
                    let _ = tx
                        .send(TurnEvent::Error {
                            message: "superseded by a newer message".to_string(),
                            code: CODE_SUPERSEDED,
                        })
                        .await;
                }
            }
        }
    }

    async fn stream_upstream(
        &self,
        session: &mut GenerationSession,
        request: &UpstreamRequest,
        tx: &mpsc::Sender<TurnEvent>,
    ) -> Outcome {
        let cancel = session.cancel_token().clone();

        let mut stream = tokio::select! {
            biased;
            () = cancel.cancelled() => return Outcome::Cancelled,
            opened = self.backend.open_stream(request, cancel.clone()) => match opened {
                Ok(stream) => stream,
                Err(e) => return Outcome::Failed(e),
            },
        };

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Outcome::Cancelled,
                next = stream.next() => next,
            };

            let delta = match next {
                None if cancel.is_cancelled() => return Outcome::Cancelled,
                None => return Outcome::Completed,
                Some(Err(e)) => return Outcome::Failed(e),
                Some(Ok(delta)) => delta,
            };

            if session.push_delta(&delta).is_err() {
                return Outcome::Cancelled;
            }

            // A full channel parks here, which stops upstream reads
            let sent = tokio::select! {
                biased;
                () = cancel.cancelled() => return Outcome::Cancelled,
                sent = tx.send(TurnEvent::Chunk { content: delta }) => sent,
            };
            if sent.is_err() {
                tracing::debug!("Event consumer gone, cancelling generation");
                cancel.cancel();
                return Outcome::Cancelled;
            }
        }
    }

    async fn finish(&self, mut session: GenerationSession, tx: &mpsc::Sender<TurnEvent>) {
        let _ = session.transition(GenerationState::Finalizing);
        let chunk_count = session.chunk_count();
        let content = session.take_accumulated();

        let message_id = match self
            .store
            .create_message(session.session_id(), MessageRole::Assistant, &content)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                let _ = session.transition(GenerationState::Errored);
                tracing::error!(error = %e, "Failed to persist assistant message");
                let err = RelayError::from(e);
                let _ = tx
                    .send(TurnEvent::Error {
                        message: err.to_string(),
                        code: err.code(),
                    })
                    .await;
                return;
            }
        };

        let _ = session.transition(GenerationState::Done);
        tracing::info!(message_id = %message_id, chunks = chunk_count, "Generation complete");

        if tx
            .send(TurnEvent::Done {
                message_id: message_id.clone(),
                content: content.clone(),
                chunk_count,
            })
            .await
            .is_err()
        {
            tracing::debug!("Event consumer gone before Done");
        }

        let preview = preview_text(&content, self.config.preview_chars);
        if let Err(e) = self
            .store
            .update_session_preview(session.session_id(), &preview)
            .await
        {
            tracing::warn!(error = %e, "Failed to update session preview");
        }

        if let Some(hook) = self.follow_up.clone() {
            let session_id = session.session_id().clone();
            tokio::spawn(
                async move {
                    hook.on_complete(&session_id, &message_id, &content).await;
                }
                .in_current_span(),
            );
        }
    }

    /// Persist whatever was produced before an error or cancel
    async fn persist_partial(&self, session: &mut GenerationSession) {
        let partial = session.take_accumulated();
        if partial.is_empty() {
            return;
        }
        match self
            .store
            .create_message(session.session_id(), MessageRole::Assistant, &partial)
            .await
        {
            Ok(id) => tracing::debug!(message_id = %id, len = partial.len(), "Persisted partial response"),
            Err(e) => tracing::warn!(error = %e, "Failed to persist partial response"),
        }
    }
}

/// How the upstream phase ended
enum Outcome {
    Completed,
    Failed(UpstreamError),
    Cancelled,
}

/// Final prompt: user content plus an optional context block
fn build_prompt(content: &str, context: Option<&serde_json::Value>) -> String {
    let context = match context {
        None | Some(serde_json::Value::Null) => return content.to_string(),
        Some(serde_json::Value::Object(map)) if map.is_empty() => return content.to_string(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(value) => serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()),
    };
    format!("{content}\n\n[Context]\n{context}")
}

/// First `max_chars` characters, whitespace collapsed
fn preview_text(content: &str, max_chars: usize) -> String {
    let collapsed = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let mut preview: String = collapsed.chars().take(max_chars).collect();
    preview.push('…');
    preview
}
