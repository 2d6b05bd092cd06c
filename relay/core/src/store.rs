//! Collaborator Interfaces
//!
//! The pipeline persists through [`MessageStore`] and resolves agents through
//! [`AgentDirectory`]. Real deployments back these with a database; the
//! in-memory versions here serve the daemon's development mode and tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::StoreError;
use crate::messages::{AgentId, ChatMessage, MessageId, MessageRole, SessionId};

/// Durable message storage
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message and return its durable id
    async fn create_message(
        &self,
        session_id: &SessionId,
        role: MessageRole,
        content: &str,
    ) -> Result<MessageId, StoreError>;

    /// Update the session's preview text
    async fn update_session_preview(
        &self,
        session_id: &SessionId,
        text: &str,
    ) -> Result<(), StoreError>;

    /// Whether `user_id` owns the session
    ///
    /// Unknown sessions fail with [`StoreError::SessionNotFound`], distinct
    /// from `Ok(false)`.
    async fn check_ownership(&self, session_id: &SessionId, user_id: &str)
        -> Result<bool, StoreError>;

    /// Create a session owned by `user_id`
    async fn create_session(&self, user_id: &str) -> Result<SessionId, StoreError>;
}

/// An agent the user can address
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Agent {
    /// Agent id
    pub id: AgentId,
    /// Display name
    pub name: String,
    /// System instruction sent upstream
    pub system_instruction: String,
}

/// Agent lookup
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    /// Resolve an agent
    async fn get_agent(&self, agent_id: &AgentId) -> Option<Agent>;

    /// Agent used when a send names none
    fn default_agent(&self) -> AgentId;
}

#[derive(Debug)]
struct SessionRecord {
    owner: String,
    preview: Option<String>,
    messages: Vec<ChatMessage>,
}

/// Message store kept in process memory
#[derive(Clone, Debug, Default)]
pub struct InMemoryMessageStore {
    sessions: Arc<RwLock<HashMap<SessionId, SessionRecord>>>,
}

impl InMemoryMessageStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session under a known id
    pub fn insert_session(&self, session_id: SessionId, owner: impl Into<String>) {
        self.sessions.write().insert(
            session_id,
            SessionRecord {
                owner: owner.into(),
                preview: None,
                messages: Vec::new(),
            },
        );
    }

    /// Messages of a session in insertion order
    #[must_use]
    pub fn messages(&self, session_id: &SessionId) -> Vec<ChatMessage> {
        self.sessions
            .read()
            .get(session_id)
            .map(|record| record.messages.clone())
            .unwrap_or_default()
    }

    /// Current preview of a session
    #[must_use]
    pub fn preview(&self, session_id: &SessionId) -> Option<String> {
        self.sessions
            .read()
            .get(session_id)
            .and_then(|record| record.preview.clone())
    }

    /// Number of sessions
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn create_message(
        &self,
        session_id: &SessionId,
        role: MessageRole,
        content: &str,
    ) -> Result<MessageId, StoreError> {
        let mut sessions = self.sessions.write();
        let record = sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.clone()))?;
        let id = MessageId::durable();
        record.messages.push(ChatMessage::new(
            id.clone(),
            session_id.clone(),
            role,
            content.to_string(),
        ));
        tracing::debug!(session_id = %session_id, message_id = %id, role = role.as_str(), "Stored message");
        Ok(id)
    }

    async fn update_session_preview(
        &self,
        session_id: &SessionId,
        text: &str,
    ) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write();
        let record = sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.clone()))?;
        record.preview = Some(text.to_string());
        Ok(())
    }

    async fn check_ownership(
        &self,
        session_id: &SessionId,
        user_id: &str,
    ) -> Result<bool, StoreError> {
        self.sessions
            .read()
            .get(session_id)
            .map(|record| record.owner == user_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.clone()))
    }

    async fn create_session(&self, user_id: &str) -> Result<SessionId, StoreError> {
        let id = SessionId::new();
        self.insert_session(id.clone(), user_id);
        tracing::info!(session_id = %id, user_id, "Created session");
        Ok(id)
    }
}

/// Fixed set of agents
#[derive(Clone, Debug)]
pub struct StaticAgentDirectory {
    agents: HashMap<AgentId, Agent>,
    default_agent: AgentId,
}

impl StaticAgentDirectory {
    /// Id of the built-in agent
    pub const DEFAULT_AGENT: &'static str = "assistant";

    /// Directory holding only the built-in agent
    #[must_use]
    pub fn new() -> Self {
        let id = AgentId::from(Self::DEFAULT_AGENT);
        let mut agents = HashMap::new();
        agents.insert(
            id.clone(),
            Agent {
                id: id.clone(),
                name: "Assistant".to_string(),
                system_instruction: "You are a helpful assistant.".to_string(),
            },
        );
        Self {
            agents,
            default_agent: id,
        }
    }

    /// Add or replace an agent
    #[must_use]
    pub fn with_agent(mut self, agent: Agent) -> Self {
        self.agents.insert(agent.id.clone(), agent);
        self
    }

    /// Change the default agent
    #[must_use]
    pub fn with_default(mut self, agent_id: AgentId) -> Self {
        self.default_agent = agent_id;
        self
    }
}

impl Default for StaticAgentDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentDirectory for StaticAgentDirectory {
    async fn get_agent(&self, agent_id: &AgentId) -> Option<Agent> {
        self.agents.get(agent_id).cloned()
    }

    fn default_agent(&self) -> AgentId {
        self.default_agent.clone()
    }
}
