//! Retry / Resume Controller
//!
//! Two recovery paths for clients:
//!
//! - **Session race**: the UI may create a session optimistically and send
//!   before the server has confirmed it. [`SessionRaceResolver`] waits
//!   briefly for confirmation and, if the server answers `unknown_session`,
//!   creates the session and resends the same content exactly once.
//! - **Reconnection**: [`ReconnectPolicy`] computes bounded exponential
//!   backoff for socket reconnects; progress is published as
//!   [`ConnectionStatus`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::SendError;
use crate::messages::SessionId;
use crate::transport::SendRequest;

// ============================================================================
// Reconnection
// ============================================================================

/// Backoff policy for reconnecting
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Attempts before giving up (including the first)
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay_ms: u64,
    /// Upper bound on any delay
    pub max_delay_ms: u64,
    /// Growth factor per attempt
    pub multiplier: f64,
    /// Add up to 25% random jitter
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retrying after failed attempt N (0-indexed)
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay_ms as f64);

        let delay_ms = if self.jitter {
            let jitter = rand::random::<f64>() * 0.25;
            capped * (1.0 + jitter)
        } else {
            capped
        };

        Duration::try_from_secs_f64(delay_ms.round() / 1_000.0).unwrap_or(Duration::from_millis(self.max_delay_ms))
    }

    /// Whether another attempt is allowed after `attempts` failures
    #[must_use]
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Connection state visible to the UI
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// First attempt in progress
    Connecting,
    /// Handshake accepted
    Connected {
        /// Server-assigned connection id
        connection_id: String,
    },
    /// Waiting before the next attempt
    Reconnecting {
        /// Attempts failed so far
        attempt: u32,
        /// Wait before the next one
        delay: Duration,
    },
    /// Connection closed
    Disconnected {
        /// Close code, when the server sent one
        code: Option<u16>,
    },
    /// Gave up; needs user action
    Failed {
        /// Attempts made
        attempts: u32,
    },
}

// ============================================================================
// Session race
// ============================================================================

/// Server calls the resolver needs
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Stream returned for an accepted send
    type Stream: Send;

    /// Send one user message
    async fn send(&self, request: &SendRequest) -> Result<Self::Stream, SendError>;

    /// Create a session owned by the caller
    async fn create_session(&self) -> Result<SessionId, SendError>;
}

/// Local id of a session plus whether the server knows it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionBinding {
    /// Id the client currently uses
    pub id: SessionId,
    /// Whether creation has been confirmed
    pub confirmed: bool,
}

/// Observable handle on a session's id
///
/// Clones share the binding, so every send racing on one session sees the
/// same confirmation and at most one of them creates the session.
#[derive(Clone, Debug)]
pub struct SessionSlot {
    binding: Arc<watch::Sender<SessionBinding>>,
    creating: Arc<tokio::sync::Mutex<()>>,
}

impl SessionSlot {
    /// A session created optimistically on the client
    #[must_use]
    pub fn provisional() -> Self {
        Self::with_binding(SessionBinding {
            id: SessionId::provisional(),
            confirmed: false,
        })
    }

    /// A session the server already knows
    #[must_use]
    pub fn confirmed(id: SessionId) -> Self {
        Self::with_binding(SessionBinding { id, confirmed: true })
    }

    fn with_binding(binding: SessionBinding) -> Self {
        let (binding, _) = watch::channel(binding);
        Self {
            binding: Arc::new(binding),
            creating: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Record the server-confirmed id
    pub fn confirm(&self, id: SessionId) {
        self.binding.send_replace(SessionBinding { id, confirmed: true });
    }

    /// Current binding
    #[must_use]
    pub fn current(&self) -> SessionBinding {
        self.binding.borrow().clone()
    }

    /// Watch for id changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionBinding> {
        self.binding.subscribe()
    }
}

/// Sends that survive a session-creation race
#[derive(Clone, Debug)]
pub struct SessionRaceResolver {
    confirm_wait: Duration,
}

impl Default for SessionRaceResolver {
    fn default() -> Self {
        Self::new(Duration::from_millis(1_500))
    }
}

impl SessionRaceResolver {
    /// Wait at most `confirm_wait` for an unconfirmed session
    #[must_use]
    pub fn new(confirm_wait: Duration) -> Self {
        Self { confirm_wait }
    }

    /// Send `request` on the session held by `slot`
    ///
    /// The request's `session_id` is replaced with the slot's id. Only
    /// `unknown_session` triggers the create-and-resend path; the resend
    /// carries the original content unchanged and its result is returned
    /// as-is. Concurrent sends on one slot create the session once; the
    /// others resend on the id it was confirmed with.
    pub async fn send<A>(
        &self,
        api: &A,
        slot: &SessionSlot,
        mut request: SendRequest,
    ) -> Result<A::Stream, SendError>
    where
        A: ChatApi + ?Sized,
    {
        let mut binding = slot.subscribe();
        if !binding.borrow().confirmed {
            let wait = binding.wait_for(|b| b.confirmed);
            let confirmed = matches!(tokio::time::timeout(self.confirm_wait, wait).await, Ok(Ok(_)));
            if !confirmed {
                tracing::debug!(
                    session_id = %slot.current().id,
                    "Session unconfirmed, sending anyway"
                );
            }
        }

        request.session_id = slot.current().id;
        match api.send(&request).await {
            Err(SendError::UnknownSession { message }) => {
                tracing::info!(
                    session_id = %request.session_id,
                    reason = %message,
                    "Server does not know the session, creating it and resending"
                );
                request.session_id = create_once(api, slot, &request.session_id).await?;
                api.send(&request).await
            }
            other => other,
        }
    }
}

/// Create the session unless a concurrent send already replaced `rejected`
async fn create_once<A>(api: &A, slot: &SessionSlot, rejected: &SessionId) -> Result<SessionId, SendError>
where
    A: ChatApi + ?Sized,
{
    let _creating = slot.creating.lock().await;
    let current = slot.current();
    if current.confirmed && &current.id != rejected {
        tracing::debug!(session_id = %current.id, "Session created by a concurrent send");
        return Ok(current.id);
    }

    let session_id = api.create_session().await?;
    slot.confirm(session_id.clone());
    Ok(session_id)
}
