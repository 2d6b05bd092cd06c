//! Error Taxonomy
//!
//! Errors shared across the pipeline. Each concern has its own enum; the
//! multiplexer folds them into [`RelayError`], which transports map to wire
//! codes (see [`RelayError::code`]).

use std::time::Duration;

use thiserror::Error;

use crate::messages::{AgentId, SessionId};

/// Wire code for a session the server does not know
///
/// This is the only failure that triggers the client's session-race resend.
pub const CODE_UNKNOWN_SESSION: &str = "unknown_session";

/// Wire code ending a generation replaced by a newer send to the same
/// session and agent
pub const CODE_SUPERSEDED: &str = "superseded";

/// Failures talking to the model provider
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Provider answered with a non-success status
    #[error("upstream returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body (possibly truncated)
        body: String,
    },
    /// Connection or read failure
    #[error("upstream network error: {0}")]
    Network(String),
    /// No bytes arrived within the deadline
    #[error("no bytes from upstream within {0:?}")]
    Timeout(Duration),
    /// Provider sent an explicit error record mid-stream
    #[error("upstream reported an error: {0}")]
    Provider(String),
}

/// A provider record that could not be interpreted
///
/// Never fatal: the record is logged and skipped.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Payload is not valid JSON for the expected shape
    #[error("malformed upstream record: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures from the message store collaborator
#[derive(Debug, Error)]
pub enum StoreError {
    /// The session id is unknown to the store
    #[error("unknown session: {0}")]
    SessionNotFound(SessionId),
    /// Any other storage failure
    #[error("message store failure: {0}")]
    Backend(String),
}

/// Failures verifying a caller's credential
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No credential supplied
    #[error("missing credential")]
    Missing,
    /// Credential is malformed or its signature does not match
    #[error("invalid credential: {0}")]
    Invalid(String),
    /// Credential has expired
    #[error("credential expired")]
    Expired,
}

/// Failures of the listening side
#[derive(Debug, Error)]
pub enum TransportError {
    /// Listener could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address
        addr: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
    /// Server loop failed
    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// What could not be found
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NotFound {
    /// Unknown chat session
    #[error("unknown session: {0}")]
    Session(SessionId),
    /// Unknown agent
    #[error("unknown agent: {0}")]
    Agent(AgentId),
}

/// Top-level pipeline error
#[derive(Debug, Error)]
pub enum RelayError {
    /// Bad or missing credential
    #[error(transparent)]
    Auth(#[from] AuthError),
    /// Unknown session or agent
    #[error(transparent)]
    NotFound(#[from] NotFound),
    /// Caller does not own the session
    #[error("session {0} is not owned by the caller")]
    Forbidden(SessionId),
    /// Request failed validation
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Provider failure
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    /// Store failure
    #[error(transparent)]
    Store(StoreError),
}

/// Client-side streaming failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Could not reach the server
    #[error("connection failed: {0}")]
    Connect(String),
    /// Handshake was refused
    #[error("handshake rejected ({code}): {reason}")]
    Rejected {
        /// Close code
        code: u16,
        /// Close reason
        reason: String,
    },
    /// Connection dropped or a read failed mid-stream
    #[error("transport failure: {0}")]
    Transport(String),
    /// The stream ended before a terminal event
    #[error("stream ended before the response completed")]
    Incomplete,
    /// Reconnection gave up
    #[error("could not reconnect after {attempts} attempts")]
    ReconnectExhausted {
        /// Attempts made
        attempts: u32,
    },
}

/// Why a send was not accepted
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The server does not know the session yet
    #[error("unknown session: {message}")]
    UnknownSession {
        /// Server message
        message: String,
    },
    /// Any other refusal, surfaced unchanged
    #[error("send rejected ({code}): {message}")]
    Rejected {
        /// Stable error code
        code: String,
        /// Server message
        message: String,
    },
    /// The request never got an answer
    #[error(transparent)]
    Transport(#[from] ClientError),
}

impl SendError {
    /// Classify a server error by its code
    pub fn from_code(code: &str, message: impl Into<String>) -> Self {
        if code == CODE_UNKNOWN_SESSION {
            Self::UnknownSession {
                message: message.into(),
            }
        } else {
            Self::Rejected {
                code: code.to_string(),
                message: message.into(),
            }
        }
    }

    /// Whether this is the session-race failure
    #[must_use]
    pub fn is_unknown_session(&self) -> bool {
        matches!(self, Self::UnknownSession { .. })
    }
}

impl From<StoreError> for RelayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::SessionNotFound(id) => Self::NotFound(NotFound::Session(id)),
            other => Self::Store(other),
        }
    }
}

impl RelayError {
    /// Stable machine-readable code sent to clients
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Auth(_) => "unauthorized",
            Self::NotFound(NotFound::Session(_)) => CODE_UNKNOWN_SESSION,
            Self::NotFound(NotFound::Agent(_)) => "not_found",
            Self::Forbidden(_) => "forbidden",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Upstream(UpstreamError::Timeout(_)) => "upstream_timeout",
            Self::Upstream(_) => "upstream_error",
            Self::Store(_) => "store_error",
        }
    }
}
