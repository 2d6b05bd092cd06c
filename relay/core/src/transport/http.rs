//! Request/Response Streaming Transport
//!
//! `POST /api/chat/send` answers with a Server-Sent Events stream of
//! [`WireEvent`] records:
//!
//! ```text
//! data: {"type":"chunk","content":"Hi"}
//!
//! data: {"type":"chunk","content":" there"}
//!
//! data: {"type":"done","messageId":"…","content":"Hi there","chunkCount":2}
//!
//! ```
//!
//! `POST /api/sessions` creates an empty session owned by the caller; the
//! client uses it when a send races session creation.
//!
//! Failures before the stream starts are plain JSON responses
//! `{"error": "...", "code": "..."}` with a matching status. Closing the
//! response body (client disconnect) cancels the generation.

use std::convert::Infallible;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;

use super::AppState;
use crate::auth::{bearer_token, Identity};
use crate::error::{AuthError, NotFound, RelayError};
use crate::messages::{AgentId, MessageId, SessionId};
use crate::streaming::{TurnEvent, TurnRequest};

/// Body of `POST /api/chat/send`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    /// Target session
    pub session_id: SessionId,
    /// User text
    pub content: String,
    /// Target agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    /// Model override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_override: Option<String>,
    /// Extra prompt context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_data: Option<serde_json::Value>,
}

/// One streamed record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireEvent {
    /// Next delta
    Chunk {
        /// Delta text
        content: String,
    },
    /// Turn complete
    #[serde(rename_all = "camelCase")]
    Done {
        /// Durable message id
        message_id: MessageId,
        /// Full text
        #[serde(default)]
        content: String,
        /// Number of chunks sent
        #[serde(default)]
        chunk_count: u32,
    },
    /// Turn failed
    Error {
        /// Human-readable message
        message: String,
        /// Stable error code
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl From<TurnEvent> for WireEvent {
    fn from(event: TurnEvent) -> Self {
        match event {
            TurnEvent::Chunk { content } => Self::Chunk { content },
            TurnEvent::Done {
                message_id,
                content,
                chunk_count,
            } => Self::Done {
                message_id,
                content,
                chunk_count,
            },
            TurnEvent::Error { message, code } => Self::Error {
                message,
                code: Some(code.to_string()),
            },
        }
    }
}

/// Body of a `POST /api/sessions` response
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCreated {
    /// Durable session id
    pub session_id: SessionId,
}

/// Error body of non-streaming responses
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable message
    pub error: String,
    /// Stable error code
    pub code: String,
}

/// [`RelayError`] rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub RelayError);

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        Self(err)
    }
}

impl ApiError {
    /// Status code for the wrapped error
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            RelayError::Auth(_) => StatusCode::UNAUTHORIZED,
            RelayError::Forbidden(_) => StatusCode::FORBIDDEN,
            RelayError::NotFound(NotFound::Session(_) | NotFound::Agent(_)) => StatusCode::NOT_FOUND,
            RelayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            RelayError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.0.to_string(),
            code: self.0.code().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Identity, RelayError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .ok_or(RelayError::Auth(AuthError::Missing))?;
    Ok(state.verifier.verify(token)?)
}

/// Handler for `POST /api/sessions`
pub async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<SessionCreated>), ApiError> {
    let identity = authenticate(&state, &headers)?;
    let session_id = state
        .multiplexer
        .store()
        .create_session(&identity.user_id)
        .await
        .map_err(RelayError::from)?;
    tracing::info!(session_id = %session_id, user_id = %identity.user_id, "Session created");
    Ok((StatusCode::CREATED, Json(SessionCreated { session_id })))
}

/// Handler for `POST /api/chat/send`
pub async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<SendRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let identity = authenticate(&state, &headers)?;

    let Json(body) = body.map_err(|e| RelayError::InvalidRequest(e.body_text()))?;

    let request = TurnRequest {
        user_id: identity.user_id,
        session_id: body.session_id,
        content: body.content,
        agent_id: body.agent_id,
        model_override: body.model_override,
        context_data: body.context_data,
    };

    let session_id = request.session_id.clone();
    let turn = state.multiplexer.start_turn(request).await?;
    tracing::info!(
        session_id = %session_id,
        generation_id = %turn.generation_id,
        "Streaming turn over SSE"
    );

    // Dropped with the response body, which cancels the generation
    let guard = turn.cancel.clone().drop_guard();
    let events = ReceiverStream::new(turn.events).map(move |event| {
        let _ = &guard;
        Ok::<Event, Infallible>(encode_event(&WireEvent::from(event)))
    });

    let sse = Sse::new(events).keep_alive(KeepAlive::new().interval(state.keep_alive));
    Ok(sse.into_response())
}

fn encode_event(event: &WireEvent) -> Event {
    match serde_json::to_string(event) {
        Ok(json) => Event::default().data(json),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode wire event");
            Event::default().comment("encode error")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UpstreamError;

    #[test]
    fn test_wire_event_shapes() {
        let json = serde_json::to_value(WireEvent::Chunk {
            content: "Hi".to_string(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "chunk", "content": "Hi"}));

        let json = serde_json::to_value(WireEvent::Done {
            message_id: MessageId::from("m1"),
            content: "Hi there".to_string(),
            chunk_count: 2,
        })
        .unwrap();
        assert_eq!(json["type"], "done");
        assert_eq!(json["messageId"], "m1");
        assert_eq!(json["chunkCount"], 2);
    }

    #[test]
    fn test_minimal_done_parses() {
        let event: WireEvent = serde_json::from_str(r#"{"type":"done","messageId":"m1"}"#).unwrap();
        assert_eq!(
            event,
            WireEvent::Done {
                message_id: MessageId::from("m1"),
                content: String::new(),
                chunk_count: 0
            }
        );
    }

    #[test]
    fn test_chunk_with_newlines_stays_on_one_line() {
        let json = serde_json::to_string(&WireEvent::Chunk {
            content: "line one\n\nline two".to_string(),
        })
        .unwrap();
        assert!(!json.contains('\n'));
    }

    #[test]
    fn test_status_mapping() {
        let cases = [
            (RelayError::Auth(AuthError::Missing), StatusCode::UNAUTHORIZED, "unauthorized"),
            (
                RelayError::Forbidden(SessionId::from("s")),
                StatusCode::FORBIDDEN,
                "forbidden",
            ),
            (
                RelayError::NotFound(NotFound::Session(SessionId::from("s"))),
                StatusCode::NOT_FOUND,
                "unknown_session",
            ),
            (
                RelayError::NotFound(NotFound::Agent(AgentId::from("a"))),
                StatusCode::NOT_FOUND,
                "not_found",
            ),
            (
                RelayError::InvalidRequest("x".to_string()),
                StatusCode::BAD_REQUEST,
                "invalid_request",
            ),
            (
                RelayError::Upstream(UpstreamError::Network("x".to_string())),
                StatusCode::BAD_GATEWAY,
                "upstream_error",
            ),
        ];
        for (err, status, code) in cases {
            assert_eq!(err.code(), code);
            assert_eq!(ApiError(err).status(), status);
        }
    }
}
