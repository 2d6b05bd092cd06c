//! HTTP stream client
//!
//! Reads the request/response transport: posts a send and decodes the SSE
//! body with the same [`SseDecoder`] used for upstream providers. Dropping
//! or cancelling the source closes the response, which stops the
//! generation on the server.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::AUTHORIZATION;

use super::events::ClientEvent;
use super::retry::ChatApi;
use super::source::EventSource;
use crate::backend::{SseDecoder, SseRecord};
use crate::error::{ClientError, SendError};
use crate::messages::SessionId;
use crate::transport::{ErrorBody, SendRequest, SessionCreated, WireEvent};

/// Client for `POST /api/chat/send`
#[derive(Clone, Debug)]
pub struct HttpStreamClient {
    base_url: String,
    token: String,
    http_client: reqwest::Client,
}

impl HttpStreamClient {
    /// Create a client for the server at `base_url` (e.g. `http://127.0.0.1:8080`)
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Connect`] if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, ClientError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ClientError::Connect(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            http_client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }

    /// Post a send and return its event stream
    ///
    /// # Errors
    ///
    /// Returns [`SendError`] for pre-stream refusals (classified by code)
    /// and [`SendError::Transport`] when the server is unreachable.
    pub async fn send(&self, request: &SendRequest) -> Result<HttpEventSource, SendError> {
        let response = self
            .http_client
            .post(self.url("/api/chat/send"))
            .header(AUTHORIZATION, self.bearer())
            .json(request)
            .send()
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(refusal(status, response).await);
        }

        tracing::debug!(session_id = %request.session_id, "Send accepted, reading stream");
        Ok(HttpEventSource::new(response.bytes_stream().boxed()))
    }

    /// Create a session owned by the token's user
    ///
    /// # Errors
    ///
    /// Same as [`HttpStreamClient::send`].
    pub async fn create_session(&self) -> Result<SessionId, SendError> {
        let response = self
            .http_client
            .post(self.url("/api/sessions"))
            .header(AUTHORIZATION, self.bearer())
            .send()
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(refusal(status, response).await);
        }

        let created: SessionCreated = response
            .json()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(created.session_id)
    }
}

async fn refusal(status: reqwest::StatusCode, response: reqwest::Response) -> SendError {
    match response.json::<ErrorBody>().await {
        Ok(body) => SendError::from_code(&body.code, body.error),
        Err(_) => SendError::Rejected {
            code: status.as_u16().to_string(),
            message: status.canonical_reason().unwrap_or("request failed").to_string(),
        },
    }
}

#[async_trait]
impl ChatApi for HttpStreamClient {
    type Stream = HttpEventSource;

    async fn send(&self, request: &SendRequest) -> Result<HttpEventSource, SendError> {
        HttpStreamClient::send(self, request).await
    }

    async fn create_session(&self) -> Result<SessionId, SendError> {
        HttpStreamClient::create_session(self).await
    }
}

/// Events of one SSE response
pub struct HttpEventSource {
    body: BoxStream<'static, Result<Bytes, reqwest::Error>>,
    decoder: SseDecoder,
    ready: VecDeque<ClientEvent>,
    finished: bool,
}

impl std::fmt::Debug for HttpEventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpEventSource")
            .field("ready", &self.ready.len())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl HttpEventSource {
    /// Wrap a response body
    #[must_use]
    pub fn new(body: BoxStream<'static, Result<Bytes, reqwest::Error>>) -> Self {
        Self {
            body,
            decoder: SseDecoder::new(),
            ready: VecDeque::new(),
            finished: false,
        }
    }

    fn accept(&mut self, record: SseRecord) {
        match record {
            SseRecord::Data(data) => match serde_json::from_str::<WireEvent>(&data) {
                Ok(event) => self.ready.push_back(ClientEvent::from(event)),
                Err(e) => tracing::warn!(error = %e, "Skipping malformed stream record"),
            },
            SseRecord::Done => self.finished = true,
        }
    }
}

#[async_trait]
impl EventSource for HttpEventSource {
    async fn next_event(&mut self) -> Option<Result<ClientEvent, ClientError>> {
        loop {
            if let Some(event) = self.ready.pop_front() {
                return Some(Ok(event));
            }
            if self.finished {
                return None;
            }
            match self.body.next().await {
                Some(Ok(bytes)) => {
                    for record in self.decoder.push(&bytes) {
                        self.accept(record);
                    }
                }
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(ClientError::Transport(e.to_string())));
                }
                None => {
                    self.finished = true;
                    if let Some(record) = self.decoder.finish() {
                        self.accept(record);
                    }
                }
            }
        }
    }

    async fn cancel(&mut self) {
        // Dropping the body closes the connection
        self.body = futures::stream::empty().boxed();
        self.ready.clear();
        self.finished = true;
    }
}
