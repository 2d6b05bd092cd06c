//! OpenAI-Compatible Backend Implementation
//!
//! Upstream client for any provider exposing a `/chat/completions` endpoint
//! with `stream: true` (OpenAI, vLLM, llama.cpp server, OpenRouter, ...).
//!
//! # Wire Format
//!
//! The response body is a Server-Sent Events stream. Each record carries a
//! JSON chunk whose `choices[0].delta.content` is the next text delta; the
//! stream ends with `data: [DONE]`.
//!
//! The request is sent with the credential rendered into a configurable
//! header (see [`ProviderConfig::auth_value`]). Only the configured provider
//! is ever called.

use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::sse::{SseDecoder, SseRecord};
use super::traits::{DeltaStream, ProviderConfig, UpstreamBackend, UpstreamRequest};
use crate::error::{ParseError, UpstreamError};

/// Upper bound on error bodies kept for diagnostics
const MAX_ERROR_BODY: usize = 2048;

/// OpenAI-compatible streaming backend
#[derive(Clone)]
pub struct OpenAiCompatibleBackend {
    /// Provider settings
    config: ProviderConfig,
    /// HTTP client
    http_client: reqwest::Client,
}

impl OpenAiCompatibleBackend {
    /// Create a backend from provider settings
    ///
    /// # Errors
    ///
    /// Returns `UpstreamError::Network` if the HTTP client cannot be built.
    pub fn new(config: ProviderConfig) -> Result<Self, UpstreamError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| UpstreamError::Network(e.to_string()))?;
        Ok(Self {
            config,
            http_client,
        })
    }

    /// Provider settings
    #[must_use]
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Build the JSON request body
    fn build_body(&self, request: &UpstreamRequest) -> serde_json::Value {
        let mut messages = Vec::with_capacity(2);
        if let Some(ref system) = request.system_instruction {
            messages.push(serde_json::json!({ "role": "system", "content": system }));
        }
        messages.push(serde_json::json!({ "role": "user", "content": request.prompt }));

        serde_json::json!({
            "model": request.model.as_deref().unwrap_or(&self.config.default_model),
            "messages": messages,
            "stream": true,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        })
    }
}

#[async_trait]
impl UpstreamBackend for OpenAiCompatibleBackend {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn open_stream(
        &self,
        request: &UpstreamRequest,
        cancel: CancellationToken,
    ) -> Result<DeltaStream, UpstreamError> {
        let read_timeout = self.config.read_timeout();
        let body = self.build_body(request);

        let mut builder = self
            .http_client
            .post(self.config.completions_url())
            .header("Accept", "text/event-stream")
            .json(&body);
        if !self.config.api_key.is_empty() {
            builder = builder.header(self.config.auth_header.as_str(), self.config.auth_value());
        }

        tracing::debug!(
            url = %self.config.completions_url(),
            model = %body["model"],
            "Opening upstream stream"
        );

        let response = tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!("Cancelled before upstream responded");
                return Ok(futures::stream::empty().boxed());
            }
            result = tokio::time::timeout(read_timeout, builder.send()) => match result {
                Err(_) => return Err(UpstreamError::Timeout(read_timeout)),
                Ok(Err(e)) => return Err(UpstreamError::Network(e.to_string())),
                Ok(Ok(response)) => response,
            },
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                status,
                body: truncate(&body, MAX_ERROR_BODY).to_string(),
            });
        }

        Ok(decode_deltas(response.bytes_stream(), read_timeout, cancel))
    }
}

/// Interpretation of one provider record
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Payload {
    /// Non-empty text delta
    Delta(String),
    /// Record without text (role header, finish reason, usage)
    Empty,
    /// Provider-reported failure
    ProviderError(String),
}

#[derive(Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Parse the JSON payload of one record
pub(crate) fn parse_payload(data: &str) -> Result<Payload, ParseError> {
    let chunk: CompletionChunk = serde_json::from_str(data)?;

    if let Some(error) = chunk.error {
        let message = error
            .get("message")
            .and_then(serde_json::Value::as_str)
            .map_or_else(|| error.to_string(), str::to_string);
        return Ok(Payload::ProviderError(message));
    }

    match chunk.choices.into_iter().next().and_then(|c| c.delta.content) {
        Some(text) if !text.is_empty() => Ok(Payload::Delta(text)),
        _ => Ok(Payload::Empty),
    }
}

/// State carried between polls of a delta stream
struct DeltaState<S> {
    bytes: Pin<Box<S>>,
    decoder: SseDecoder,
    pending: VecDeque<Result<String, UpstreamError>>,
    done: bool,
    read_timeout: Duration,
    cancel: CancellationToken,
}

impl<S> DeltaState<S> {
    fn handle_record(&mut self, record: SseRecord) {
        match record {
            SseRecord::Done => self.done = true,
            SseRecord::Data(data) => match parse_payload(&data) {
                Ok(Payload::Delta(text)) => self.pending.push_back(Ok(text)),
                Ok(Payload::Empty) => {}
                Ok(Payload::ProviderError(message)) => {
                    self.pending.push_back(Err(UpstreamError::Provider(message)));
                    self.done = true;
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        record = %truncate(&data, 256),
                        "Skipping malformed upstream record"
                    );
                }
            },
        }
    }
}

/// Turn a raw byte stream into a delta stream
///
/// Stops at the end sentinel, on the first read error, when no bytes arrive
/// within `read_timeout`, or when `cancel` fires. Dropping the underlying
/// byte stream closes the connection.
pub(crate) fn decode_deltas<S, B, E>(
    bytes: S,
    read_timeout: Duration,
    cancel: CancellationToken,
) -> DeltaStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]>,
    E: Display,
{
    let state = DeltaState {
        bytes: Box::pin(bytes),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        done: false,
        read_timeout,
        cancel,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.done {
                return None;
            }

            let next = tokio::select! {
                biased;
                () = state.cancel.cancelled() => {
                    tracing::debug!("Upstream stream cancelled, closing connection");
                    return None;
                }
                next = tokio::time::timeout(state.read_timeout, state.bytes.next()) => next,
            };

            match next {
                Err(_) => {
                    state.done = true;
                    return Some((Err(UpstreamError::Timeout(state.read_timeout)), state));
                }
                Ok(None) => {
                    state.done = true;
                    if let Some(record) = state.decoder.finish() {
                        state.handle_record(record);
                    }
                }
                Ok(Some(Err(e))) => {
                    state.done = true;
                    return Some((Err(UpstreamError::Network(e.to_string())), state));
                }
                Ok(Some(Ok(chunk))) => {
                    for record in state.decoder.push(chunk.as_ref()) {
                        state.handle_record(record);
                    }
                }
            }
        }
    })
    .boxed()
}

/// Truncate on a char boundary
fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
