//! Shared fixtures for the integration tests
//!
//! - [`ScriptedBackend`]: in-process upstream with a fixed delta script
//! - [`MockProvider`]: loopback OpenAI-compatible HTTP server
//! - [`Relay`]: a full relay server on an ephemeral port

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use relay_core::backend::DeltaStream;
use relay_core::{
    AppState, InMemoryMessageStore, MultiplexerConfig, ProviderConfig, RelayServer, SessionId,
    SignedTokenVerifier, SocketConfig, SocketManager, StaticAgentDirectory, StreamMultiplexer,
    UpstreamBackend, UpstreamError, UpstreamRequest,
};

/// Owner of the session every relay starts with
pub const USER: &str = "alice";

/// Id of the session every relay starts with
pub const SESSION: &str = "session-1";

// =============================================================================
// Scripted backend
// =============================================================================

/// Upstream that replays a fixed script
///
/// `Ok` items are deltas, `Err` items become [`UpstreamError::Provider`].
/// With `hold_open` the stream stays pending after the script, like a
/// provider that is still thinking.
pub struct ScriptedBackend {
    script: Vec<Result<&'static str, &'static str>>,
    hold_open: bool,
    requests: Mutex<Vec<UpstreamRequest>>,
}

impl ScriptedBackend {
    pub fn new(deltas: &[&'static str]) -> Self {
        Self {
            script: deltas.iter().map(|d| Ok(*d)).collect(),
            hold_open: false,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_script(script: Vec<Result<&'static str, &'static str>>) -> Self {
        Self {
            script,
            hold_open: false,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn holding_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn requests(&self) -> Vec<UpstreamRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl UpstreamBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn open_stream(
        &self,
        request: &UpstreamRequest,
        _cancel: CancellationToken,
    ) -> Result<DeltaStream, UpstreamError> {
        self.requests.lock().push(request.clone());

        let items: Vec<Result<String, UpstreamError>> = self
            .script
            .iter()
            .map(|item| match item {
                Ok(delta) => Ok((*delta).to_string()),
                Err(message) => Err(UpstreamError::Provider((*message).to_string())),
            })
            .collect();
        let script = stream::iter(items);

        if self.hold_open {
            Ok(script.chain(stream::pending()).boxed())
        } else {
            Ok(script.boxed())
        }
    }
}

// =============================================================================
// Mock provider
// =============================================================================

/// One step of a streamed provider response
#[derive(Clone, Debug)]
pub enum Step {
    /// Write this text
    Send(String),
    /// Write raw bytes, possibly cutting a character
    Raw(Vec<u8>),
    /// Wait before the next step
    Pause(Duration),
    /// Never write again
    Hang,
}

/// What the provider answers to every request
#[derive(Clone, Debug)]
pub enum Reply {
    /// `200 text/event-stream` following the steps
    Stream(Vec<Step>),
    /// Non-success status with a plain body
    Status(u16, &'static str),
}

/// A request as the provider saw it
#[derive(Clone, Debug)]
pub struct SeenRequest {
    pub authorization: Option<String>,
    pub body: serde_json::Value,
}

#[derive(Clone)]
struct ProviderState {
    reply: Arc<Mutex<Reply>>,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
    bodies_dropped: Arc<AtomicUsize>,
}

/// Counts response bodies released, finished or abandoned
struct DropFlag(Arc<AtomicUsize>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Loopback OpenAI-compatible server
pub struct MockProvider {
    addr: SocketAddr,
    state: ProviderState,
    stop: CancellationToken,
}

impl MockProvider {
    pub async fn start(reply: Reply) -> Self {
        let state = ProviderState {
            reply: Arc::new(Mutex::new(reply)),
            seen: Arc::new(Mutex::new(Vec::new())),
            bodies_dropped: Arc::new(AtomicUsize::new(0)),
        };
        let app = Router::new()
            .route("/v1/chat/completions", post(completions))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stop = CancellationToken::new();
        let serve_stop = stop.clone();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move { serve_stop.cancelled().await })
                .await;
        });

        Self { addr, state, stop }
    }

    /// Provider settings pointing at this server
    pub fn config(&self) -> ProviderConfig {
        ProviderConfig {
            base_url: format!("http://{}/v1", self.addr),
            api_key: "test-key".to_string(),
            default_model: "mock-model".to_string(),
            read_timeout_ms: 2_000,
            ..ProviderConfig::default()
        }
    }

    pub fn seen(&self) -> Vec<SeenRequest> {
        self.state.seen.lock().clone()
    }

    /// Number of response bodies released (completed or abandoned)
    pub fn bodies_dropped(&self) -> usize {
        self.state.bodies_dropped.load(Ordering::SeqCst)
    }
}

impl Drop for MockProvider {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn completions(
    State(state): State<ProviderState>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Response {
    state.seen.lock().push(SeenRequest {
        authorization: headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body,
    });

    let reply = state.reply.lock().clone();
    match reply {
        Reply::Status(code, text) => (StatusCode::from_u16(code).unwrap(), text).into_response(),
        Reply::Stream(steps) => {
            let flag = DropFlag(state.bodies_dropped.clone());
            let body = stream::unfold((steps.into_iter(), flag), |(mut steps, flag)| async move {
                loop {
                    match steps.next()? {
                        Step::Send(text) => {
                            return Some((Ok::<_, std::io::Error>(Bytes::from(text)), (steps, flag)))
                        }
                        Step::Raw(bytes) => {
                            return Some((Ok(Bytes::from(bytes)), (steps, flag)))
                        }
                        Step::Pause(duration) => tokio::time::sleep(duration).await,
                        Step::Hang => std::future::pending::<()>().await,
                    }
                }
            });
            (
                [(header::CONTENT_TYPE, "text/event-stream")],
                Body::from_stream(body),
            )
                .into_response()
        }
    }
}

/// One provider delta record
pub fn delta(text: &str) -> String {
    let record = serde_json::json!({ "choices": [{ "delta": { "content": text } }] });
    format!("data: {record}\n\n")
}

/// The end-of-stream sentinel record
pub fn done() -> String {
    "data: [DONE]\n\n".to_string()
}

/// A well-formed response streaming `deltas`
pub fn stream_of(deltas: &[&str]) -> Reply {
    let mut steps: Vec<Step> = deltas.iter().map(|d| Step::Send(delta(d))).collect();
    steps.push(Step::Send(done()));
    Reply::Stream(steps)
}

// =============================================================================
// Relay server
// =============================================================================

/// A relay serving both transports on an ephemeral port
pub struct Relay {
    pub addr: SocketAddr,
    pub store: InMemoryMessageStore,
    pub state: AppState,
    verifier: SignedTokenVerifier,
    stop: CancellationToken,
    server: Option<tokio::task::JoinHandle<()>>,
}

impl Relay {
    pub async fn start(backend: Arc<dyn UpstreamBackend>) -> Self {
        Self::start_with(backend, SocketConfig::default()).await
    }

    pub async fn start_with(backend: Arc<dyn UpstreamBackend>, sockets: SocketConfig) -> Self {
        let store = InMemoryMessageStore::new();
        store.insert_session(SessionId::from(SESSION), USER);

        let multiplexer = StreamMultiplexer::new(
            backend,
            Arc::new(store.clone()),
            Arc::new(StaticAgentDirectory::new()),
            MultiplexerConfig::default(),
        );
        let sockets = SocketManager::new(multiplexer.clone(), sockets);
        let verifier = SignedTokenVerifier::new("integration-secret");
        let state = AppState::new(multiplexer, Arc::new(verifier.clone()), sockets)
            .with_keep_alive(Duration::from_secs(1));

        let server = RelayServer::bind("127.0.0.1:0", state.clone()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let stop = CancellationToken::new();
        let server_stop = stop.clone();
        let server = tokio::spawn(async move {
            let _ = server
                .run(async move { server_stop.cancelled().await })
                .await;
        });

        Self {
            addr,
            store,
            state,
            verifier,
            stop,
            server: Some(server),
        }
    }

    pub fn http_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn token(&self, user: &str) -> String {
        self.verifier.issue_for(user, "user", Duration::from_secs(3_600))
    }

    pub fn session(&self) -> SessionId {
        SessionId::from(SESSION)
    }

    /// Trigger graceful shutdown and wait for the server task
    pub async fn shutdown(&mut self) {
        self.stop.cancel();
        if let Some(server) = self.server.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), server).await;
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
