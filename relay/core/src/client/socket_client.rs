//! Socket client
//!
//! Speaks the full-duplex protocol over tokio-tungstenite. One connection
//! carries many responses: a reader task routes `chunk`/`message_done`/
//! `error` messages by generation id to a per-response channel, and a
//! writer task serializes outbound [`ClientMessage`]s.
//!
//! Sends on one connection are serialized until the server answers with
//! `message_start` (or an error), so each answer pairs with its request.
//!
//! [`SocketConnector`] adds bounded reconnection with backoff and publishes
//! [`ConnectionStatus`] changes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::events::ClientEvent;
use super::retry::{ConnectionStatus, ReconnectPolicy};
use super::source::EventSource;
use crate::error::{ClientError, SendError, CODE_SUPERSEDED};
use crate::messages::{AgentId, GenerationId, SessionId};
use crate::transport::websocket::{ClientMessage, ServerMessage};
use crate::transport::SendRequest;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type EventSender = mpsc::Sender<Result<ClientEvent, ClientError>>;

const EVENT_CAPACITY: usize = 256;
const OUTBOUND_CAPACITY: usize = 64;

/// A response the server accepted
struct Started {
    generation_id: GenerationId,
    agent_id: AgentId,
    events: mpsc::Receiver<Result<ClientEvent, ClientError>>,
}

type StartWaiter = oneshot::Sender<Result<Started, SendError>>;

/// A send waiting for `message_start`
struct PendingStart {
    session_id: SessionId,
    waiter: StartWaiter,
}

/// Where one open response's events go
struct Route {
    session_id: SessionId,
    agent_id: AgentId,
    tx: EventSender,
}

struct SocketInner {
    connection_id: String,
    outbound: mpsc::Sender<ClientMessage>,
    routes: DashMap<GenerationId, Route>,
    pending_start: Mutex<Option<PendingStart>>,
    send_lock: tokio::sync::Mutex<()>,
    status: Arc<watch::Sender<ConnectionStatus>>,
    close_code: Mutex<Option<u16>>,
    closed: CancellationToken,
}

impl SocketInner {
    async fn dispatch(&self, text: &str) {
        let message: ServerMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(conn_id = %self.connection_id, error = %e, "Ignoring malformed server message");
                return;
            }
        };

        match message {
            ServerMessage::MessageStart {
                message_id,
                agent_id,
            } => {
                let Some(pending) = self.pending_start.lock().take() else {
                    tracing::warn!(generation_id = %message_id, "message_start with no send waiting");
                    return;
                };
                self.close_superseded(&pending.session_id, &agent_id);

                let (tx, events) = mpsc::channel(EVENT_CAPACITY);
                self.routes.insert(
                    message_id.clone(),
                    Route {
                        session_id: pending.session_id,
                        agent_id: agent_id.clone(),
                        tx,
                    },
                );
                let started = Started {
                    generation_id: message_id.clone(),
                    agent_id,
                    events,
                };
                if pending.waiter.send(Ok(started)).is_err() {
                    self.routes.remove(&message_id);
                }
            }
            ServerMessage::Chunk {
                message_id,
                content,
            } => {
                self.route(&message_id, ClientEvent::Chunk { content }, false)
                    .await;
            }
            ServerMessage::MessageDone {
                message_id,
                content,
                generation_id,
                ..
            } => match generation_id.or_else(|| self.sole_route()) {
                Some(generation_id) => {
                    let done = ClientEvent::Done {
                        message_id,
                        content: Some(content),
                    };
                    self.route(&generation_id, done, true).await;
                }
                None => tracing::warn!(message_id = %message_id, "Uncorrelated message_done"),
            },
            ServerMessage::Error {
                message,
                code,
                message_id: Some(generation_id),
            } => {
                self.route(&generation_id, ClientEvent::Error { message, code }, true)
                    .await;
            }
            ServerMessage::Error {
                message,
                code,
                message_id: None,
            } => {
                let pending = self.pending_start.lock().take();
                match pending {
                    Some(pending) => {
                        let code = code.as_deref().unwrap_or("error");
                        let _ = pending.waiter.send(Err(SendError::from_code(code, message)));
                    }
                    None => tracing::warn!(conn_id = %self.connection_id, error = %message, "Server error"),
                }
            }
            ServerMessage::Connected { .. } | ServerMessage::Pong => {}
        }
    }

    /// A new response for (session, agent) ends any older one still open
    fn close_superseded(&self, session_id: &SessionId, agent_id: &AgentId) {
        let stale: Vec<GenerationId> = self
            .routes
            .iter()
            .filter(|entry| &entry.session_id == session_id && &entry.agent_id == agent_id)
            .map(|entry| entry.key().clone())
            .collect();
        for generation_id in stale {
            if let Some((_, route)) = self.routes.remove(&generation_id) {
                tracing::debug!(generation_id = %generation_id, "Closing superseded response");
                let _ = route.tx.try_send(Ok(ClientEvent::Error {
                    message: "superseded by a newer message".to_string(),
                    code: Some(CODE_SUPERSEDED.to_string()),
                }));
            }
        }
    }

    async fn route(&self, generation_id: &GenerationId, event: ClientEvent, terminal: bool) {
        let sender = if terminal {
            self.routes.remove(generation_id).map(|(_, route)| route.tx)
        } else {
            self.routes.get(generation_id).map(|route| route.tx.clone())
        };

        let Some(sender) = sender else {
            tracing::debug!(generation_id = %generation_id, "Dropping event for untracked response");
            return;
        };
        if sender.send(Ok(event)).await.is_err() {
            // Consumer went away (cancelled or dropped)
            self.routes.remove(generation_id);
        }
    }

    fn sole_route(&self) -> Option<GenerationId> {
        if self.routes.len() == 1 {
            self.routes.iter().next().map(|entry| entry.key().clone())
        } else {
            None
        }
    }

    /// Runs once, from the reader task
    fn shutdown(&self, code: Option<u16>) {
        *self.close_code.lock() = code;
        self.closed.cancel();

        let closed = || ClientError::Transport("connection closed".to_string());
        if let Some(pending) = self.pending_start.lock().take() {
            let _ = pending.waiter.send(Err(SendError::Transport(closed())));
        }
        let open: Vec<GenerationId> = self.routes.iter().map(|e| e.key().clone()).collect();
        for generation_id in open {
            if let Some((_, route)) = self.routes.remove(&generation_id) {
                let _ = route.tx.try_send(Err(closed()));
            }
        }

        self.status.send_replace(ConnectionStatus::Disconnected { code });
        tracing::info!(conn_id = %self.connection_id, code = ?code, "Socket closed");
    }
}

/// One open socket connection
#[derive(Clone)]
pub struct SocketClient {
    inner: Arc<SocketInner>,
    reply_timeout: Duration,
}

impl std::fmt::Debug for SocketClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketClient")
            .field("connection_id", &self.inner.connection_id)
            .field("open_responses", &self.inner.routes.len())
            .finish_non_exhaustive()
    }
}

impl SocketClient {
    /// Connect once to `url` (e.g. `ws://127.0.0.1:8080/ws`) with `token`
    ///
    /// # Errors
    ///
    /// [`ClientError::Rejected`] if the server closes the handshake (4001
    /// for a bad token), [`ClientError::Connect`] for anything else.
    pub async fn connect(url: &str, token: &str, reply_timeout: Duration) -> Result<Self, ClientError> {
        let (status, _) = watch::channel(ConnectionStatus::Connecting);
        Self::connect_reporting(url, token, reply_timeout, Arc::new(status)).await
    }

    async fn connect_reporting(
        url: &str,
        token: &str,
        reply_timeout: Duration,
        status: Arc<watch::Sender<ConnectionStatus>>,
    ) -> Result<Self, ClientError> {
        let separator = if url.contains('?') { '&' } else { '?' };
        let target = format!("{url}{separator}token={token}");

        let (mut socket, _response) = tokio_tungstenite::connect_async(target)
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;

        let connection_id = tokio::time::timeout(reply_timeout, handshake(&mut socket))
            .await
            .map_err(|_| ClientError::Connect("handshake timed out".to_string()))??;

        let (sink, stream) = socket.split();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let inner = Arc::new(SocketInner {
            connection_id: connection_id.clone(),
            outbound,
            routes: DashMap::new(),
            pending_start: Mutex::new(None),
            send_lock: tokio::sync::Mutex::new(()),
            status,
            close_code: Mutex::new(None),
            closed: CancellationToken::new(),
        });

        tokio::spawn(write_loop(sink, outbound_rx, inner.closed.clone()));
        tokio::spawn(read_loop(stream, Arc::clone(&inner)));

        inner.status.send_replace(ConnectionStatus::Connected {
            connection_id: connection_id.clone(),
        });
        tracing::info!(conn_id = %connection_id, "Socket connected");

        Ok(Self { inner, reply_timeout })
    }

    /// Server-assigned connection id
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.inner.connection_id
    }

    /// Watch connection state
    #[must_use]
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Whether the connection has ended
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Wait until the connection ends
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }

    /// Close code the server sent, if any
    #[must_use]
    pub fn close_code(&self) -> Option<u16> {
        *self.inner.close_code.lock()
    }

    /// Application-level ping; the server answers `pong`
    ///
    /// # Errors
    ///
    /// [`ClientError::Transport`] if the connection is gone.
    pub async fn ping(&self) -> Result<(), ClientError> {
        self.inner
            .outbound
            .send(ClientMessage::Ping)
            .await
            .map_err(|_| ClientError::Transport("connection closed".to_string()))
    }

    /// Send a user message and return the response's event source
    ///
    /// # Errors
    ///
    /// Server refusals are classified by code; a missing answer within the
    /// reply timeout or a dropped connection is [`SendError::Transport`].
    pub async fn send_message(&self, request: &SendRequest) -> Result<SocketEventSource, SendError> {
        let _serial = self.inner.send_lock.lock().await;
        if self.is_closed() {
            return Err(ClientError::Transport("connection closed".to_string()).into());
        }

        let (waiter, answer) = oneshot::channel();
        *self.inner.pending_start.lock() = Some(PendingStart {
            session_id: request.session_id.clone(),
            waiter,
        });

        let message = ClientMessage::SendMessage {
            session_id: request.session_id.clone(),
            content: request.content.clone(),
            agent_id: request.agent_id.clone(),
            model_override: request.model_override.clone(),
            context_data: request.context_data.clone(),
        };
        if self.inner.outbound.send(message).await.is_err() {
            self.inner.pending_start.lock().take();
            return Err(ClientError::Transport("connection closed".to_string()).into());
        }

        let started = match tokio::time::timeout(self.reply_timeout, answer).await {
            Ok(Ok(started)) => started?,
            Ok(Err(_)) => return Err(ClientError::Transport("connection closed".to_string()).into()),
            Err(_) => {
                self.inner.pending_start.lock().take();
                return Err(ClientError::Transport("no reply to send_message".to_string()).into());
            }
        };

        tracing::debug!(
            conn_id = %self.inner.connection_id,
            generation_id = %started.generation_id,
            "Response started"
        );
        Ok(SocketEventSource {
            generation_id: started.generation_id,
            agent_id: started.agent_id,
            events: started.events,
            outbound: self.inner.outbound.clone(),
        })
    }

    /// Close the connection normally
    pub fn close(&self) {
        self.inner.closed.cancel();
    }
}

async fn handshake(socket: &mut Socket) -> Result<String, ClientError> {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => {
                return match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(ServerMessage::Connected { connection_id }) => Ok(connection_id),
                    Ok(other) => Err(ClientError::Connect(format!("unexpected handshake message: {other:?}"))),
                    Err(e) => Err(ClientError::Connect(e.to_string())),
                };
            }
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = frame
                    .map(|f| (u16::from(f.code), f.reason.to_string()))
                    .unwrap_or((1005, String::new()));
                return Err(ClientError::Rejected { code, reason });
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(ClientError::Connect(e.to_string())),
            None => return Err(ClientError::Connect("closed during handshake".to_string())),
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<Socket, Message>,
    mut outbound: mpsc::Receiver<ClientMessage>,
    closed: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            () = closed.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }

            message = outbound.recv() => {
                let Some(message) = message else { break };
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to encode client message");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    tracing::warn!(error = %e, "Socket write failed");
                    closed.cancel();
                    break;
                }
            }
        }
    }
}

async fn read_loop(mut stream: SplitStream<Socket>, inner: Arc<SocketInner>) {
    let code = loop {
        tokio::select! {
            biased;

            () = inner.closed.cancelled() => break None,

            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => inner.dispatch(&text).await,
                Some(Ok(Message::Close(frame))) => break frame.map(|f| u16::from(f.code)),
                // Pings are answered by tungstenite
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(conn_id = %inner.connection_id, error = %e, "Socket read failed");
                    break None;
                }
                None => break None,
            },
        }
    };
    inner.shutdown(code);
}

/// Events of one response on a shared socket
#[derive(Debug)]
pub struct SocketEventSource {
    generation_id: GenerationId,
    agent_id: AgentId,
    events: mpsc::Receiver<Result<ClientEvent, ClientError>>,
    outbound: mpsc::Sender<ClientMessage>,
}

impl SocketEventSource {
    /// Server generation id
    #[must_use]
    pub fn generation_id(&self) -> &GenerationId {
        &self.generation_id
    }

    /// Agent answering
    #[must_use]
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }
}

#[async_trait]
impl EventSource for SocketEventSource {
    async fn next_event(&mut self) -> Option<Result<ClientEvent, ClientError>> {
        self.events.recv().await
    }

    async fn cancel(&mut self) {
        let cancel = ClientMessage::Cancel {
            message_id: self.generation_id.clone(),
        };
        if self.outbound.send(cancel).await.is_err() {
            tracing::debug!(generation_id = %self.generation_id, "Connection already closed");
        }
        self.events.close();
    }
}

/// Connects with bounded retries and publishes progress
pub struct SocketConnector {
    url: String,
    token: String,
    policy: ReconnectPolicy,
    reply_timeout: Duration,
    status: Arc<watch::Sender<ConnectionStatus>>,
}

impl SocketConnector {
    /// Create a connector for `url` using `policy`
    #[must_use]
    pub fn new(url: impl Into<String>, token: impl Into<String>, policy: ReconnectPolicy) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Connecting);
        Self {
            url: url.into(),
            token: token.into(),
            policy,
            reply_timeout: Duration::from_secs(10),
            status: Arc::new(status),
        }
    }

    /// Time to wait for handshake and send replies
    #[must_use]
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Watch connection state across attempts
    #[must_use]
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Connect, retrying with backoff
    ///
    /// A rejected handshake is not retried.
    ///
    /// # Errors
    ///
    /// [`ClientError::Rejected`] for a refused token and
    /// [`ClientError::ReconnectExhausted`] once attempts run out (after
    /// publishing [`ConnectionStatus::Failed`]).
    pub async fn connect(&self) -> Result<SocketClient, ClientError> {
        self.status.send_replace(ConnectionStatus::Connecting);
        let mut attempts = 0u32;

        loop {
            let result =
                SocketClient::connect_reporting(&self.url, &self.token, self.reply_timeout, Arc::clone(&self.status))
                    .await;

            match result {
                Ok(client) => return Ok(client),
                Err(ClientError::Rejected { code, reason }) => {
                    tracing::warn!(code, reason = %reason, "Socket handshake rejected");
                    self.status
                        .send_replace(ConnectionStatus::Disconnected { code: Some(code) });
                    return Err(ClientError::Rejected { code, reason });
                }
                Err(e) => {
                    attempts += 1;
                    if !self.policy.allows(attempts) {
                        tracing::error!(attempts, error = %e, "Giving up on socket connection");
                        self.status.send_replace(ConnectionStatus::Failed { attempts });
                        return Err(ClientError::ReconnectExhausted { attempts });
                    }

                    let delay = self.policy.delay_for_attempt(attempts - 1);
                    tracing::warn!(
                        attempt = attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Socket connection failed, retrying"
                    );
                    self.status.send_replace(ConnectionStatus::Reconnecting {
                        attempt: attempts,
                        delay,
                    });
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test(start_paused = true)]
    async fn test_connector_gives_up_and_reports_failed() {
        // Bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let policy = ReconnectPolicy {
            max_attempts: 3,
            initial_delay_ms: 10,
            max_delay_ms: 50,
            jitter: false,
            ..Default::default()
        };
        let connector = SocketConnector::new(format!("ws://{addr}/ws"), "token", policy);
        let status = connector.status();

        let err = connector.connect().await.unwrap_err();

        assert_eq!(err, ClientError::ReconnectExhausted { attempts: 3 });
        assert_eq!(*status.borrow(), ConnectionStatus::Failed { attempts: 3 });
    }
}
