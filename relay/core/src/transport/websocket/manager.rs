//! Socket Session Manager
//!
//! Owns every full-duplex connection: handshake, reader loop, writer task,
//! per-generation forwarding tasks and the heartbeat task.
//!
//! # Per-connection tasks
//!
//! ```text
//!            ┌──────────── reader loop ────────────┐
//!  socket ──►│ parse ─► ping → pong                │
//!            │        ─► cancel → token.cancel()   │
//!            │        ─► send_message → spawn ─────┼──► forward task (per generation)
//!            └─────────────────────────────────────┘          │
//!                                                             ▼
//!  socket ◄── writer task ◄── bounded outbound queue ◄── ServerMessage
//! ```
//!
//! Failures stay inside their connection: a malformed frame yields an
//! `error` message, a write failure closes only that socket and cancels its
//! generations.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message};
use dashmap::DashMap;
use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::protocol::{
    ClientMessage, ServerMessage, CLOSE_AUTH_FAILED, CLOSE_GOING_AWAY, CLOSE_NORMAL,
};
use super::registry::{
    ConnectionHandle, ConnectionId, ConnectionRegistry, Outbound, RegistryStats, SocketConnection,
};
use crate::auth::Identity;
use crate::error::AuthError;
use crate::messages::GenerationId;
use crate::streaming::{StreamMultiplexer, TurnEvent, TurnRequest};
use crate::transport::heartbeat::{HeartbeatConfig, HeartbeatTask};

// ============================================================================
// Configuration
// ============================================================================

/// Socket transport settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Largest accepted inbound message in bytes
    pub max_message_bytes: usize,
    /// Capacity of each connection's outbound queue
    pub outbound_capacity: usize,
    /// Longest a single frame write may block before the socket is dropped
    pub write_timeout_ms: u64,
    /// Ping interval and liveness timeout
    pub heartbeat: HeartbeatConfig,
}

impl SocketConfig {
    /// Write deadline as a [`Duration`]
    #[must_use]
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: 64 * 1024,
            outbound_capacity: 64,
            write_timeout_ms: 10_000,
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

// ============================================================================
// Manager
// ============================================================================

type Generations = Arc<DashMap<GenerationId, CancellationToken>>;

struct ManagerInner {
    multiplexer: StreamMultiplexer,
    registry: ConnectionRegistry,
    config: SocketConfig,
    shutdown: CancellationToken,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

/// Full-duplex connection manager
///
/// Lifecycle: [`start`](Self::start) spawns the heartbeat task,
/// [`shutdown`](Self::shutdown) closes every connection and stops it. A
/// manager is not restartable.
#[derive(Clone)]
pub struct SocketManager {
    inner: Arc<ManagerInner>,
}

impl SocketManager {
    /// Create a stopped manager
    #[must_use]
    pub fn new(multiplexer: StreamMultiplexer, config: SocketConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                multiplexer,
                registry: ConnectionRegistry::new(),
                config,
                shutdown: CancellationToken::new(),
                heartbeat: Mutex::new(None),
            }),
        }
    }

    /// Settings
    #[must_use]
    pub fn config(&self) -> &SocketConfig {
        &self.inner.config
    }

    /// Connection registry
    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    /// Number of open connections
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.registry.count()
    }

    /// Registry statistics
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        self.inner.registry.stats()
    }

    /// Whether the heartbeat task is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.heartbeat.lock().is_some() && !self.inner.shutdown.is_cancelled()
    }

    /// Spawn the heartbeat task (idempotent)
    pub fn start(&self) {
        if self.inner.shutdown.is_cancelled() {
            tracing::warn!("Socket manager already shut down, not starting");
            return;
        }
        let mut slot = self.inner.heartbeat.lock();
        if slot.is_some() {
            return;
        }
        let task = HeartbeatTask::new(
            self.inner.config.heartbeat.clone(),
            self.inner.registry.clone(),
            self.inner.shutdown.child_token(),
        );
        *slot = Some(tokio::spawn(task.run()));
        tracing::info!("Socket manager started");
    }

    /// Close every connection and stop the heartbeat task
    pub async fn shutdown(&self) {
        let handles = self.inner.registry.handles();
        tracing::info!(connections = handles.len(), "Shutting down socket manager");
        for (_, handle) in handles {
            handle.close(CLOSE_GOING_AWAY, "server shutting down");
        }
        self.inner.shutdown.cancel();

        let task = self.inner.heartbeat.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Heartbeat task ended abnormally");
            }
        }
    }

    /// Close a socket whose handshake failed
    pub async fn reject<S>(mut socket: S, error: &AuthError)
    where
        S: Sink<Message, Error = axum::Error> + Unpin,
    {
        tracing::warn!(error = %error, "Socket handshake rejected");
        let reason = match error {
            AuthError::Missing => "missing token",
            AuthError::Invalid(_) => "invalid token",
            AuthError::Expired => "token expired",
        };
        let frame = CloseFrame {
            code: CLOSE_AUTH_FAILED,
            reason: reason.into(),
        };
        let _ = socket.send(Message::Close(Some(frame))).await;
        let _ = socket.close().await;
    }

    /// Serve an authenticated socket until it closes
    pub async fn serve<S>(&self, socket: S, identity: Identity)
    where
        S: Stream<Item = Result<Message, axum::Error>>
            + Sink<Message, Error = axum::Error>
            + Send
            + 'static,
    {
        let connection_id = ConnectionId::new();
        let span = tracing::info_span!(
            "connection",
            connection_id = %connection_id,
            user_id = %identity.user_id
        );
        self.connection_loop(socket, identity, connection_id)
            .instrument(span)
            .await;
    }

    async fn connection_loop<S>(&self, socket: S, identity: Identity, connection_id: ConnectionId)
    where
        S: Stream<Item = Result<Message, axum::Error>>
            + Sink<Message, Error = axum::Error>
            + Send
            + 'static,
    {
        let (sink, mut stream) = socket.split();
        let cancel = self.inner.shutdown.child_token();
        let (tx, rx) = mpsc::channel(self.inner.config.outbound_capacity.max(1));
        let handle = ConnectionHandle::new(tx, cancel.clone());
        let writer = tokio::spawn(
            write_loop(sink, rx, handle.clone(), self.inner.config.write_timeout()).in_current_span(),
        );

        if self.inner.shutdown.is_cancelled() {
            handle.close(CLOSE_GOING_AWAY, "server shutting down");
            let _ = writer.await;
            return;
        }

        self.inner.registry.register(
            SocketConnection::new(connection_id, identity.user_id.clone()),
            handle.clone(),
        );
        handle
            .send(ServerMessage::Connected {
                connection_id: connection_id.to_string(),
            })
            .await;

        let generations: Generations = Arc::default();

        loop {
            let frame = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                frame = stream.next() => frame,
            };
            let message = match frame {
                None => {
                    tracing::debug!("Client ended the stream");
                    break;
                }
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "Socket read failed");
                    break;
                }
                Some(Ok(message)) => message,
            };

            self.inner.registry.touch(&connection_id);

            match message {
                Message::Text(text) => {
                    self.handle_text(text.as_str(), &identity, &handle, &generations)
                        .await;
                }
                Message::Binary(_) => {
                    handle
                        .send(ServerMessage::error(
                            "binary frames are not supported",
                            "invalid_request",
                        ))
                        .await;
                }
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Close(_) => {
                    tracing::debug!("Client sent close");
                    break;
                }
            }
        }

        let cancelled = generations.len();
        for entry in generations.iter() {
            entry.value().cancel();
        }
        generations.clear();
        self.inner.registry.unregister(&connection_id);
        handle.close(CLOSE_NORMAL, "connection closed");
        if let Err(e) = writer.await {
            tracing::warn!(error = %e, "Writer task ended abnormally");
        }
        tracing::debug!(cancelled_generations = cancelled, "Connection finished");
    }

    async fn handle_text(
        &self,
        text: &str,
        identity: &Identity,
        handle: &ConnectionHandle,
        generations: &Generations,
    ) {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed client message");
                handle
                    .send(ServerMessage::error(
                        format!("malformed message: {e}"),
                        "invalid_request",
                    ))
                    .await;
                return;
            }
        };

        match message {
            ClientMessage::Ping => {
                handle.send(ServerMessage::Pong).await;
            }
            ClientMessage::Cancel { message_id } => match generations.remove(&message_id) {
                Some((_, token)) => {
                    tracing::info!(generation_id = %message_id, "Client cancelled generation");
                    token.cancel();
                }
                None => {
                    tracing::debug!(generation_id = %message_id, "Cancel for unknown generation");
                }
            },
            ClientMessage::SendMessage {
                session_id,
                content,
                agent_id,
                model_override,
                context_data,
            } => {
                let request = TurnRequest {
                    user_id: identity.user_id.clone(),
                    session_id,
                    content,
                    agent_id,
                    model_override,
                    context_data,
                };
                tokio::spawn(
                    forward_turn(
                        self.inner.multiplexer.clone(),
                        request,
                        handle.clone(),
                        Arc::clone(generations),
                    )
                    .in_current_span(),
                );
            }
        }
    }
}

impl std::fmt::Debug for SocketManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketManager")
            .field("connections", &self.connection_count())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Run one generation and relay its events to the socket
async fn forward_turn(
    multiplexer: StreamMultiplexer,
    request: TurnRequest,
    handle: ConnectionHandle,
    generations: Generations,
) {
    let mut turn = match multiplexer.start_turn(request).await {
        Ok(turn) => turn,
        Err(e) => {
            tracing::info!(error = %e, code = e.code(), "Send rejected");
            handle.send(ServerMessage::error(e.to_string(), e.code())).await;
            return;
        }
    };

    let generation_id = turn.generation_id.clone();
    generations.insert(generation_id.clone(), turn.cancel.clone());

    let started = handle
        .send(ServerMessage::MessageStart {
            message_id: generation_id.clone(),
            agent_id: turn.agent_id.clone(),
        })
        .await;

    if started {
        // After a server-side cancel only the terminal event is still forwarded
        let mut draining = false;
        loop {
            let event = tokio::select! {
                biased;
                () = turn.cancel.cancelled(), if !draining => {
                    // A client cancel removes the entry first and expects silence
                    if !generations.contains_key(&generation_id) || handle.cancel_token().is_cancelled() {
                        break;
                    }
                    draining = true;
                    continue;
                }
                event = turn.events.recv() => event,
            };
            let Some(event) = event else { break };
            let terminal = event.is_terminal();
            if draining && !terminal {
                continue;
            }

            let message = match event {
                TurnEvent::Chunk { content } => ServerMessage::Chunk {
                    message_id: generation_id.clone(),
                    content,
                },
                TurnEvent::Done {
                    message_id,
                    content,
                    chunk_count,
                } => ServerMessage::MessageDone {
                    message_id,
                    content,
                    chunk_count,
                    generation_id: Some(generation_id.clone()),
                },
                TurnEvent::Error { message, code } => ServerMessage::Error {
                    message,
                    code: Some(code.to_string()),
                    message_id: Some(generation_id.clone()),
                },
            };

            if !handle.send(message).await {
                turn.cancel.cancel();
                break;
            }
            if terminal {
                break;
            }
        }
    } else {
        turn.cancel.cancel();
    }

    generations.remove(&generation_id);
}

/// Drain the outbound queue into the socket, then send the close frame
///
/// Every write is bounded by `write_timeout`; a peer that stopped reading
/// loses its socket instead of parking this task.
async fn write_loop<K>(
    mut sink: K,
    mut rx: mpsc::Receiver<Outbound>,
    handle: ConnectionHandle,
    write_timeout: Duration,
) where
    K: Sink<Message, Error = axum::Error> + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            () = handle.cancel_token().cancelled() => None,
            item = rx.recv() => item,
        };
        let Some(item) = next else { break };

        if !write_frame(&mut sink, item, write_timeout).await {
            handle.cancel_token().cancel();
            return;
        }
    }

    // Messages queued before the close (a final message_done or error) go first
    while let Ok(item) = rx.try_recv() {
        if matches!(item, Outbound::Ping) {
            continue;
        }
        if !write_frame(&mut sink, item, write_timeout).await {
            return;
        }
    }

    let (code, reason) = handle
        .close_reason()
        .unwrap_or((CLOSE_NORMAL, "closing".to_string()));
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = tokio::time::timeout(write_timeout, sink.send(Message::Close(Some(frame)))).await;
    let _ = tokio::time::timeout(write_timeout, sink.close()).await;
}

/// Write one queued item; `false` once the socket is unusable
async fn write_frame<K>(sink: &mut K, item: Outbound, write_timeout: Duration) -> bool
where
    K: Sink<Message, Error = axum::Error> + Unpin,
{
    let frame = match item {
        Outbound::Message(message) => match serde_json::to_string(&message) {
            Ok(json) => Message::Text(json.into()),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode server message");
                return true;
            }
        },
        Outbound::Ping => Message::Ping(Bytes::new()),
    };

    match tokio::time::timeout(write_timeout, sink.send(frame)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "Socket write failed, closing connection");
            false
        }
        Err(_) => {
            tracing::warn!(timeout = ?write_timeout, "Socket write stalled, dropping connection");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;

    #[test]
    fn test_default_config() {
        let config = SocketConfig::default();
        assert_eq!(config.max_message_bytes, 65_536);
        assert!(config.heartbeat.enabled);
    }

    #[tokio::test]
    async fn test_reject_sends_4001() {
        let (tx, mut rx) = fmpsc::unbounded::<Message>();
        let sink = tx.sink_map_err(axum::Error::new);
        SocketManager::reject(sink, &AuthError::Expired).await;
        match rx.next().await {
            Some(Message::Close(Some(frame))) => {
                assert_eq!(frame.code, CLOSE_AUTH_FAILED);
                assert_eq!(frame.reason.as_str(), "token expired");
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_writer_sends_queued_messages_then_close_reason() {
        let (sink_tx, mut sink_rx) = fmpsc::unbounded::<Message>();
        let sink = sink_tx.sink_map_err(axum::Error::new);
        let (tx, rx) = mpsc::channel(8);
        let handle = ConnectionHandle::new(tx.clone(), CancellationToken::new());

        let writer = tokio::spawn(write_loop(sink, rx, handle.clone(), Duration::from_secs(1)));
        tx.send(Outbound::Message(ServerMessage::Pong)).await.unwrap();
        tx.send(Outbound::Ping).await.unwrap();

        match sink_rx.next().await {
            Some(Message::Text(text)) => assert_eq!(text.as_str(), r#"{"type":"pong"}"#),
            other => panic!("unexpected frame {other:?}"),
        }
        assert!(matches!(sink_rx.next().await, Some(Message::Ping(_))));

        handle.close(4008, "heartbeat timeout");
        writer.await.unwrap();
        match sink_rx.next().await {
            Some(Message::Close(Some(frame))) => assert_eq!(frame.code, 4008),
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_writer_flushes_final_message_queued_before_close() {
        let (sink_tx, mut sink_rx) = fmpsc::unbounded::<Message>();
        let sink = sink_tx.sink_map_err(axum::Error::new);
        let (tx, rx) = mpsc::channel(8);
        let handle = ConnectionHandle::new(tx.clone(), CancellationToken::new());

        tx.send(Outbound::Message(ServerMessage::error("too late", "upstream_error")))
            .await
            .unwrap();
        tx.send(Outbound::Ping).await.unwrap();
        handle.close(CLOSE_GOING_AWAY, "server shutting down");

        write_loop(sink, rx, handle, Duration::from_secs(1)).await;

        match sink_rx.next().await {
            Some(Message::Text(text)) => assert!(text.as_str().contains("too late")),
            other => panic!("expected the queued error, got {other:?}"),
        }
        match sink_rx.next().await {
            Some(Message::Close(Some(frame))) => assert_eq!(frame.code, CLOSE_GOING_AWAY),
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_writer_drops_peer_that_stopped_reading() {
        // Room for one frame; the receiver never reads
        let (sink_tx, _sink_rx) = fmpsc::channel::<Message>(0);
        let sink = sink_tx.sink_map_err(axum::Error::new);
        let (tx, rx) = mpsc::channel(8);
        let handle = ConnectionHandle::new(tx.clone(), CancellationToken::new());

        let writer = tokio::spawn(write_loop(sink, rx, handle.clone(), Duration::from_secs(2)));
        for _ in 0..3 {
            tx.send(Outbound::Message(ServerMessage::Pong)).await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(10), writer)
            .await
            .expect("writer stuck on a stalled peer")
            .unwrap();
        assert!(handle.cancel_token().is_cancelled());
    }
}
