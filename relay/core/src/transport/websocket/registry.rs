//! Connection Registry
//!
//! Tracks every open socket: who owns it, when it was last heard from, and
//! the handle used to write to or close it.
//!
//! # Architecture
//!
//! ```text
//!                    ConnectionRegistry
//!       ┌─────────────────────────────────────────────┐
//!       │ HashMap<ConnectionId, (SocketConnection,     │
//!       │                        ConnectionHandle)>    │
//!       │   - wrapped in Arc<RwLock<>>                 │
//!       └──────────────┬──────────────────────────────┘
//!                      │
//!        ┌─────────────┼──────────────┐
//!        │             │              │
//!    reader task   writer task   heartbeat task
//!    (touch)       (outbound)    (ping / reap)
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::protocol::ServerMessage;

/// Unique identifier for a socket connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create a new unique connection ID
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Get the raw numeric value
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// An authenticated socket
#[derive(Debug, Clone)]
pub struct SocketConnection {
    /// Registry id
    pub connection_id: ConnectionId,
    /// Authenticated user
    pub user_id: String,
    /// When the handshake completed
    pub connected_at: Instant,
    /// Last liveness signal (any inbound frame)
    pub last_seen: Instant,
}

impl SocketConnection {
    /// Create a connection record stamped now
    pub fn new(connection_id: ConnectionId, user_id: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            connection_id,
            user_id: user_id.into(),
            connected_at: now,
            last_seen: now,
        }
    }
}

/// Item queued for a connection's writer task
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// JSON protocol message
    Message(ServerMessage),
    /// Protocol-level ping frame
    Ping,
}

/// Writes to and closes one connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    outbound: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    close_reason: Arc<Mutex<Option<(u16, String)>>>,
}

impl ConnectionHandle {
    /// Create a handle around the writer queue
    #[must_use]
    pub fn new(outbound: mpsc::Sender<Outbound>, cancel: CancellationToken) -> Self {
        Self {
            outbound,
            cancel,
            close_reason: Arc::new(Mutex::new(None)),
        }
    }

    /// Queue a message, waiting for capacity
    ///
    /// Returns false once the writer is gone.
    pub async fn send(&self, message: ServerMessage) -> bool {
        self.outbound.send(Outbound::Message(message)).await.is_ok()
    }

    /// Queue a ping frame without waiting
    ///
    /// A full queue means the connection is busy; the ping is skipped.
    pub fn try_ping(&self) -> bool {
        self.outbound.try_send(Outbound::Ping).is_ok()
    }

    /// Close the connection with `code`
    ///
    /// The first close reason wins.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some((code, reason.into()));
            }
        }
        self.cancel.cancel();
    }

    /// Close code and reason, if a close was requested
    #[must_use]
    pub fn close_reason(&self) -> Option<(u16, String)> {
        self.close_reason.lock().clone()
    }

    /// Token cancelled when the connection closes
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the connection is closing or closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.outbound.is_closed()
    }
}

/// Registry snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Open connections
    pub connections: usize,
    /// Distinct users across connections
    pub users: usize,
}

/// Thread-safe registry of open connections
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<ConnectionId, (SocketConnection, ConnectionHandle)>>>,
}

impl ConnectionRegistry {
    /// Create a new empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection
    pub fn register(&self, connection: SocketConnection, handle: ConnectionHandle) {
        let id = connection.connection_id;
        let user_id = connection.user_id.clone();
        self.inner.write().insert(id, (connection, handle));
        tracing::info!(connection_id = %id, user_id = %user_id, "Socket registered");
    }

    /// Remove a connection, returning its handle
    pub fn unregister(&self, id: &ConnectionId) -> Option<ConnectionHandle> {
        let removed = self.inner.write().remove(id);
        if removed.is_some() {
            tracing::info!(connection_id = %id, "Socket unregistered");
        }
        removed.map(|(_, handle)| handle)
    }

    /// Record a liveness signal
    pub fn touch(&self, id: &ConnectionId) {
        if let Some((connection, _)) = self.inner.write().get_mut(id) {
            connection.last_seen = Instant::now();
        }
    }

    /// Connections silent for longer than `timeout`
    #[must_use]
    pub fn stale(&self, timeout: Duration) -> Vec<ConnectionId> {
        let now = Instant::now();
        self.inner
            .read()
            .values()
            .filter(|(connection, _)| now.duration_since(connection.last_seen) > timeout)
            .map(|(connection, _)| connection.connection_id)
            .collect()
    }

    /// Handle of one connection
    #[must_use]
    pub fn handle(&self, id: &ConnectionId) -> Option<ConnectionHandle> {
        self.inner.read().get(id).map(|(_, handle)| handle.clone())
    }

    /// Connection record
    #[must_use]
    pub fn connection(&self, id: &ConnectionId) -> Option<SocketConnection> {
        self.inner.read().get(id).map(|(connection, _)| connection.clone())
    }

    /// Handles of all connections
    ///
    /// Cloned out so no lock is held while writing.
    #[must_use]
    pub fn handles(&self) -> Vec<(ConnectionId, ConnectionHandle)> {
        self.inner
            .read()
            .iter()
            .map(|(id, (_, handle))| (*id, handle.clone()))
            .collect()
    }

    /// Number of open connections
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether a connection is registered
    #[must_use]
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.inner.read().contains_key(id)
    }

    /// Registry snapshot
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let inner = self.inner.read();
        let users: HashSet<&str> = inner
            .values()
            .map(|(connection, _)| connection.user_id.as_str())
            .collect();
        RegistryStats {
            connections: inner.len(),
            users: users.len(),
        }
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("count", &self.count())
            .finish()
    }
}
