//! Heartbeat Enforcement for Socket Connections
//!
//! The server pings every open socket each `interval`. Any inbound frame
//! (pong, `ping` message, or anything else) counts as a liveness signal. A
//! connection silent for longer than `timeout` is closed with code 4008 and
//! removed from the registry.
//!
//! # Timeline
//!
//! ```text
//! t=0        ping ──►                         (client answers with pong)
//! t=interval ping ──►                         (no answer)
//! ...
//! last_seen + timeout  ──► close 4008, unregister, cancel generations
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::websocket::protocol::CLOSE_HEARTBEAT_TIMEOUT;
use super::websocket::registry::ConnectionRegistry;

/// Configuration for heartbeat behavior
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Interval between pings in milliseconds (default: 30 seconds)
    pub interval_ms: u64,
    /// Silence allowed before a connection is reaped (default: 90 seconds)
    pub timeout_ms: u64,
    /// Whether heartbeat is enabled (can be disabled for testing)
    pub enabled: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            timeout_ms: 90_000,
            enabled: true,
        }
    }
}

impl HeartbeatConfig {
    /// Create a config with heartbeat disabled
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Set the ping interval
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval_ms = duration_ms(interval);
        self
    }

    /// Set the liveness timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = duration_ms(timeout);
        self
    }

    /// Ping interval
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    /// Liveness timeout
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// How often stale connections are checked
    ///
    /// A quarter of the timeout, at least 10ms and at most one interval.
    #[must_use]
    pub fn reap_period(&self) -> Duration {
        (self.timeout() / 4)
            .max(Duration::from_millis(10))
            .min(self.interval())
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Async task that pings and reaps connections
pub struct HeartbeatTask {
    config: HeartbeatConfig,
    registry: ConnectionRegistry,
    stop: CancellationToken,
}

impl HeartbeatTask {
    /// Create a new heartbeat task
    #[must_use]
    pub fn new(config: HeartbeatConfig, registry: ConnectionRegistry, stop: CancellationToken) -> Self {
        Self {
            config,
            registry,
            stop,
        }
    }

    /// Run until `stop` is cancelled
    pub async fn run(self) {
        if !self.config.enabled {
            tracing::info!("Heartbeat monitoring disabled");
            return;
        }

        tracing::info!(
            interval_ms = self.config.interval_ms,
            timeout_ms = self.config.timeout_ms,
            "Starting heartbeat task"
        );

        let mut ping_tick = tokio::time::interval(self.config.interval());
        ping_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut reap_tick = tokio::time::interval(self.config.reap_period());
        reap_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.stop.cancelled() => {
                    tracing::info!("Heartbeat task stopped");
                    break;
                }
                _ = ping_tick.tick() => self.ping_all(),
                _ = reap_tick.tick() => {
                    self.reap();
                }
            }
        }
    }

    fn ping_all(&self) {
        for (connection_id, handle) in self.registry.handles() {
            if !handle.try_ping() {
                tracing::trace!(connection_id = %connection_id, "Ping skipped, outbound queue full");
            }
        }
    }

    /// Close and remove every silent connection; returns how many
    pub fn reap(&self) -> usize {
        let stale = self.registry.stale(self.config.timeout());
        for connection_id in &stale {
            if let Some(handle) = self.registry.unregister(connection_id) {
                tracing::warn!(
                    connection_id = %connection_id,
                    timeout_ms = self.config.timeout_ms,
                    "Heartbeat timeout, closing connection"
                );
                handle.close(CLOSE_HEARTBEAT_TIMEOUT, "heartbeat timeout");
            }
        }
        stale.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::websocket::registry::{
        ConnectionHandle, ConnectionId, Outbound, SocketConnection,
    };
    use tokio::sync::mpsc;

    fn register(registry: &ConnectionRegistry) -> (ConnectionId, ConnectionHandle, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(16);
        let handle = ConnectionHandle::new(tx, CancellationToken::new());
        let connection = SocketConnection::new(ConnectionId::new(), "alice");
        let id = connection.connection_id;
        registry.register(connection, handle.clone());
        (id, handle, rx)
    }

    #[test]
    fn test_reap_period_bounds() {
        let config = HeartbeatConfig::default()
            .with_interval(Duration::from_secs(30))
            .with_timeout(Duration::from_secs(90));
        assert_eq!(config.reap_period(), Duration::from_millis(22_500));

        let config = HeartbeatConfig::default()
            .with_interval(Duration::from_millis(5))
            .with_timeout(Duration::from_millis(20));
        assert_eq!(config.reap_period(), Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_connection_is_reaped_with_4008() {
        let registry = ConnectionRegistry::new();
        let (silent, silent_handle, mut silent_rx) = register(&registry);
        let (chatty, chatty_handle, _chatty_rx) = register(&registry);

        let stop = CancellationToken::new();
        let config = HeartbeatConfig::default()
            .with_interval(Duration::from_millis(100))
            .with_timeout(Duration::from_millis(300));
        let task = tokio::spawn(HeartbeatTask::new(config, registry.clone(), stop.clone()).run());

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            registry.touch(&chatty);
        }

        assert!(!registry.contains(&silent));
        assert_eq!(silent_handle.close_reason().map(|(code, _)| code), Some(4008));
        assert!(silent_handle.cancel_token().is_cancelled());
        assert_eq!(silent_rx.recv().await, Some(Outbound::Ping));

        assert!(registry.contains(&chatty));
        assert!(!chatty_handle.is_closed());

        stop.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_heartbeat_returns_immediately() {
        let registry = ConnectionRegistry::new();
        let (id, _handle, _rx) = register(&registry);
        HeartbeatTask::new(HeartbeatConfig::disabled(), registry.clone(), CancellationToken::new())
            .run()
            .await;
        tokio::time::advance(Duration::from_secs(600)).await;
        assert!(registry.contains(&id));
    }
}
