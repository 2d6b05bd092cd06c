//! Event sources
//!
//! A source yields the [`ClientEvent`]s of one streamed response and knows
//! how to tell its transport to stop.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::events::ClientEvent;
use crate::error::ClientError;

/// Per-response event stream from either transport
#[async_trait]
pub trait EventSource: Send {
    /// Next event, or `None` once the transport has nothing more
    ///
    /// Must be cancel-safe: [`super::drive`] races it against a timer.
    async fn next_event(&mut self) -> Option<Result<ClientEvent, ClientError>>;

    /// Ask the transport to stop the generation upstream
    async fn cancel(&mut self);
}

/// Source backed by a channel, for wiring custom transports
#[derive(Debug)]
pub struct ChannelSource {
    events: mpsc::Receiver<Result<ClientEvent, ClientError>>,
}

impl ChannelSource {
    /// Create a source and the sender that feeds it
    #[must_use]
    pub fn channel(capacity: usize) -> (mpsc::Sender<Result<ClientEvent, ClientError>>, Self) {
        let (tx, events) = mpsc::channel(capacity);
        (tx, Self { events })
    }
}

#[async_trait]
impl EventSource for ChannelSource {
    async fn next_event(&mut self) -> Option<Result<ClientEvent, ClientError>> {
        self.events.recv().await
    }

    async fn cancel(&mut self) {
        self.events.close();
    }
}
