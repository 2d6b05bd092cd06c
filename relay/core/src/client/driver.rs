//! Drive loop
//!
//! One routine renders a response from any [`EventSource`]: it feeds events
//! into the shared [`StreamReconstructor`], flushes coalesced deltas on a
//! timer, and handles user cancellation.

use parking_lot::Mutex;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::events::ClientEvent;
use super::reconstructor::{Repaint, StreamReconstructor};
use super::source::EventSource;
use crate::messages::MessageId;

/// How a drive ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriveStatus {
    /// Terminal `done` received
    Completed,
    /// Terminal `error` or a transport failure
    Failed,
    /// Stopped by the user
    Cancelled,
    /// Source ended without a terminal event
    Interrupted,
}

/// Result of [`drive`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriveOutcome {
    /// Final id of the message (durable when completed)
    pub message_id: MessageId,
    /// How the response ended
    pub status: DriveStatus,
    /// Repaints emitted
    pub repaints: usize,
}

/// Render one response tracked as `id` until it ends
///
/// `on_repaint` runs outside the reconstructor lock and may also receive
/// timer flushes of other responses sharing the reconstructor. Cancelling `cancel`
/// stops reading, tells the source to cancel upstream, and freezes the
/// content received so far.
pub async fn drive<S, F>(
    source: &mut S,
    reconstructor: &Mutex<StreamReconstructor>,
    id: MessageId,
    cancel: CancellationToken,
    mut on_repaint: F,
) -> DriveOutcome
where
    S: EventSource + ?Sized,
    F: FnMut(Repaint),
{
    let interval = reconstructor.lock().config().repaint_interval();
    let mut flush_timer = time::interval(interval.max(time::Duration::from_millis(1)));
    flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut current = id;
    let mut repaints = 0usize;
    let mut emit = |repaint: Repaint| {
        repaints += 1;
        on_repaint(repaint);
    };

    let status = loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                source.cancel().await;
                let repaint = reconstructor.lock().cancel(&current, Instant::now());
                if let Some(repaint) = repaint {
                    emit(repaint);
                }
                break DriveStatus::Cancelled;
            }

            event = source.next_event() => match event {
                Some(Ok(event)) => {
                    let status = match &event {
                        ClientEvent::Chunk { .. } => None,
                        ClientEvent::Done { .. } => Some(DriveStatus::Completed),
                        ClientEvent::Error { .. } => Some(DriveStatus::Failed),
                    };
                    let repaint = reconstructor.lock().apply(&current, event, Instant::now());
                    if let Some(repaint) = repaint {
                        // Reconciliation moves the message to its durable id
                        current.clone_from(&repaint.id);
                        emit(repaint);
                    }
                    if let Some(status) = status {
                        break status;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(message_id = %current, error = %e, "Stream failed");
                    let repaint = reconstructor.lock().fail(&current, &e.to_string(), Instant::now());
                    if let Some(repaint) = repaint {
                        emit(repaint);
                    }
                    break DriveStatus::Failed;
                }
                None => {
                    tracing::warn!(message_id = %current, "Stream ended without a terminal event");
                    let repaint = reconstructor.lock().end_of_stream(&current, Instant::now());
                    if let Some(repaint) = repaint {
                        emit(repaint);
                    }
                    break DriveStatus::Interrupted;
                }
            },

            _ = flush_timer.tick() => {
                let due = reconstructor.lock().flush_due(Instant::now());
                for repaint in due {
                    emit(repaint);
                }
            }
        }
    };

    DriveOutcome {
        message_id: current,
        status,
        repaints,
    }
}
