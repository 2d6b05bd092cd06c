//! Integration tests for the generation pipeline
//!
//! Drives [`StreamMultiplexer`] against in-process backends and checks what
//! reaches the event channel and the store. Covers:
//! - Ordered chunks followed by one `Done`
//! - Follow-up work after `Done`
//! - Chunk concatenation equals the `Done` content and the stored message
//! - Cancellation (no terminal event) and supersession (`superseded` error)
//! - Mid-stream upstream failures
//! - Pre-stream refusals (unknown session, foreign session, empty content)

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

use relay_core::streaming::FollowUpHook;
use relay_core::{
    InMemoryMessageStore, MessageId, MessageRole, MultiplexerConfig, SessionId, StaticAgentDirectory,
    StreamMultiplexer, TurnEvent, TurnRequest, UpstreamBackend,
};

use common::{eventually, ScriptedBackend, SESSION, USER};

fn multiplexer(backend: Arc<dyn UpstreamBackend>) -> (StreamMultiplexer, InMemoryMessageStore) {
    let store = InMemoryMessageStore::new();
    store.insert_session(SessionId::from(SESSION), USER);
    let multiplexer = StreamMultiplexer::new(
        backend,
        Arc::new(store.clone()),
        Arc::new(StaticAgentDirectory::new()),
        MultiplexerConfig::default(),
    );
    (multiplexer, store)
}

fn turn(content: &str) -> TurnRequest {
    TurnRequest::new(USER, SessionId::from(SESSION), content)
}

async fn collect(mut events: mpsc::Receiver<TurnEvent>) -> Vec<TurnEvent> {
    let mut seen = Vec::new();
    while let Some(event) = events.recv().await {
        seen.push(event);
    }
    seen
}

fn concatenated(events: &[TurnEvent]) -> String {
    events
        .iter()
        .filter_map(|event| match event {
            TurnEvent::Chunk { content } => Some(content.as_str()),
            _ => None,
        })
        .collect()
}

// =============================================================================
// Happy path
// =============================================================================

/// "Hi" and " there" arrive as two chunks, then one Done carrying the
/// persisted message id and the full text.
#[tokio::test]
async fn test_hi_there_end_to_end() {
    let backend = Arc::new(ScriptedBackend::new(&["Hi", " there"]));
    let (multiplexer, store) = multiplexer(backend.clone());

    let handle = multiplexer.start_turn(turn("hello")).await.unwrap();
    let events = collect(handle.events).await;

    assert_eq!(events.len(), 3);
    assert_eq!(events[0], TurnEvent::Chunk { content: "Hi".to_string() });
    assert_eq!(events[1], TurnEvent::Chunk { content: " there".to_string() });
    let TurnEvent::Done {
        message_id,
        content,
        chunk_count,
    } = &events[2]
    else {
        panic!("expected Done, got {:?}", events[2]);
    };
    assert_eq!(content, "Hi there");
    assert_eq!(*chunk_count, 2);
    assert!(!message_id.is_provisional());

    let stored = store.messages(&SessionId::from(SESSION));
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].role, MessageRole::User);
    assert_eq!(stored[0].content, "hello");
    assert_eq!(stored[1].role, MessageRole::Assistant);
    assert_eq!(stored[1].id, *message_id);
    assert_eq!(stored[1].content, "Hi there");

    let previewed = eventually(|| store.preview(&SessionId::from(SESSION)).is_some()).await;
    assert!(previewed);
    assert_eq!(store.preview(&SessionId::from(SESSION)).as_deref(), Some("Hi there"));

    // Agent instruction travels upstream with the prompt
    let requests = backend.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].prompt, "hello");
    assert!(requests[0].system_instruction.is_some());
}

/// Multi-byte deltas survive unchanged and the three views agree:
/// chunk concatenation, Done content, stored content.
#[tokio::test]
async fn test_chunks_concatenate_to_done_and_store() {
    let deltas = ["Ein ", "schönes ", "日本", "語", " 🎉", "!"];
    let (multiplexer, store) = multiplexer(Arc::new(ScriptedBackend::new(&deltas)));

    let handle = multiplexer.start_turn(turn("say something")).await.unwrap();
    let events = collect(handle.events).await;

    let streamed = concatenated(&events);
    assert_eq!(streamed, deltas.concat());

    let Some(TurnEvent::Done { content, message_id, .. }) = events.last() else {
        panic!("turn did not complete: {events:?}");
    };
    assert_eq!(*content, streamed);

    let stored = store.messages(&SessionId::from(SESSION));
    let assistant = stored.iter().find(|m| m.id == *message_id).unwrap();
    assert_eq!(assistant.content, streamed);
}

/// A provider that streams nothing still completes with an empty message.
#[tokio::test]
async fn test_empty_completion_is_persisted() {
    let (multiplexer, store) = multiplexer(Arc::new(ScriptedBackend::new(&[])));

    let handle = multiplexer.start_turn(turn("anything?")).await.unwrap();
    let events = collect(handle.events).await;

    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        TurnEvent::Done { content, chunk_count: 0, .. } if content.is_empty()
    ));
    assert_eq!(store.messages(&SessionId::from(SESSION)).len(), 2);
}

/// Records completed turns; the first call never returns
#[derive(Default)]
struct SlowFollowUp {
    seen: Mutex<Vec<(SessionId, MessageId, String)>>,
}

#[async_trait]
impl FollowUpHook for SlowFollowUp {
    async fn on_complete(&self, session_id: &SessionId, message_id: &MessageId, content: &str) {
        self.seen
            .lock()
            .push((session_id.clone(), message_id.clone(), content.to_string()));
        std::future::pending::<()>().await;
    }
}

/// The follow-up hook sees the stored reply and does not hold back Done.
#[tokio::test]
async fn test_follow_up_runs_after_done() {
    let hook = Arc::new(SlowFollowUp::default());
    let (multiplexer, _store) = multiplexer(Arc::new(ScriptedBackend::new(&["Sure", "."])));
    let multiplexer = multiplexer.with_follow_up(hook.clone());

    let handle = multiplexer.start_turn(turn("help?")).await.unwrap();
    let events = collect(handle.events).await;
    let Some(TurnEvent::Done { message_id, .. }) = events.last() else {
        panic!("expected Done, got {events:?}");
    };

    assert!(eventually(|| !hook.seen.lock().is_empty()).await);
    assert_eq!(
        hook.seen.lock()[0],
        (SessionId::from(SESSION), message_id.clone(), "Sure.".to_string())
    );
}

// =============================================================================
// Cancellation
// =============================================================================

/// Cancelling mid-stream ends the channel without Done or Error and keeps
/// the partial text.
#[tokio::test]
async fn test_cancel_stops_events_and_keeps_partial() {
    let backend = ScriptedBackend::new(&["partial ", "answer"]).holding_open();
    let (multiplexer, store) = multiplexer(Arc::new(backend));

    let mut handle = multiplexer.start_turn(turn("long question")).await.unwrap();
    assert_eq!(
        handle.events.recv().await,
        Some(TurnEvent::Chunk { content: "partial ".to_string() })
    );
    assert_eq!(
        handle.events.recv().await,
        Some(TurnEvent::Chunk { content: "answer".to_string() })
    );

    assert!(multiplexer.cancel(&SessionId::from(SESSION), &handle.agent_id));
    let rest = collect(handle.events).await;
    assert!(rest.is_empty(), "events after cancel: {rest:?}");

    let stored = store.messages(&SessionId::from(SESSION));
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[1].role, MessageRole::Assistant);
    assert_eq!(stored[1].content, "partial answer");
}

/// A second send to the same session and agent cancels the first one,
/// which ends with a `superseded` error instead of hanging.
#[tokio::test]
async fn test_new_turn_supersedes_active_generation() {
    let backend = ScriptedBackend::new(&["first"]).holding_open();
    let (multiplexer, _store) = multiplexer(Arc::new(backend));

    let mut first = multiplexer.start_turn(turn("one")).await.unwrap();
    assert_eq!(
        first.events.recv().await,
        Some(TurnEvent::Chunk { content: "first".to_string() })
    );
    assert!(multiplexer.is_active(&SessionId::from(SESSION), &first.agent_id));

    let mut second = multiplexer.start_turn(turn("two")).await.unwrap();
    assert_ne!(first.generation_id, second.generation_id);

    assert_eq!(
        collect(first.events).await,
        vec![TurnEvent::Error {
            message: "superseded by a newer message".to_string(),
            code: "superseded",
        }]
    );
    assert!(first.cancel.is_cancelled());
    assert!(!second.cancel.is_cancelled());
    assert_eq!(
        second.events.recv().await,
        Some(TurnEvent::Chunk { content: "first".to_string() })
    );
    assert!(multiplexer.is_active(&SessionId::from(SESSION), &second.agent_id));

    multiplexer.cancel_all();
    assert!(collect(second.events).await.is_empty());
}

/// Dropping the receiver is treated as a disconnect.
#[tokio::test]
async fn test_dropped_consumer_cancels_generation() {
    let backend = ScriptedBackend::new(&["a", "b"]).holding_open();
    let (multiplexer, store) = multiplexer(Arc::new(backend));

    let handle = multiplexer.start_turn(turn("bye")).await.unwrap();
    let cancel = handle.cancel.clone();
    drop(handle.events);

    assert!(eventually(|| cancel.is_cancelled()).await);
    assert!(eventually(|| multiplexer.active_count() == 0).await);
    // User message always, partial only if a delta was accepted first
    assert!(!store.messages(&SessionId::from(SESSION)).is_empty());
}

// =============================================================================
// Failures
// =============================================================================

/// A provider error mid-stream yields one Error after the chunks already
/// sent, and the partial text is kept.
#[tokio::test]
async fn test_upstream_failure_mid_stream() {
    let backend = ScriptedBackend::with_script(vec![Ok("Hi"), Err("overloaded")]);
    let (multiplexer, store) = multiplexer(Arc::new(backend));

    let handle = multiplexer.start_turn(turn("hello")).await.unwrap();
    let events = collect(handle.events).await;

    assert_eq!(events.len(), 2);
    assert_eq!(events[0], TurnEvent::Chunk { content: "Hi".to_string() });
    let TurnEvent::Error { message, code } = &events[1] else {
        panic!("expected Error, got {:?}", events[1]);
    };
    assert_eq!(*code, "upstream_error");
    assert!(message.contains("overloaded"));

    let stored = store.messages(&SessionId::from(SESSION));
    assert_eq!(stored.last().map(|m| m.content.as_str()), Some("Hi"));
}

/// Refusals happen before any generation starts.
#[tokio::test]
async fn test_refusals_before_streaming() {
    let backend = Arc::new(ScriptedBackend::new(&["never"]));
    let (multiplexer, store) = multiplexer(backend.clone());

    let err = multiplexer
        .start_turn(TurnRequest::new(USER, SessionId::from("missing"), "hi"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "unknown_session");

    let err = multiplexer
        .start_turn(TurnRequest::new("mallory", SessionId::from(SESSION), "hi"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "forbidden");

    let err = multiplexer.start_turn(turn("   ")).await.unwrap_err();
    assert_eq!(err.code(), "invalid_request");

    let err = multiplexer
        .start_turn(turn("hi").with_agent("nobody".into()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "not_found");

    assert!(backend.requests().is_empty());
    assert!(store.messages(&SessionId::from(SESSION)).is_empty());
    assert_eq!(multiplexer.active_count(), 0);
}
