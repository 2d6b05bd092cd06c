//! Turn Orchestration
//!
//! The [`StreamMultiplexer`] turns a user send into an ordered stream of
//! [`TurnEvent`]s, persisting the user message before the first delta and
//! the assistant message before the terminal event.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                      StreamMultiplexer                         │
//! │                                                                │
//! │   active: (session, agent) ──► { generation_id, cancel }       │
//! │                                                                │
//! │   start_turn ─► spawn ─► GenerationSession ─► UpstreamBackend  │
//! │                              │                                 │
//! │                              ▼                                 │
//! │                 mpsc<TurnEvent> (bounded) ─► transport         │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! At most one generation runs per (session, agent); a new send cancels the
//! previous one.

mod multiplexer;

pub use multiplexer::{
    FollowUpHook, MultiplexerConfig, StreamMultiplexer, TurnEvent, TurnHandle, TurnRequest,
};
