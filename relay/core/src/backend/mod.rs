//! Upstream Model Providers
//!
//! Access to streaming model providers through a common trait interface.
//!
//! # Available Backends
//!
//! - **OpenAI-compatible**: any `/chat/completions` endpoint with SSE streaming
//!
//! # Usage
//!
//! ```ignore
//! use relay_core::backend::{OpenAiCompatibleBackend, ProviderConfig, UpstreamBackend, UpstreamRequest};
//!
//! let backend = OpenAiCompatibleBackend::new(ProviderConfig::default())?;
//! let mut deltas = backend.open_stream(&UpstreamRequest::new("Hello!"), cancel).await?;
//! while let Some(delta) = deltas.next().await { /* ... */ }
//! ```

mod openai;
pub mod sse;
mod traits;

pub use openai::OpenAiCompatibleBackend;
pub use sse::{SseDecoder, SseRecord, DONE_SENTINEL};
pub use traits::{DeltaStream, ProviderConfig, UpstreamBackend, UpstreamRequest};
