//! Upstream Backend Traits
//!
//! Trait definitions for model providers. The multiplexer only sees
//! [`UpstreamBackend`]; provider specifics (endpoint, auth header, payload
//! shape) stay inside the implementation.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::UpstreamError;

/// Lazy, finite, non-restartable sequence of text deltas
pub type DeltaStream = BoxStream<'static, Result<String, UpstreamError>>;

/// One generation request
#[derive(Clone, Debug, PartialEq)]
pub struct UpstreamRequest {
    /// Final user prompt
    pub prompt: String,
    /// System instruction of the target agent
    pub system_instruction: Option<String>,
    /// Model identifier (`None` = provider default)
    pub model: Option<String>,
    /// Sampling temperature
    pub temperature: f32,
    /// Maximum tokens to generate
    pub max_tokens: u32,
}

impl UpstreamRequest {
    /// Create a request with default sampling parameters
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_instruction: None,
            model: None,
            temperature: 0.7,
            max_tokens: 4096,
        }
    }

    /// Set system instruction
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system_instruction = Some(system.into());
        self
    }

    /// Set model override
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 2.0);
        self
    }

    /// Set max tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Provider connection settings
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Base URL; `/chat/completions` is appended
    pub base_url: String,
    /// Credential substituted into the auth header template
    pub api_key: String,
    /// Name of the authorization header
    pub auth_header: String,
    /// Header value template; `{key}` is replaced by the credential
    pub auth_template: String,
    /// Model used when a turn has no override
    pub default_model: String,
    /// Default sampling temperature
    pub temperature: f32,
    /// Default max tokens
    pub max_tokens: u32,
    /// Hard deadline for the next byte (headers and every read)
    pub read_timeout_ms: u64,
    /// TCP connect timeout
    pub connect_timeout_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            auth_header: "Authorization".to_string(),
            auth_template: "Bearer {key}".to_string(),
            default_model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            max_tokens: 4096,
            read_timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let api_key = if self.api_key.is_empty() { "" } else { "[REDACTED]" };
        f.debug_struct("ProviderConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &api_key)
            .field("auth_header", &self.auth_header)
            .field("auth_template", &self.auth_template)
            .field("default_model", &self.default_model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("read_timeout_ms", &self.read_timeout_ms)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .finish()
    }
}

impl ProviderConfig {
    /// Render the authorization header value
    #[must_use]
    pub fn auth_value(&self) -> String {
        self.auth_template.replace("{key}", &self.api_key)
    }

    /// Chat completions endpoint
    #[must_use]
    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    /// Read deadline as Duration
    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Connect timeout as Duration
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Model provider seam
#[async_trait]
pub trait UpstreamBackend: Send + Sync {
    /// Provider name for logs
    fn name(&self) -> &str;

    /// Open a streaming generation
    ///
    /// Fails before any delta with [`UpstreamError::Status`] on a non-success
    /// response or [`UpstreamError::Timeout`] when nothing arrives in time.
    /// Cancelling `cancel` ends the returned stream and closes the upstream
    /// connection.
    async fn open_stream(
        &self,
        request: &UpstreamRequest,
        cancel: CancellationToken,
    ) -> Result<DeltaStream, UpstreamError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_hides_api_key() {
        let config = ProviderConfig {
            api_key: "sk-live-123".to_string(),
            ..ProviderConfig::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("sk-live-123"));
        assert!(rendered.contains("[REDACTED]"));
        assert!(rendered.contains("gpt-4o-mini"));
    }

    #[test]
    fn test_auth_placeholder_substitution() {
        let config = ProviderConfig {
            api_key: "sk-123".to_string(),
            auth_header: "x-api-key".to_string(),
            auth_template: "{key}".to_string(),
            ..Default::default()
        };
        assert_eq!(config.auth_value(), "sk-123");

        let config = ProviderConfig {
            api_key: "sk-123".to_string(),
            ..Default::default()
        };
        assert_eq!(config.auth_value(), "Bearer sk-123");
    }

    #[test]
    fn test_completions_url_trims_slash() {
        let config = ProviderConfig {
            base_url: "http://localhost:8080/v1/".to_string(),
            ..Default::default()
        };
        assert_eq!(config.completions_url(), "http://localhost:8080/v1/chat/completions");
    }

    #[test]
    fn test_request_builder() {
        let request = UpstreamRequest::new("Hello")
            .with_system("Be brief")
            .with_model("m1")
            .with_temperature(5.0)
            .with_max_tokens(64);
        assert_eq!(request.system_instruction.as_deref(), Some("Be brief"));
        assert_eq!(request.model.as_deref(), Some("m1"));
        assert!((request.temperature - 2.0).abs() < f32::EPSILON);
        assert_eq!(request.max_tokens, 64);
    }
}
