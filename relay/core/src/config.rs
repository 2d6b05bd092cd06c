//! TOML Configuration File Support
//!
//! Centralized configuration for the relay server and its clients, loaded
//! from `~/.config/tokenrelay/relay.toml`.
//!
//! # Configuration Priority
//!
//! Highest first:
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables (`RELAY_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:8080"
//! keep_alive_secs = 15
//!
//! [upstream]
//! base_url = "https://api.openai.com/v1"
//! api_key = "sk-..."
//! default_model = "gpt-4o-mini"
//! read_timeout_ms = 30000
//!
//! [streaming]
//! channel_capacity = 64
//! preview_chars = 120
//!
//! [socket]
//! max_message_bytes = 65536
//! write_timeout_ms = 10000
//!
//! [socket.heartbeat]
//! interval_ms = 30000
//! timeout_ms = 90000
//!
//! [auth]
//! token_secret = "change-me"
//!
//! [client]
//! repaint_interval_ms = 33
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::ProviderConfig;
use crate::client::ClientConfig;
use crate::streaming::MultiplexerConfig;
use crate::transport::SocketConfig;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where the configuration came from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Command-line argument
    Cli,
    /// Environment variable
    Env,
    /// TOML configuration file
    File,
    /// Default values
    #[default]
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// Sections
// =============================================================================

/// `[server]` section
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub bind: String,
    /// Idle interval between SSE keep-alive comments
    pub keep_alive_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            keep_alive_secs: 15,
        }
    }
}

impl ServerConfig {
    /// Keep-alive interval as a [`Duration`]
    #[must_use]
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

/// `[streaming]` section
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Capacity of each turn's event channel
    pub channel_capacity: usize,
    /// Maximum characters kept in a session preview
    pub preview_chars: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        let defaults = MultiplexerConfig::default();
        Self {
            channel_capacity: defaults.channel_capacity,
            preview_chars: defaults.preview_chars,
        }
    }
}

/// `[auth]` section
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HMAC secret for signed tokens
    pub token_secret: String,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("token_secret", &"[REDACTED]")
            .finish()
    }
}

// =============================================================================
// Full Configuration
// =============================================================================

/// Complete relay configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Listener settings
    pub server: ServerConfig,
    /// Upstream provider
    pub upstream: ProviderConfig,
    /// Turn orchestration
    pub streaming: StreamingConfig,
    /// Socket transport and heartbeat
    pub socket: SocketConfig,
    /// Token verification
    pub auth: AuthConfig,
    /// Client rendering and retry
    pub client: ClientConfig,

    /// Path to the config file that was loaded (if any)
    #[serde(skip)]
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    #[serde(skip)]
    source: ConfigSource,
}

impl RelayConfig {
    /// Create a configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Multiplexer settings derived from `[streaming]` and `[upstream]`
    #[must_use]
    pub fn multiplexer(&self) -> MultiplexerConfig {
        MultiplexerConfig {
            channel_capacity: self.streaming.channel_capacity,
            preview_chars: self.streaming.preview_chars,
            temperature: self.upstream.temperature,
            max_tokens: self.upstream.max_tokens,
        }
    }

    /// Check values the server cannot run without
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] describing the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.token_secret.is_empty() {
            return Err(ConfigError::ValidationError(
                "auth.token_secret must be set (or RELAY_TOKEN_SECRET)".to_string(),
            ));
        }
        if self.streaming.channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "streaming.channel_capacity must be positive".to_string(),
            ));
        }
        if self.socket.outbound_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "socket.outbound_capacity must be positive".to_string(),
            ));
        }
        if self.socket.write_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "socket.write_timeout_ms must be positive".to_string(),
            ));
        }
        let heartbeat = &self.socket.heartbeat;
        if heartbeat.enabled && heartbeat.timeout_ms <= heartbeat.interval_ms {
            return Err(ConfigError::ValidationError(format!(
                "socket.heartbeat.timeout_ms ({}) must exceed interval_ms ({})",
                heartbeat.timeout_ms, heartbeat.interval_ms
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/tokenrelay/relay.toml` or
/// `~/.config/tokenrelay/relay.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("tokenrelay").join("relay.toml"))
}

/// Load configuration from `RELAY_CONFIG` or the default path
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<RelayConfig, ConfigError> {
    let path = std::env::var_os("RELAY_CONFIG")
        .map(PathBuf::from)
        .or_else(default_config_path);
    load_config_from_path(path)
}

/// Load configuration from a specific path, then apply the environment
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<RelayConfig, ConfigError> {
    let mut config = read_config_file(path)?;
    apply_env_config(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

fn read_config_file(path: Option<PathBuf>) -> Result<RelayConfig, ConfigError> {
    let Some(config_path) = path else {
        return Ok(RelayConfig::default());
    };

    if !config_path.exists() {
        tracing::debug!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return Ok(RelayConfig::default());
    }

    let toml_content = std::fs::read_to_string(&config_path).map_err(|e| ConfigError::ReadError {
        path: config_path.clone(),
        source: e,
    })?;

    let mut config: RelayConfig = toml::from_str(&toml_content)?;
    config.config_file_path = Some(config_path.clone());
    config.source = ConfigSource::File;

    tracing::info!(
        path = %config_path.display(),
        "Loaded configuration from file"
    );
    Ok(config)
}

/// Apply `RELAY_*` overrides read through `lookup`
///
/// Unparseable numbers are ignored with a warning.
pub fn apply_env_config<F>(config: &mut RelayConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let mut touched = false;

    if let Some(bind) = lookup("RELAY_BIND") {
        config.server.bind = bind;
        touched = true;
    }
    if let Some(url) = lookup("RELAY_UPSTREAM_URL") {
        config.upstream.base_url = url;
        touched = true;
    }
    if let Some(key) = lookup("RELAY_UPSTREAM_KEY") {
        config.upstream.api_key = key;
        touched = true;
    }
    if let Some(model) = lookup("RELAY_MODEL") {
        config.upstream.default_model = model;
        touched = true;
    }
    if let Some(secret) = lookup("RELAY_TOKEN_SECRET") {
        config.auth.token_secret = secret;
        touched = true;
    }
    if let Some(ms) = parse_env::<u64>(&lookup, "RELAY_HEARTBEAT_INTERVAL_MS") {
        config.socket.heartbeat.interval_ms = ms;
        touched = true;
    }
    if let Some(ms) = parse_env::<u64>(&lookup, "RELAY_HEARTBEAT_TIMEOUT_MS") {
        config.socket.heartbeat.timeout_ms = ms;
        touched = true;
    }

    if touched {
        config.source = ConfigSource::Env;
    }
}

fn parse_env<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

/// Render a configuration as TOML
///
/// # Errors
///
/// Propagates serializer failures.
pub fn to_toml(config: &RelayConfig) -> Result<String, toml::ser::Error> {
    toml::to_string_pretty(config)
}

// =============================================================================
// CLI Overrides
// =============================================================================

/// Values given on the command line
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Listen address override
    pub bind: Option<String>,
    /// Upstream base URL override
    pub upstream_url: Option<String>,
    /// Default model override
    pub model: Option<String>,
}

impl ConfigOverrides {
    /// Create an empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the listen address
    #[must_use]
    pub fn with_bind(mut self, bind: impl Into<String>) -> Self {
        self.bind = Some(bind.into());
        self
    }

    /// Set the upstream URL
    #[must_use]
    pub fn with_upstream_url(mut self, url: impl Into<String>) -> Self {
        self.upstream_url = Some(url.into());
        self
    }

    /// Set the default model
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut RelayConfig) {
        if self.bind.is_some() || self.upstream_url.is_some() || self.model.is_some() {
            config.source = ConfigSource::Cli;
        }
        if let Some(bind) = &self.bind {
            config.server.bind.clone_from(bind);
        }
        if let Some(url) = &self.upstream_url {
            config.upstream.base_url.clone_from(url);
        }
        if let Some(model) = &self.model {
            config.upstream.default_model.clone_from(model);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
