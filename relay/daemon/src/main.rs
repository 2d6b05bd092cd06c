//! Relay Daemon
//!
//! Standalone server process for tokenrelay. Clients stream responses over
//! `POST /api/chat/send` (SSE) or `GET /ws` (WebSocket).
//!
//! # Usage
//!
//! ```bash
//! # Serve with the default config ($XDG_CONFIG_HOME/tokenrelay/relay.toml)
//! RELAY_TOKEN_SECRET=dev RELAY_UPSTREAM_KEY=sk-... relay-daemon
//!
//! # Custom config and bind address
//! relay-daemon --config ./relay.toml --bind 0.0.0.0:8080
//!
//! # Mint a development token
//! relay-daemon issue-token alice
//!
//! # With verbose logging
//! RUST_LOG=debug relay-daemon
//! ```
//!
//! # Signals
//!
//! - SIGTERM/SIGINT: graceful shutdown (generations cancelled, sockets closed with 1001)

mod server;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use relay_core::{load_config_from_path, ConfigOverrides, RelayConfig, SignedTokenVerifier};

/// tokenrelay streaming server
#[derive(Debug, Parser)]
#[command(name = "relay-daemon", version, about)]
struct Cli {
    /// Configuration file (defaults to $XDG_CONFIG_HOME/tokenrelay/relay.toml)
    #[arg(short, long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overrides [server].bind
    #[arg(long)]
    bind: Option<String>,

    /// Upstream base URL, overrides [upstream].base_url
    #[arg(long)]
    upstream_url: Option<String>,

    /// Default model, overrides [upstream].default_model
    #[arg(long)]
    model: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve both transports (default)
    Serve,
    /// Print a signed token for development
    IssueToken {
        /// User id to put in the token
        user: String,
        /// Role claim
        #[arg(long, default_value = "user")]
        role: String,
        /// Lifetime in hours
        #[arg(long, default_value_t = 24)]
        hours: u64,
    },
    /// Load, validate and print the effective configuration
    CheckConfig,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            bind: self.bind.clone(),
            upstream_url: self.upstream_url.clone(),
            model: self.model.clone(),
        }
    }

    fn load(&self) -> anyhow::Result<RelayConfig> {
        let path = self.config.clone().or_else(relay_core::default_config_path);
        let mut config = load_config_from_path(path).context("Failed to load configuration")?;
        self.overrides().apply(&mut config);
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("relay_daemon=info".parse()?)
                .add_directive("relay_core=info".parse()?),
        )
        .with_target(true)
        .init();

    let cli = Cli::parse();
    let config = cli.load()?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            info!(
                source = %config.source(),
                path = ?config.config_file_path,
                "Starting relay daemon"
            );
            server::serve(config).await
        }
        Command::IssueToken { user, role, hours } => {
            config.validate().context("Cannot issue tokens")?;
            let verifier = SignedTokenVerifier::new(config.auth.token_secret.as_bytes());
            let ttl = Duration::from_secs(hours.saturating_mul(3600));
            println!("{}", verifier.issue_for(&user, &role, ttl));
            Ok(())
        }
        Command::CheckConfig => {
            config.validate().context("Configuration is invalid")?;
            let rendered = toml_preview(&config)?;
            println!("# source: {}\n{rendered}", config.source());
            Ok(())
        }
    }
}

fn toml_preview(config: &RelayConfig) -> anyhow::Result<String> {
    let mut redacted = config.clone();
    if !redacted.upstream.api_key.is_empty() {
        redacted.upstream.api_key = "[REDACTED]".to_string();
    }
    redacted.auth.token_secret = "[REDACTED]".to_string();
    relay_core::config::to_toml(&redacted).context("Failed to render configuration")
}
