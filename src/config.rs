//! # Configuration Management
//!
//! This module handles loading and managing relay configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Provider environment variables (DEEPGRAM_API_KEY, SPEECHMATICS_URL, ...)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization library for converting between Rust structs and data formats
//! - **derive macros**: Automatically generate code for common traits (Debug, Clone, Serialize, Deserialize)
//! - **Option<T>**: API keys are optional at load time; a missing key only fails the session that needs it
//! - **Result<T, E>**: Error handling that forces you to handle potential failures
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Provider variables (DEEPGRAM_API_KEY, SPEECHMATICS_API_KEY, ...) and HOST/PORT
//! 2. Environment variables (APP_SERVER__PORT, APP_RELAY__DRAIN_TIMEOUT_MS, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use crate::provider::ProviderKind;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// The hosting layer (server), the session relay itself, and each provider
/// have independent knobs, so each gets its own section in config.toml.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub relay: RelayConfig,
    pub deepgram: DeepgramConfig,
    pub speechmatics: SpeechmaticsConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Settings shared by every relay session regardless of provider.
///
/// ## Fields:
/// - `default_provider`: Provider used by `/ws/stt/` when the route names none
/// - `connect_timeout_ms`: Upper bound on the upstream WebSocket handshake
/// - `event_buffer`: Capacity of the reader → coordinator event channel
/// - `max_message_size`: Largest upstream message/frame accepted (bytes)
/// - `forward_raw_events`: Relay raw provider messages as `{"sm_event": ...}`
/// - `heartbeat_interval_secs` / `client_timeout_secs`: Client ping cadence and liveness limit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub default_provider: ProviderKind,
    pub connect_timeout_ms: u64,
    pub event_buffer: usize,
    pub max_message_size: usize,
    pub forward_raw_events: bool,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

/// Deepgram live transcription settings.
///
/// Everything except `url`, `api_key` and `drain_timeout_ms` ends up as a
/// query parameter on the listen endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepgramConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub language: String,
    pub smart_format: bool,
    pub punctuate: bool,
    pub interim_results: bool,
    pub drain_timeout_ms: u64,
}

/// Speechmatics real-time settings.
///
/// `sample_rate`, `language`, `enable_partials`, `operating_point` and
/// `max_delay` are sent in the `StartRecognition` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechmaticsConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub sample_rate: u32,
    pub language: String,
    pub enable_partials: bool,
    pub operating_point: String,
    pub max_delay: f64,
    pub drain_timeout_ms: u64,
}

/// Provides default configuration values.
///
/// ## Why defaults matter:
/// The relay can start without any configuration file; only the provider
/// API keys have to come from the environment before a session can stream.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            relay: RelayConfig {
                default_provider: ProviderKind::Speechmatics,
                connect_timeout_ms: 10_000,
                event_buffer: 256,
                max_message_size: 4 * 1024 * 1024,   // 4 MiB, plenty for PCM chunks
                forward_raw_events: true,
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
            },
            deepgram: DeepgramConfig {
                url: "wss://api.deepgram.com/v1/listen".to_string(),
                api_key: None,
                model: "nova-2-general".to_string(),
                encoding: "linear16".to_string(),
                sample_rate: 16_000,
                channels: 1,
                language: "cs".to_string(),
                smart_format: true,
                punctuate: true,
                interim_results: true,
                drain_timeout_ms: 2_000,
            },
            speechmatics: SpeechmaticsConfig {
                url: "wss://eu1.rt.speechmatics.com/v2".to_string(),
                api_key: None,
                sample_rate: 48_000,
                language: "cs".to_string(),
                enable_partials: true,
                operating_point: "enhanced".to_string(),
                max_delay: 2.0,
                drain_timeout_ms: 4_000,
            },
        }
    }
}

/// Plain environment variables that override nested keys.
///
/// These don't follow the APP_ prefix convention: HOST/PORT are what
/// deployment platforms set, the provider names are what existing `.env`
/// files already contain.
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("HOST", "server.host"),
    ("PORT", "server.port"),
    ("DEEPGRAM_API_KEY", "deepgram.api_key"),
    ("DEEPGRAM_URL", "deepgram.url"),
    ("SPEECHMATICS_API_KEY", "speechmatics.api_key"),
    ("SPEECHMATICS_URL", "speechmatics.url"),
    ("SPEECHMATICS_LANG", "speechmatics.language"),
    ("SPEECHMATICS_SR", "speechmatics.sample_rate"),
];

impl AppConfig {
    /// Load configuration from the process environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_RELAY__DEFAULT_PROVIDER=deepgram`: Change the `/ws/stt/` provider
    /// - `SPEECHMATICS_API_KEY=...`: Provider credential
    pub fn load() -> Result<Self> {
        Self::load_with(|name| env::var(name).ok())
    }

    /// Load configuration, resolving the plain override variables through `lookup`.
    ///
    /// Blank values are ignored so that `DEEPGRAM_API_KEY=` in a `.env`
    /// file behaves like an unset key.
    pub fn load_with<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        for (name, key) in ENV_OVERRIDES {
            if let Some(value) = lookup(name) {
                let value = value.trim().to_string();
                if !value.is_empty() {
                    settings = settings.set_override(*key, value)?;
                }
            }
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Endpoint URLs and API keys are deliberately not checked here: a bad
    /// provider setting must fail the session that uses it, with an error
    /// message to that client, not the whole server.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.relay.event_buffer == 0 {
            return Err(anyhow::anyhow!("Event buffer must be greater than 0"));
        }

        if self.relay.max_message_size == 0 {
            return Err(anyhow::anyhow!("Max message size must be greater than 0"));
        }

        if self.relay.heartbeat_interval_secs == 0 {
            return Err(anyhow::anyhow!("Heartbeat interval must be greater than 0"));
        }

        if self.relay.client_timeout_secs <= self.relay.heartbeat_interval_secs {
            return Err(anyhow::anyhow!(
                "Client timeout must be longer than the heartbeat interval"
            ));
        }

        if self.deepgram.sample_rate == 0 || self.speechmatics.sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.deepgram.channels == 0 {
            return Err(anyhow::anyhow!("Deepgram channel count must be greater than 0"));
        }

        // These end up verbatim in the Deepgram query string.
        for (name, value) in [
            ("deepgram.model", &self.deepgram.model),
            ("deepgram.encoding", &self.deepgram.encoding),
            ("deepgram.language", &self.deepgram.language),
        ] {
            if !is_query_token(value) {
                return Err(anyhow::anyhow!(
                    "{} must be non-empty and contain only letters, digits, '-', '_' or '.'",
                    name
                ));
            }
        }

        Ok(())
    }
}

fn is_query_token(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

impl RelayConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}
