//! # Provider Adapters
//!
//! Translation layer between the relay's event model and the wire protocols
//! of the supported real-time STT providers.
//!
//! ## Key Components:
//! - **ProviderAdapter**: Closed set of adapters selected once per session
//! - **DeepgramAdapter**: Query-parameter configured stream, `Token` auth
//! - **SpeechmaticsAdapter**: `StartRecognition` handshake, `Bearer` auth, sequence tracking
//! - **Upstream**: Shared connection, reader task and drain protocol
//!
//! ## Adapter Contract:
//! | Operation | Behavior |
//! |-----------|----------|
//! | `start`   | Validate credentials, connect, handshake, spawn the reader |
//! | `feed`    | One audio chunk → one binary frame |
//! | `finish`  | End-of-stream (best effort) → bounded drain → release |
//! | `close`   | Idempotent; finishes without waiting if needed, then releases |
//!
//! Events produced by the reader arrive on the `mpsc::Sender<ProviderEvent>`
//! given at construction, in the order the provider sent them.

pub mod deepgram;
pub mod speechmatics;
pub mod upstream;

#[cfg(test)]
pub(crate) mod testing;

pub use deepgram::DeepgramAdapter;
pub use speechmatics::SpeechmaticsAdapter;
pub use upstream::{DrainOutcome, UpstreamOptions};

use crate::config::AppConfig;
use crate::error::ProviderError;
use crate::events::ProviderEvent;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;

/// The supported STT providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Deepgram,
    Speechmatics,
}

impl ProviderKind {
    /// Route/config name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Deepgram => "deepgram",
            ProviderKind::Speechmatics => "speechmatics",
        }
    }

    /// Human-readable name used in client-facing messages.
    pub fn label(&self) -> &'static str {
        match self {
            ProviderKind::Deepgram => "Deepgram",
            ProviderKind::Speechmatics => "Speechmatics",
        }
    }

    /// Environment variable that supplies the API key.
    pub fn api_key_variable(&self) -> &'static str {
        match self {
            ProviderKind::Deepgram => "DEEPGRAM_API_KEY",
            ProviderKind::Speechmatics => "SPEECHMATICS_API_KEY",
        }
    }

    /// Credentials, audio format and drain window for this provider.
    pub fn setup(&self, config: &AppConfig) -> ProviderSetup {
        match self {
            ProviderKind::Deepgram => ProviderSetup {
                credentials: Credentials::new(*self, &config.deepgram.url, config.deepgram.api_key.clone()),
                audio: AudioConfig {
                    sample_rate: config.deepgram.sample_rate,
                    channels: config.deepgram.channels,
                    language: config.deepgram.language.clone(),
                },
                drain_timeout: Duration::from_millis(config.deepgram.drain_timeout_ms),
            },
            ProviderKind::Speechmatics => ProviderSetup {
                credentials: Credentials::new(
                    *self,
                    &config.speechmatics.url,
                    config.speechmatics.api_key.clone(),
                ),
                audio: AudioConfig {
                    sample_rate: config.speechmatics.sample_rate,
                    channels: 1,
                    language: config.speechmatics.language.clone(),
                },
                drain_timeout: Duration::from_millis(config.speechmatics.drain_timeout_ms),
            },
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deepgram" => Ok(ProviderKind::Deepgram),
            "speechmatics" => Ok(ProviderKind::Speechmatics),
            other => Err(format!("unknown provider '{}'", other)),
        }
    }
}

/// Endpoint and API key for one provider.
#[derive(Clone)]
pub struct Credentials {
    provider: ProviderKind,
    pub endpoint: String,
    api_key: Option<String>,
}

impl Credentials {
    pub fn new(provider: ProviderKind, endpoint: &str, api_key: Option<String>) -> Self {
        Self {
            provider,
            endpoint: endpoint.trim().to_string(),
            api_key: api_key.map(|k| k.trim().to_string()).filter(|k| !k.is_empty()),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    /// The API key, or a `Config` error naming the variable to set.
    pub fn api_key(&self) -> Result<&str, ProviderError> {
        self.api_key.as_deref().ok_or_else(|| {
            ProviderError::Config(format!("{} is not set", self.provider.api_key_variable()))
        })
    }
}

// Keys must never end up in logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("provider", &self.provider)
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Format of the PCM-16 audio the client streams.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub language: String,
}

/// Everything a session needs to start its provider.
#[derive(Debug, Clone)]
pub struct ProviderSetup {
    pub credentials: Credentials,
    pub audio: AudioConfig,
    pub drain_timeout: Duration,
}

/// The adapter owned by an STT session.
pub enum ProviderAdapter {
    Deepgram(DeepgramAdapter),
    Speechmatics(SpeechmaticsAdapter),
}

impl ProviderAdapter {
    /// Build the adapter for `kind`; its reader will publish on `events`.
    pub fn for_provider(
        kind: ProviderKind,
        config: &AppConfig,
        events: mpsc::Sender<ProviderEvent>,
    ) -> Self {
        let options = UpstreamOptions {
            connect_timeout: config.relay.connect_timeout(),
            max_message_size: config.relay.max_message_size,
        };

        match kind {
            ProviderKind::Deepgram => ProviderAdapter::Deepgram(DeepgramAdapter::new(
                config.deepgram.clone(),
                options,
                events,
            )),
            ProviderKind::Speechmatics => ProviderAdapter::Speechmatics(SpeechmaticsAdapter::new(
                config.speechmatics.clone(),
                config.relay.forward_raw_events,
                options,
                events,
            )),
        }
    }

    pub async fn start(
        &mut self,
        credentials: &Credentials,
        audio: &AudioConfig,
    ) -> Result<(), ProviderError> {
        match self {
            ProviderAdapter::Deepgram(adapter) => adapter.start(credentials, audio).await,
            ProviderAdapter::Speechmatics(adapter) => adapter.start(credentials, audio).await,
        }
    }

    pub async fn feed(&mut self, chunk: Vec<u8>) -> Result<(), ProviderError> {
        match self {
            ProviderAdapter::Deepgram(adapter) => adapter.feed(chunk).await,
            ProviderAdapter::Speechmatics(adapter) => adapter.feed(chunk).await,
        }
    }

    /// Send end-of-stream and wait at most `drain` for remaining results.
    ///
    /// Drain completion is not guaranteed: `DrainOutcome::TimedOut` means
    /// the window elapsed and the connection was released anyway.
    pub async fn finish(&mut self, drain: Duration) -> Result<DrainOutcome, ProviderError> {
        match self {
            ProviderAdapter::Deepgram(adapter) => adapter.finish(drain).await,
            ProviderAdapter::Speechmatics(adapter) => adapter.finish(drain).await,
        }
    }

    pub async fn close(&mut self) {
        match self {
            ProviderAdapter::Deepgram(adapter) => adapter.close().await,
            ProviderAdapter::Speechmatics(adapter) => adapter.close().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_kind_parsing() {
        assert_eq!("deepgram".parse::<ProviderKind>(), Ok(ProviderKind::Deepgram));
        assert_eq!("Speechmatics".parse::<ProviderKind>(), Ok(ProviderKind::Speechmatics));
        assert!("whisper".parse::<ProviderKind>().is_err());
        assert_eq!(ProviderKind::Deepgram.to_string(), "deepgram");
    }

    #[test]
    fn test_credentials_require_key() {
        let creds = Credentials::new(ProviderKind::Deepgram, "wss://api.deepgram.com/v1/listen", None);
        assert!(!creds.is_configured());
        match creds.api_key() {
            Err(ProviderError::Config(msg)) => assert!(msg.contains("DEEPGRAM_API_KEY")),
            other => panic!("expected config error, got {:?}", other),
        }

        let creds = Credentials::new(ProviderKind::Speechmatics, "wss://x/v2", Some("  ".to_string()));
        assert!(!creds.is_configured());

        let creds = Credentials::new(ProviderKind::Speechmatics, "wss://x/v2", Some(" key ".to_string()));
        assert_eq!(creds.api_key(), Ok("key"));
        let debug = format!("{:?}", creds);
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("\"key\""));
    }

    #[test]
    fn test_setup_uses_provider_section() {
        let mut config = AppConfig::default();
        config.speechmatics.language = "en".to_string();

        let setup = ProviderKind::Speechmatics.setup(&config);
        assert_eq!(setup.audio.sample_rate, 48_000);
        assert_eq!(setup.audio.language, "en");
        assert_eq!(setup.drain_timeout, Duration::from_secs(4));

        let setup = ProviderKind::Deepgram.setup(&config);
        assert_eq!(setup.audio.sample_rate, 16_000);
        assert_eq!(setup.drain_timeout, Duration::from_secs(2));
    }
}
