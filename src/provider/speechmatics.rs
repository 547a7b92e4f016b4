//! # Speechmatics Real-Time Adapter
//!
//! ## Wire Protocol:
//! 1. Connect to the configured endpoint with `Authorization: Bearer <key>`
//! 2. Send `StartRecognition` declaring raw `pcm_s16le` audio and the
//!    transcription config (language, partials, operating point, max delay)
//! 3. Stream raw PCM as binary frames; the provider acknowledges each one
//!    with `AudioAdded { seq_no }`
//! 4. Receive `AddPartialTranscript` / `AddTranscript`
//! 5. Send `EndOfStream { last_seq_no }`; the provider answers with
//!    `EndOfTranscript` once everything has been flushed
//!
//! ## Sequence Tracking:
//! The reader task stores the latest `seq_no` in an `AtomicU64` shared with
//! the adapter, so the end-of-stream message always carries the most recent
//! acknowledgement seen before it is sent (0 if none arrived).

use crate::config::SpeechmaticsConfig;
use crate::error::ProviderError;
use crate::events::ProviderEvent;
use crate::provider::upstream::{self, Decoded, DrainOutcome, FrameDecoder, Upstream, UpstreamOptions};
use crate::provider::{AudioConfig, Credentials, ProviderKind};

use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct SpeechmaticsAdapter {
    settings: SpeechmaticsConfig,
    forward_raw: bool,
    options: UpstreamOptions,
    events: Option<mpsc::Sender<ProviderEvent>>,
    upstream: Option<Upstream>,
    last_seq_no: Arc<AtomicU64>,
}

impl SpeechmaticsAdapter {
    pub fn new(
        settings: SpeechmaticsConfig,
        forward_raw: bool,
        options: UpstreamOptions,
        events: mpsc::Sender<ProviderEvent>,
    ) -> Self {
        Self {
            settings,
            forward_raw,
            options,
            events: Some(events),
            upstream: None,
            last_seq_no: Arc::new(AtomicU64::new(0)),
        }
    }

    fn start_recognition(&self, audio: &AudioConfig) -> Value {
        json!({
            "message": "StartRecognition",
            "audio_format": {
                "type": "raw",
                "encoding": "pcm_s16le",
                "sample_rate": audio.sample_rate
            },
            "transcription_config": {
                "language": audio.language,
                "enable_partials": self.settings.enable_partials,
                "operating_point": self.settings.operating_point,
                "max_delay": self.settings.max_delay
            }
        })
    }

    fn end_of_stream(&self) -> Value {
        json!({
            "message": "EndOfStream",
            "last_seq_no": self.last_seq_no.load(Ordering::SeqCst)
        })
    }

    /// Last `seq_no` acknowledged by the provider.
    pub fn last_seq_no(&self) -> u64 {
        self.last_seq_no.load(Ordering::SeqCst)
    }

    pub async fn start(
        &mut self,
        credentials: &Credentials,
        audio: &AudioConfig,
    ) -> Result<(), ProviderError> {
        let api_key = credentials.api_key()?;
        upstream::validate_endpoint(&credentials.endpoint)?;

        let events = self.events.take().ok_or_else(|| {
            ProviderError::Config("Speechmatics stream already started".to_string())
        })?;

        let stream = upstream::connect(
            &credentials.endpoint,
            &format!("Bearer {}", api_key),
            &self.options,
        )
        .await?;

        self.last_seq_no.store(0, Ordering::SeqCst);
        let decoder = SpeechmaticsDecoder {
            forward_raw: self.forward_raw,
            last_seq_no: self.last_seq_no.clone(),
        };
        let mut upstream = Upstream::spawn(ProviderKind::Speechmatics, stream, decoder, events);

        if let Err(err) = upstream.send_json(&self.start_recognition(audio)).await {
            upstream.release().await;
            return Err(ProviderError::Connect(format!(
                "StartRecognition not delivered: {}",
                err
            )));
        }

        info!(
            provider = "speechmatics",
            sample_rate = audio.sample_rate,
            language = %audio.language,
            operating_point = %self.settings.operating_point,
            "Connected to Speechmatics"
        );

        self.upstream = Some(upstream);
        Ok(())
    }

    pub async fn feed(&mut self, chunk: Vec<u8>) -> Result<(), ProviderError> {
        match self.upstream.as_mut() {
            Some(upstream) => upstream.send_audio(chunk).await,
            None => Err(ProviderError::NotConnected),
        }
    }

    pub async fn finish(&mut self, drain: Duration) -> Result<DrainOutcome, ProviderError> {
        debug!(last_seq_no = self.last_seq_no(), "Sending EndOfStream");
        let end_of_stream = self.end_of_stream();
        let upstream = self.upstream.as_mut().ok_or(ProviderError::NotConnected)?;
        Ok(upstream.finish(&end_of_stream, drain).await)
    }

    pub async fn close(&mut self) {
        let end_of_stream = self.end_of_stream();
        if let Some(upstream) = self.upstream.as_mut() {
            if !upstream.is_finished() {
                upstream.finish(&end_of_stream, Duration::ZERO).await;
            }
            upstream.release().await;
        }
    }
}

/// Space-joined text of the first alternative of every result.
fn extract_text(data: &Value) -> String {
    let parts: Vec<&str> = data
        .get("results")
        .and_then(Value::as_array)
        .map(|results| {
            results
                .iter()
                .filter_map(|result| {
                    result
                        .get("alternatives")
                        .and_then(Value::as_array)
                        .and_then(|alternatives| alternatives.first())
                        .and_then(|alternative| alternative.get("content"))
                        .and_then(Value::as_str)
                })
                .filter(|content| !content.is_empty())
                .collect()
        })
        .unwrap_or_default();

    parts.join(" ").trim().to_string()
}

fn parse_seq_no(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

/// Dispatches Speechmatics messages on their `message` field.
pub(crate) struct SpeechmaticsDecoder {
    forward_raw: bool,
    last_seq_no: Arc<AtomicU64>,
}

impl FrameDecoder for SpeechmaticsDecoder {
    fn decode(&mut self, text: &str) -> Result<Decoded, ProviderError> {
        let data: Value =
            serde_json::from_str(text).map_err(|e| ProviderError::Decode(e.to_string()))?;
        if !data.is_object() {
            return Err(ProviderError::Decode("expected a JSON object".to_string()));
        }

        let mut decoded = Decoded::default();
        let message = data
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_ascii_lowercase();

        if self.forward_raw {
            decoded.events.push(ProviderEvent::Raw(data.clone()));
        }

        match message.as_str() {
            "audioadded" => {
                if let Some(seq_no) = data.get("seq_no").and_then(parse_seq_no) {
                    self.last_seq_no.store(seq_no, Ordering::SeqCst);
                }
            }
            "addpartialtranscript" => {
                let text = extract_text(&data);
                if !text.is_empty() {
                    decoded.events.push(ProviderEvent::Partial(text));
                }
            }
            "addtranscript" => {
                let text = extract_text(&data);
                if !text.is_empty() {
                    decoded.events.push(ProviderEvent::Final(text));
                }
            }
            "error" => {
                let reason = data
                    .get("reason")
                    .or_else(|| data.get("type"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                decoded
                    .events
                    .push(ProviderEvent::Error(format!("Speechmatics error: {}", reason)));
            }
            "warning" => {
                warn!(provider = "speechmatics", payload = %data, "Provider warning");
            }
            "endoftranscript" => decoded.end_of_stream = true,
            _ => {}
        }

        Ok(decoded)
    }
}
