//! # Deepgram Live Adapter
//!
//! ## Wire Protocol:
//! 1. Connect to `<url>?model=..&encoding=..&sample_rate=..&channels=..&language=..`
//!    `&smart_format=..&punctuate=..&interim_results=..` with `Authorization: Token <key>`
//! 2. Stream raw PCM as binary frames, no envelope
//! 3. Receive JSON results: `channel.alternatives[0].transcript` with `is_final`
//! 4. Send `{"type": "CloseStream"}`; Deepgram flushes and closes the socket
//!
//! Frames that are not transcripts (metadata, speech-started, utterance-end,
//! or anything unparseable) are dropped without being reported.

use crate::config::DeepgramConfig;
use crate::error::ProviderError;
use crate::events::ProviderEvent;
use crate::provider::upstream::{self, Decoded, DrainOutcome, FrameDecoder, Upstream, UpstreamOptions};
use crate::provider::{AudioConfig, Credentials, ProviderKind};

use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

pub struct DeepgramAdapter {
    settings: DeepgramConfig,
    options: UpstreamOptions,
    events: Option<mpsc::Sender<ProviderEvent>>,
    upstream: Option<Upstream>,
}

impl DeepgramAdapter {
    pub fn new(
        settings: DeepgramConfig,
        options: UpstreamOptions,
        events: mpsc::Sender<ProviderEvent>,
    ) -> Self {
        Self {
            settings,
            options,
            events: Some(events),
            upstream: None,
        }
    }

    /// Listen URL with the stream parameters as query string.
    fn listen_url(&self, endpoint: &str, audio: &AudioConfig) -> String {
        let separator = if endpoint.contains('?') { '&' } else { '?' };
        format!(
            "{}{}model={}&encoding={}&sample_rate={}&channels={}&language={}&smart_format={}&punctuate={}&interim_results={}",
            endpoint,
            separator,
            self.settings.model,
            self.settings.encoding,
            audio.sample_rate,
            audio.channels,
            audio.language,
            self.settings.smart_format,
            self.settings.punctuate,
            self.settings.interim_results,
        )
    }

    pub async fn start(
        &mut self,
        credentials: &Credentials,
        audio: &AudioConfig,
    ) -> Result<(), ProviderError> {
        let api_key = credentials.api_key()?;
        upstream::validate_endpoint(&credentials.endpoint)?;

        let events = self
            .events
            .take()
            .ok_or_else(|| ProviderError::Config("Deepgram stream already started".to_string()))?;

        let url = self.listen_url(&credentials.endpoint, audio);
        let stream = upstream::connect(&url, &format!("Token {}", api_key), &self.options).await?;

        info!(
            provider = "deepgram",
            model = %self.settings.model,
            sample_rate = audio.sample_rate,
            language = %audio.language,
            "Connected to Deepgram"
        );

        self.upstream = Some(Upstream::spawn(
            ProviderKind::Deepgram,
            stream,
            DeepgramDecoder,
            events,
        ));
        Ok(())
    }

    pub async fn feed(&mut self, chunk: Vec<u8>) -> Result<(), ProviderError> {
        match self.upstream.as_mut() {
            Some(upstream) => upstream.send_audio(chunk).await,
            None => Err(ProviderError::NotConnected),
        }
    }

    pub async fn finish(&mut self, drain: Duration) -> Result<DrainOutcome, ProviderError> {
        let upstream = self.upstream.as_mut().ok_or(ProviderError::NotConnected)?;
        Ok(upstream.finish(&close_stream(), drain).await)
    }

    pub async fn close(&mut self) {
        if let Some(upstream) = self.upstream.as_mut() {
            if !upstream.is_finished() {
                upstream.finish(&close_stream(), Duration::ZERO).await;
            }
            upstream.release().await;
        }
    }
}

fn close_stream() -> Value {
    json!({ "type": "CloseStream" })
}

/// Turns Deepgram result frames into Partial/Final events.
pub(crate) struct DeepgramDecoder;

impl FrameDecoder for DeepgramDecoder {
    fn decode(&mut self, text: &str) -> Result<Decoded, ProviderError> {
        let data: Value =
            serde_json::from_str(text).map_err(|e| ProviderError::Decode(e.to_string()))?;

        // Older payloads carry `"type": "transcript"`; current ones are
        // recognised by the `channel` object alone.
        let is_transcript = data.get("type").and_then(Value::as_str) == Some("transcript")
            || data.get("channel").is_some();
        if !is_transcript {
            return Ok(Decoded::default());
        }

        let alternative = data
            .get("channel")
            .and_then(|channel| channel.get("alternatives"))
            .and_then(Value::as_array)
            .and_then(|alternatives| alternatives.first());

        let Some(alternative) = alternative else {
            return Ok(Decoded::default());
        };

        let transcript = alternative
            .get("transcript")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let is_final = data.get("is_final").and_then(Value::as_bool).unwrap_or(false);

        Ok(Decoded::event(if is_final {
            ProviderEvent::Final(transcript)
        } else {
            ProviderEvent::Partial(transcript)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::provider::testing::{FakeProvider, Script};
    use tokio_tungstenite::tungstenite::Message;

    fn decode(text: &str) -> Result<Vec<ProviderEvent>, ProviderError> {
        DeepgramDecoder.decode(text).map(|decoded| decoded.events)
    }

    fn adapter(config: &AppConfig) -> (DeepgramAdapter, mpsc::Receiver<ProviderEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let options = UpstreamOptions {
            connect_timeout: Duration::from_secs(2),
            max_message_size: 1 << 20,
        };
        (DeepgramAdapter::new(config.deepgram.clone(), options, tx), rx)
    }

    fn setup(url: &str, key: Option<&str>) -> (AppConfig, Credentials, AudioConfig) {
        let mut config = AppConfig::default();
        config.deepgram.url = url.to_string();
        config.deepgram.api_key = key.map(String::from);
        let setup = ProviderKind::Deepgram.setup(&config);
        (config, setup.credentials, setup.audio)
    }

    #[test]
    fn test_decode_partial_and_final() {
        let partial = r#"{"type":"transcript","channel":{"alternatives":[{"transcript":"ahoj"}]},"is_final":false}"#;
        assert_eq!(decode(partial).unwrap(), vec![ProviderEvent::Partial("ahoj".to_string())]);

        let final_ = r#"{"type":"transcript","channel":{"alternatives":[{"transcript":"ahoj"}]},"is_final":true}"#;
        assert_eq!(decode(final_).unwrap(), vec![ProviderEvent::Final("ahoj".to_string())]);
    }

    #[test]
    fn test_decode_structural_fallback() {
        let results = r#"{"type":"Results","channel":{"alternatives":[{"transcript":"dobrý den","confidence":0.98}]},"is_final":true}"#;
        assert_eq!(decode(results).unwrap(), vec![ProviderEvent::Final("dobrý den".to_string())]);

        let no_flag = r#"{"channel":{"alternatives":[{"transcript":"ahoj"}]}}"#;
        assert_eq!(decode(no_flag).unwrap(), vec![ProviderEvent::Partial("ahoj".to_string())]);

        let missing_transcript = r#"{"channel":{"alternatives":[{}]},"is_final":true}"#;
        assert_eq!(decode(missing_transcript).unwrap(), vec![ProviderEvent::Final(String::new())]);
    }

    #[test]
    fn test_decode_discards_non_transcripts() {
        assert!(matches!(decode("not json"), Err(ProviderError::Decode(_))));
        assert!(decode(r#"{"type":"Metadata","request_id":"abc"}"#).unwrap().is_empty());
        assert!(decode(r#"{"type":"transcript","channel":{"alternatives":[]}}"#).unwrap().is_empty());
        assert!(decode(r#"{"channel":{}}"#).unwrap().is_empty());
        assert!(decode(r#"[1,2,3]"#).unwrap().is_empty());
    }

    #[test]
    fn test_listen_url_carries_stream_parameters() {
        let (config, credentials, audio) = setup("wss://api.deepgram.com/v1/listen", Some("k"));
        let (adapter, _rx) = adapter(&config);
        assert_eq!(
            adapter.listen_url(&credentials.endpoint, &audio),
            "wss://api.deepgram.com/v1/listen?model=nova-2-general&encoding=linear16&sample_rate=16000\
             &channels=1&language=cs&smart_format=true&punctuate=true&interim_results=true"
        );
        assert!(adapter
            .listen_url("wss://api.deepgram.com/v1/listen?tier=x", &audio)
            .starts_with("wss://api.deepgram.com/v1/listen?tier=x&model="));
    }

    #[tokio::test]
    async fn test_missing_key_fails_before_connecting() {
        let fake = FakeProvider::start(Script::default()).await;
        let (config, credentials, audio) = setup(&fake.url, None);
        let (mut adapter, _rx) = adapter(&config);

        let result = adapter.start(&credentials, &audio).await;
        assert!(matches!(result, Err(ProviderError::Config(_))));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!fake.was_contacted());
        assert_eq!(adapter.feed(vec![0; 4]).await, Err(ProviderError::NotConnected));
    }

    #[tokio::test]
    async fn test_malformed_endpoint_is_config_error() {
        let (config, credentials, audio) = setup("https://api.deepgram.com/v1/listen", Some("k"));
        let (mut adapter, _rx) = adapter(&config);
        let result = adapter.start(&credentials, &audio).await;
        assert!(matches!(result, Err(ProviderError::Config(_))));
    }

    #[tokio::test]
    async fn test_audio_is_forwarded_frame_for_frame() {
        let mut fake = FakeProvider::start(Script::default()).await;
        let (config, credentials, audio) = setup(&fake.url, Some("dg-key"));
        let (mut adapter, _rx) = adapter(&config);
        adapter.start(&credentials, &audio).await.unwrap();

        let chunks: Vec<Vec<u8>> = vec![vec![1; 320], vec![2; 1], vec![3; 4096], vec![4; 17]];
        for chunk in &chunks {
            adapter.feed(chunk.clone()).await.unwrap();
        }
        adapter.finish(Duration::from_secs(2)).await.unwrap();

        let frames = fake.frames_until_end().await;
        let binaries: Vec<Vec<u8>> = frames
            .iter()
            .filter_map(|m| match m {
                Message::Binary(data) => Some(data.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(binaries, chunks);
        assert_eq!(
            binaries.iter().map(Vec::len).sum::<usize>(),
            chunks.iter().map(Vec::len).sum::<usize>()
        );
        assert_eq!(
            frames.last(),
            Some(&Message::Text(r#"{"type":"CloseStream"}"#.to_string()))
        );
        assert_eq!(fake.authorization().as_deref(), Some("Token dg-key"));
    }

    #[tokio::test]
    async fn test_reader_skips_malformed_frames() {
        let fake = FakeProvider::start(Script {
            greeting: vec![
                "definitely not json".to_string(),
                r#"{"type":"transcript","channel":{"alternatives":[{"transcript":"ahoj"}]},"is_final":false}"#.to_string(),
                r#"{"type":"Metadata"}"#.to_string(),
                r#"{"type":"transcript","channel":{"alternatives":[{"transcript":"ahoj světe"}]},"is_final":true}"#.to_string(),
            ],
            ..Script::default()
        })
        .await;
        let (config, credentials, audio) = setup(&fake.url, Some("k"));
        let (mut adapter, mut rx) = adapter(&config);
        adapter.start(&credentials, &audio).await.unwrap();

        assert_eq!(rx.recv().await, Some(ProviderEvent::Partial("ahoj".to_string())));
        assert_eq!(rx.recv().await, Some(ProviderEvent::Final("ahoj světe".to_string())));

        assert_eq!(adapter.finish(Duration::from_secs(2)).await, Ok(DrainOutcome::Drained));
        assert_eq!(rx.recv().await, Some(ProviderEvent::Closed));
    }

    #[tokio::test]
    async fn test_close_twice_sends_close_stream_once() {
        let fake = FakeProvider::start(Script::default()).await;
        let (config, credentials, audio) = setup(&fake.url, Some("k"));
        let (mut adapter, _rx) = adapter(&config);
        adapter.start(&credentials, &audio).await.unwrap();

        adapter.close().await;
        adapter.close().await;
        assert_eq!(adapter.feed(vec![1, 2]).await, Err(ProviderError::NotConnected));

        let close_streams = fake
            .all_frames()
            .await
            .into_iter()
            .filter(|m| matches!(m, Message::Text(t) if t.contains("CloseStream")))
            .count();
        assert_eq!(close_streams, 1);
    }

    #[tokio::test]
    async fn test_finish_times_out_when_provider_stays_open() {
        let fake = FakeProvider::start(Script {
            hold_open: true,
            ..Script::default()
        })
        .await;
        let (config, credentials, audio) = setup(&fake.url, Some("k"));
        let (mut adapter, _rx) = adapter(&config);
        adapter.start(&credentials, &audio).await.unwrap();

        let started = std::time::Instant::now();
        let outcome = adapter.finish(Duration::from_millis(200)).await.unwrap();
        assert_eq!(outcome, DrainOutcome::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(2));

        // Second finish is a no-op.
        assert_eq!(adapter.finish(Duration::from_millis(200)).await, Ok(DrainOutcome::Drained));
    }
}
