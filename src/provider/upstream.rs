//! # Upstream Connection and Drain Protocol
//!
//! The WebSocket plumbing every provider adapter shares: connecting with an
//! auth header, the reader task that turns provider frames into
//! [`ProviderEvent`]s, and the two-phase bounded shutdown.
//!
//! ## Shutdown Sequence:
//! 1. **End-of-stream**: The provider's control message is sent fire-and-forget;
//!    a failed send is logged, never returned (the provider may already be gone)
//! 2. **Drain**: Wait up to the drain timeout for the reader task to finish,
//!    i.e. for the provider to acknowledge and close
//! 3. **Release**: Abort the reader (if it is still running) and close the sink
//!
//! Step 2 is a bounded wait, not a guarantee: a [`DrainOutcome::TimedOut`]
//! means the provider may still have had results in flight.

use crate::error::ProviderError;
use crate::events::ProviderEvent;
use crate::provider::ProviderKind;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue, Uri},
        protocol::WebSocketConfig,
        Error as WsError, Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long closing the sink may take once the reader is gone.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Result of the bounded drain performed by `finish`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The reader task ended (provider acknowledged or closed) in time.
    Drained,
    /// The drain window elapsed first; shutdown proceeded anyway.
    TimedOut,
}

/// Connection limits applied to every upstream connection.
#[derive(Debug, Clone)]
pub struct UpstreamOptions {
    pub connect_timeout: Duration,
    pub max_message_size: usize,
}

/// What a single provider frame decoded to.
#[derive(Debug, Default)]
pub(crate) struct Decoded {
    pub events: Vec<ProviderEvent>,
    /// The provider signalled that no further results will follow.
    pub end_of_stream: bool,
}

impl Decoded {
    pub fn event(event: ProviderEvent) -> Self {
        Self {
            events: vec![event],
            end_of_stream: false,
        }
    }
}

/// Provider-specific interpretation of inbound text frames.
///
/// Runs on the reader task. A `ProviderError::Decode` return drops the frame
/// and the reader keeps going.
pub(crate) trait FrameDecoder: Send + 'static {
    fn decode(&mut self, text: &str) -> Result<Decoded, ProviderError>;
}

/// Check that an endpoint is a usable WebSocket URL.
///
/// The scheme must be `ws` or `wss` and a host must be present.
pub(crate) fn validate_endpoint(endpoint: &str) -> Result<Uri, ProviderError> {
    let uri: Uri = endpoint
        .trim()
        .parse()
        .map_err(|e| ProviderError::Config(format!("invalid endpoint URL {:?}: {}", endpoint, e)))?;

    match uri.scheme_str() {
        Some("ws") | Some("wss") => {}
        _ => {
            return Err(ProviderError::Config(format!(
                "invalid endpoint URL {:?}: scheme must be ws:// or wss://",
                endpoint
            )))
        }
    }

    if uri.host().map_or(true, str::is_empty) {
        return Err(ProviderError::Config(format!(
            "invalid endpoint URL {:?}: missing host",
            endpoint
        )));
    }

    Ok(uri)
}

/// Open the upstream WebSocket with the given `Authorization` header value.
pub(crate) async fn connect(
    url: &str,
    authorization: &str,
    options: &UpstreamOptions,
) -> Result<WsStream, ProviderError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| ProviderError::Config(format!("invalid endpoint URL: {}", e)))?;

    request.headers_mut().insert(
        AUTHORIZATION,
        HeaderValue::from_str(authorization)
            .map_err(|e| ProviderError::Config(format!("invalid API key: {}", e)))?,
    );

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(options.max_message_size);
    ws_config.max_frame_size = Some(options.max_message_size);

    let (stream, response) = timeout(
        options.connect_timeout,
        connect_async_with_config(request, Some(ws_config), true),
    )
    .await
    .map_err(|_| {
        ProviderError::Connect(format!(
            "handshake timed out after {}ms",
            options.connect_timeout.as_millis()
        ))
    })?
    .map_err(|e| ProviderError::Connect(e.to_string()))?;

    debug!(status = %response.status(), "Upstream handshake completed");
    Ok(stream)
}

/// One live provider connection: the write half plus the reader task that
/// owns the read half.
pub(crate) struct Upstream {
    provider: ProviderKind,
    sink: Option<SplitSink<WsStream, Message>>,
    reader: Option<JoinHandle<()>>,
    finished: bool,
}

impl Upstream {
    /// Split the connection and spawn the reader task.
    pub fn spawn<D: FrameDecoder>(
        provider: ProviderKind,
        stream: WsStream,
        decoder: D,
        events: mpsc::Sender<ProviderEvent>,
    ) -> Self {
        let (sink, source) = stream.split();
        let reader = tokio::spawn(read_loop(provider, source, decoder, events));

        Self {
            provider,
            sink: Some(sink),
            reader: Some(reader),
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Send a JSON control message, surfacing failures to the caller.
    pub async fn send_json(&mut self, message: &Value) -> Result<(), ProviderError> {
        self.send(Message::Text(message.to_string())).await
    }

    /// Forward one audio chunk as one binary frame.
    pub async fn send_audio(&mut self, chunk: Vec<u8>) -> Result<(), ProviderError> {
        if self.finished {
            return Err(ProviderError::NotConnected);
        }
        self.send(Message::Binary(chunk)).await
    }

    async fn send(&mut self, message: Message) -> Result<(), ProviderError> {
        let sink = self.sink.as_mut().ok_or(ProviderError::NotConnected)?;
        sink.send(message)
            .await
            .map_err(|e| ProviderError::UpstreamClosed(e.to_string()))
    }

    /// Fire-and-forget send: failures are logged only.
    async fn send_best_effort(&mut self, message: &Value) {
        if let Err(err) = self.send_json(message).await {
            warn!(provider = %self.provider, error = %err, "End-of-stream message not delivered");
        }
    }

    /// End-of-stream, bounded drain, release. A second call is a no-op.
    pub async fn finish(&mut self, end_of_stream: &Value, drain: Duration) -> DrainOutcome {
        if self.finished {
            return DrainOutcome::Drained;
        }
        self.finished = true;

        self.send_best_effort(end_of_stream).await;

        let outcome = match self.reader.as_mut() {
            Some(reader) => match timeout(drain, reader).await {
                Ok(_) => {
                    self.reader = None;
                    DrainOutcome::Drained
                }
                Err(_) => DrainOutcome::TimedOut,
            },
            None => DrainOutcome::Drained,
        };

        match outcome {
            DrainOutcome::Drained => debug!(provider = %self.provider, "Upstream drained"),
            DrainOutcome::TimedOut => info!(
                provider = %self.provider,
                drain_ms = drain.as_millis() as u64,
                "Drain window elapsed, closing upstream anyway"
            ),
        }

        self.release().await;
        outcome
    }

    /// Stop the reader and close the connection. Idempotent.
    pub async fn release(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }

        if let Some(mut sink) = self.sink.take() {
            match timeout(CLOSE_GRACE, sink.close()).await {
                Ok(Ok(())) | Ok(Err(WsError::ConnectionClosed)) | Ok(Err(WsError::AlreadyClosed)) => {}
                Ok(Err(err)) => debug!(provider = %self.provider, error = %err, "Error closing upstream"),
                Err(_) => debug!(provider = %self.provider, "Timed out closing upstream"),
            }
            info!(provider = %self.provider, "Upstream connection released");
        }
    }
}

impl Drop for Upstream {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Reader task: decode frames in arrival order and forward the events.
///
/// Always ends with `ProviderEvent::Closed`, preceded by
/// `ProviderEvent::Error` when the connection failed rather than closed.
async fn read_loop<D: FrameDecoder>(
    provider: ProviderKind,
    mut source: SplitStream<WsStream>,
    mut decoder: D,
    events: mpsc::Sender<ProviderEvent>,
) {
    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => match decoder.decode(&text) {
                Ok(decoded) => {
                    for event in decoded.events {
                        if events.send(event).await.is_err() {
                            debug!(provider = %provider, "Event receiver dropped, stopping reader");
                            return;
                        }
                    }
                    if decoded.end_of_stream {
                        debug!(provider = %provider, "Provider acknowledged end of stream");
                        break;
                    }
                }
                Err(err) => {
                    debug!(provider = %provider, error = %err, "Discarding provider frame");
                }
            },
            Ok(Message::Close(frame)) => {
                info!(provider = %provider, frame = ?frame, "Upstream closed by provider");
                break;
            }
            Ok(_) => {}
            Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => break,
            Err(err) => {
                warn!(provider = %provider, error = %err, "Upstream connection error");
                let reason = format!("{} connection error: {}", provider.label(), err);
                if events.send(ProviderEvent::Error(reason)).await.is_err() {
                    return;
                }
                break;
            }
        }
    }

    let _ = events.send(ProviderEvent::Closed).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_endpoint() {
        assert!(validate_endpoint("wss://eu1.rt.speechmatics.com/v2").is_ok());
        assert!(validate_endpoint("ws://127.0.0.1:9000/listen").is_ok());

        for bad in ["https://api.deepgram.com/v1/listen", "eu1.rt.speechmatics.com/v2", "", "wss://"] {
            match validate_endpoint(bad) {
                Err(ProviderError::Config(_)) => {}
                other => panic!("expected config error for {:?}, got {:?}", bad, other),
            }
        }
    }

    #[tokio::test]
    async fn test_connect_refused_is_connect_error() {
        // Bind and drop to get a port with nothing listening on it.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let options = UpstreamOptions {
            connect_timeout: Duration::from_secs(2),
            max_message_size: 1024,
        };
        let result = connect(&format!("ws://{}/listen", addr), "Token test", &options).await;
        assert!(matches!(result, Err(ProviderError::Connect(_))));
    }
}
