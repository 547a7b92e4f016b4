//! # STT Session Coordinator
//!
//! Owns one client link and one provider adapter, and moves data between
//! them until the session ends.
//!
//! ## State Machine:
//! ```text
//! Connecting ──start ok──▶ Streaming ──stop / upstream closed──▶ Finishing ──▶ Closed
//!     │                        │
//!     └──start failed──────────┴──client gone / disconnected──────────────────▶ Closed
//! ```
//!
//! ## Relay Mapping:
//! | Provider event | Client message |
//! |----------------|----------------|
//! | `Partial`      | `{"partial": text}` |
//! | `Final`        | `{"final_chunk": text}` (and appended to the transcript) |
//! | `Raw`          | `{"sm_event": payload}` when raw forwarding is on |
//! | `Error`        | `{"error": reason}` |
//! | `Closed`       | moves the session to `Finishing` |
//!
//! Events keep flowing to the client while the adapter drains, so results
//! the provider flushes after end-of-stream still reach the client before
//! the aggregated `{"final": ...}` message.

use crate::config::AppConfig;
use crate::error::SessionError;
use crate::events::{aggregate_transcript, ClientControl, ProviderEvent, ServerMessage};
use crate::provider::{DrainOutcome, ProviderAdapter, ProviderKind, ProviderSetup};
use crate::session::{ClientFrame, ClientLink, SessionOutcome, SessionReport, SessionState};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Why streaming stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    ClientStop,
    UpstreamClosed,
    ClientDisconnected,
}

/// How the finishing phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainEnd {
    Finished,
    ClientDisconnected,
}

/// Client-facing half of the session: everything the relay writes to.
struct Relay {
    link: ClientLink,
    fragments: Vec<String>,
    forward_raw: bool,
}

impl Relay {
    /// Forward one provider event. `Ok(false)` means the upstream has ended.
    fn relay(&mut self, event: ProviderEvent) -> Result<bool, SessionError> {
        match event {
            ProviderEvent::Partial(text) => self.link.send(&ServerMessage::Partial(text))?,
            ProviderEvent::Final(text) => {
                self.link.send(&ServerMessage::FinalChunk(text.clone()))?;
                self.fragments.push(text);
            }
            ProviderEvent::Raw(payload) => {
                if self.forward_raw {
                    self.link.send(&ServerMessage::ProviderEvent(payload))?;
                }
            }
            ProviderEvent::Error(reason) => {
                warn!(reason = %reason, "Provider reported an error");
                self.link.send(&ServerMessage::Error(reason))?;
            }
            ProviderEvent::Closed => return Ok(false),
        }
        Ok(true)
    }
}

pub struct SttSession {
    provider: ProviderKind,
    setup: ProviderSetup,
    adapter: ProviderAdapter,
    events: Option<mpsc::Receiver<ProviderEvent>>,
    relay: Relay,
    state: SessionState,
    bytes_relayed: u64,
}

impl SttSession {
    pub fn new(provider: ProviderKind, config: &AppConfig, link: ClientLink) -> Self {
        let (tx, rx) = mpsc::channel(config.relay.event_buffer);

        Self {
            provider,
            setup: provider.setup(config),
            adapter: ProviderAdapter::for_provider(provider, config, tx),
            events: Some(rx),
            relay: Relay {
                link,
                fragments: Vec::new(),
                forward_raw: config.relay.forward_raw_events,
            },
            state: SessionState::Connecting,
            bytes_relayed: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session until it is `Closed`.
    ///
    /// The adapter is closed on every exit path; when the client disconnects
    /// that happens without waiting for the provider.
    pub async fn run(mut self, mut inbound: mpsc::UnboundedReceiver<ClientFrame>) -> SessionReport {
        let outcome = match self.drive(&mut inbound).await {
            Ok(outcome) => outcome,
            Err(SessionError::ClientGone) => {
                info!(provider = %self.provider, "Client connection lost");
                SessionOutcome::ClientGone
            }
        };

        // Closed: after a completed finish this only releases what is left;
        // on every other path it is the first and only close.
        self.adapter.close().await;
        self.state = SessionState::Closed;
        debug!(provider = %self.provider, state = ?self.state(), "Provider released");

        SessionReport {
            outcome,
            bytes_relayed: self.bytes_relayed,
        }
    }

    async fn drive(
        &mut self,
        inbound: &mut mpsc::UnboundedReceiver<ClientFrame>,
    ) -> Result<SessionOutcome, SessionError> {
        let mut events = match self.events.take() {
            Some(events) => events,
            None => return Ok(SessionOutcome::Completed),
        };

        // Connecting
        if let Err(err) = self.adapter.start(&self.setup.credentials, &self.setup.audio).await {
            warn!(provider = %self.provider, error = %err, "Provider start failed");
            self.relay.link.send(&ServerMessage::Error(err.to_string()))?;
            self.relay.link.close();
            return Ok(SessionOutcome::StartFailed(err.to_string()));
        }

        self.relay.link.send(&ServerMessage::System(format!(
            "{} STT connected",
            self.provider.label()
        )))?;
        self.state = SessionState::Streaming;

        // Streaming
        let end = self.stream(inbound, &mut events).await?;
        if end == StreamEnd::ClientDisconnected {
            return Ok(SessionOutcome::ClientDisconnected);
        }
        info!(provider = %self.provider, reason = ?end, bytes = self.bytes_relayed, "Finishing session");

        // Finishing
        self.state = SessionState::Finishing;
        if self.drain(inbound, &mut events).await? == DrainEnd::ClientDisconnected {
            info!(provider = %self.provider, "Client disconnected while finishing");
            return Ok(SessionOutcome::ClientDisconnected);
        }

        let transcript = aggregate_transcript(&self.relay.fragments);
        self.relay.link.send(&ServerMessage::Final(transcript))?;
        self.relay.link.close();

        Ok(SessionOutcome::Completed)
    }

    async fn stream(
        &mut self,
        inbound: &mut mpsc::UnboundedReceiver<ClientFrame>,
        events: &mut mpsc::Receiver<ProviderEvent>,
    ) -> Result<StreamEnd, SessionError> {
        loop {
            tokio::select! {
                frame = inbound.recv() => match frame {
                    Some(ClientFrame::Binary(chunk)) => {
                        let len = chunk.len() as u64;
                        match self.adapter.feed(chunk).await {
                            Ok(()) => self.bytes_relayed += len,
                            // The reader reports the upstream ending; keep relaying until it does.
                            Err(err) => debug!(provider = %self.provider, error = %err, "Audio chunk not forwarded"),
                        }
                    }
                    Some(ClientFrame::Text(text)) => match ClientControl::parse(&text) {
                        Some(ClientControl::Stop) => return Ok(StreamEnd::ClientStop),
                        None => debug!(text = %text, "Ignoring unrecognised control message"),
                    },
                    None => return Ok(StreamEnd::ClientDisconnected),
                },
                event = events.recv() => match event {
                    Some(event) => {
                        if !self.relay.relay(event)? {
                            return Ok(StreamEnd::UpstreamClosed);
                        }
                    }
                    None => return Ok(StreamEnd::UpstreamClosed),
                },
            }
        }
    }

    /// Finish the adapter while relaying whatever arrives during the drain.
    ///
    /// A client that disconnects meanwhile cuts the drain short; the caller
    /// then releases the upstream without waiting for the provider.
    async fn drain(
        &mut self,
        inbound: &mut mpsc::UnboundedReceiver<ClientFrame>,
        events: &mut mpsc::Receiver<ProviderEvent>,
    ) -> Result<DrainEnd, SessionError> {
        let drain_timeout = self.setup.drain_timeout;
        let relay = &mut self.relay;
        let finish = self.adapter.finish(drain_timeout);
        tokio::pin!(finish);

        let mut events_open = true;
        let result = loop {
            tokio::select! {
                result = &mut finish => break result,
                event = events.recv(), if events_open => match event {
                    Some(event) => {
                        relay.relay(event)?;
                    }
                    None => events_open = false,
                },
                frame = inbound.recv() => match frame {
                    Some(_) => debug!(provider = %self.provider, "Ignoring client frame while finishing"),
                    None => return Ok(DrainEnd::ClientDisconnected),
                },
            }
        };

        match result {
            Ok(DrainOutcome::Drained) => debug!(provider = %self.provider, "Provider drained"),
            Ok(DrainOutcome::TimedOut) => {
                info!(provider = %self.provider, "Drain window elapsed before the provider finished")
            }
            Err(err) => warn!(provider = %self.provider, error = %err, "Finish failed"),
        }

        // Events the reader queued before it stopped.
        while let Ok(event) = events.try_recv() {
            self.relay.relay(event)?;
        }
        Ok(DrainEnd::Finished)
    }
}
