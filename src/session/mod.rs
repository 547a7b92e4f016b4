//! # Relay Sessions
//!
//! One session per client WebSocket connection. The WebSocket actor only
//! moves frames; everything else happens on the session task spawned here.
//!
//! ## Channels:
//! - **Inbound** (`ClientFrame`): unbounded, actor → session, so no audio is
//!   dropped and order is preserved. The actor dropping its sender is how the
//!   session learns the client disconnected.
//! - **Outbound** (`Outbound`): unbounded, session → actor, wrapped in
//!   [`ClientLink`]. A send failing means the actor is gone.
//!
//! ## Session Variants:
//! - `Stt(provider)`: the coordinator in [`stt`]
//! - `Echo` / `ByteCount`: the diagnostic sessions in [`diagnostic`]

pub mod diagnostic;
pub mod stt;

pub use stt::SttSession;

use crate::error::SessionError;
use crate::events::ServerMessage;
use crate::provider::ProviderKind;
use crate::state::AppState;

use std::fmt;
use tokio::sync::mpsc;
use tracing::{info, Instrument};
use uuid::Uuid;

/// A frame received from the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Binary(Vec<u8>),
    Text(String),
}

/// An instruction for the client connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Binary(Vec<u8>),
    /// Close the connection normally.
    Close,
}

/// Sending half of the client connection, owned by the session task.
#[derive(Debug, Clone)]
pub struct ClientLink {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ClientLink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn push(&self, outbound: Outbound) -> Result<(), SessionError> {
        self.tx.send(outbound).map_err(|_| SessionError::ClientGone)
    }

    pub fn send(&self, message: &ServerMessage) -> Result<(), SessionError> {
        self.push(Outbound::Text(message.to_text()))
    }

    pub fn send_text(&self, text: String) -> Result<(), SessionError> {
        self.push(Outbound::Text(text))
    }

    pub fn send_binary(&self, data: Vec<u8>) -> Result<(), SessionError> {
        self.push(Outbound::Binary(data))
    }

    /// Ask the connection to close. A client that is already gone is fine.
    pub fn close(&self) {
        let _ = self.push(Outbound::Close);
    }
}

/// Lifecycle of an STT session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Streaming,
    Finishing,
    Closed,
}

/// Which session a route runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Echo,
    ByteCount,
    Stt(ProviderKind),
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::Echo => f.write_str("echo"),
            SessionKind::ByteCount => f.write_str("audio"),
            SessionKind::Stt(provider) => write!(f, "stt:{}", provider),
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    /// Stop (or upstream end) handled, final message delivered.
    Completed,
    /// The client went away first.
    ClientDisconnected,
    /// The provider could not be started; the reason was sent to the client.
    StartFailed(String),
    /// Writing to the client failed.
    ClientGone,
}

impl SessionOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, SessionOutcome::StartFailed(_) | SessionOutcome::ClientGone)
    }
}

/// Summary returned by every session variant.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub outcome: SessionOutcome,
    /// Audio bytes forwarded upstream (0 for diagnostic sessions).
    pub bytes_relayed: u64,
}

/// Run one session to completion and record it in the relay counters.
pub async fn run(
    kind: SessionKind,
    state: AppState,
    link: ClientLink,
    inbound: mpsc::UnboundedReceiver<ClientFrame>,
) -> SessionReport {
    let session_id = Uuid::new_v4();
    let span = tracing::info_span!("session", %session_id, kind = %kind);

    async move {
        let _active = state.session_started();
        info!("Session started");

        let report = match kind {
            SessionKind::Echo => diagnostic::run_echo(link, inbound).await,
            SessionKind::ByteCount => diagnostic::run_byte_count(link, inbound).await,
            SessionKind::Stt(provider) => {
                let config = state.config();
                SttSession::new(provider, &config, link).run(inbound).await
            }
        };

        state.record_session_end(report.outcome.is_failure(), report.bytes_relayed);
        info!(
            outcome = ?report.outcome,
            bytes_relayed = report.bytes_relayed,
            "Session ended"
        );
        report
    }
    .instrument(span)
    .await
}
