//! Diagnostic sessions with no provider behind them.
//!
//! - **Echo**: every frame comes straight back, text as text and binary as binary
//! - **Byte count**: counts audio bytes and reports the running total; a stop
//!   control message ends the session with `{"done": true, "total_bytes": n}`
//!
//! Both are handy for checking a client's capture and framing without
//! spending provider credit.

use crate::events::{ClientControl, ServerMessage};
use crate::session::{ClientFrame, ClientLink, SessionOutcome, SessionReport};

use tokio::sync::mpsc;
use tracing::debug;

fn report(outcome: SessionOutcome) -> SessionReport {
    SessionReport {
        outcome,
        bytes_relayed: 0,
    }
}

pub async fn run_echo(
    link: ClientLink,
    mut inbound: mpsc::UnboundedReceiver<ClientFrame>,
) -> SessionReport {
    if link.send(&ServerMessage::System("WS connected".to_string())).is_err() {
        return report(SessionOutcome::ClientGone);
    }

    while let Some(frame) = inbound.recv().await {
        let sent = match frame {
            ClientFrame::Text(text) => link.send_text(text),
            ClientFrame::Binary(data) => link.send_binary(data),
        };
        if sent.is_err() {
            return report(SessionOutcome::ClientGone);
        }
    }

    report(SessionOutcome::ClientDisconnected)
}

pub async fn run_byte_count(
    link: ClientLink,
    mut inbound: mpsc::UnboundedReceiver<ClientFrame>,
) -> SessionReport {
    if link.send(&ServerMessage::System("Audio WS connected".to_string())).is_err() {
        return report(SessionOutcome::ClientGone);
    }

    let mut total_bytes: u64 = 0;
    while let Some(frame) = inbound.recv().await {
        let sent = match frame {
            ClientFrame::Binary(data) => {
                total_bytes += data.len() as u64;
                link.send(&ServerMessage::Bytes(total_bytes))
            }
            ClientFrame::Text(text) => match ClientControl::parse(&text) {
                Some(ClientControl::Stop) => {
                    let done = link.send(&ServerMessage::Done { total_bytes });
                    link.close();
                    return match done {
                        Ok(()) => report(SessionOutcome::Completed),
                        Err(_) => report(SessionOutcome::ClientGone),
                    };
                }
                None => {
                    debug!(text = %text, "Ignoring unrecognised control message");
                    Ok(())
                }
            },
        };
        if sent.is_err() {
            return report(SessionOutcome::ClientGone);
        }
    }

    report(SessionOutcome::ClientDisconnected)
}
