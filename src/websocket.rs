//! # WebSocket Relay Handler
//!
//! Upgrades client connections and bridges them to a session task.
//!
//! ## Endpoints:
//! - `/ws/echo/`: Echo diagnostic session
//! - `/ws/audio/`: Byte-count diagnostic session
//! - `/ws/stt/`: STT relay with the configured default provider
//! - `/ws/stt/{provider}/`: STT relay with `deepgram` or `speechmatics`
//!
//! ## Actor ↔ Session Bridge:
//! The `RelaySocket` actor never interprets frames. Text and binary frames are
//! pushed onto the session's inbound channel; whatever the session sends back
//! through its `ClientLink` arrives here as an actor stream and is written to
//! the socket. When the actor stops it drops the inbound sender, which is how
//! the session learns that the client is gone.
//!
//! ## Heartbeat:
//! The actor pings the client every `heartbeat_interval_secs` and stops the
//! connection when nothing (ping, pong or data) was heard for `client_timeout_secs`.

use crate::error::{AppError, AppResult};
use crate::provider::ProviderKind;
use crate::session::{self, ClientFrame, ClientLink, Outbound, SessionKind};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

/// One client connection.
pub struct RelaySocket {
    kind: SessionKind,
    state: AppState,
    last_heartbeat: Instant,
    /// Feeds the session task; `None` once the actor has stopped.
    inbound: Option<mpsc::UnboundedSender<ClientFrame>>,
}

impl RelaySocket {
    pub fn new(kind: SessionKind, state: AppState) -> Self {
        Self {
            kind,
            state,
            last_heartbeat: Instant::now(),
            inbound: None,
        }
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let interval = self.state.config.relay.heartbeat_interval();
        let client_timeout = self.state.config.relay.client_timeout();

        ctx.run_interval(interval, move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > client_timeout {
                warn!(kind = %act.kind, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    /// Hand a client frame to the session.
    fn forward(&mut self, frame: ClientFrame, ctx: &mut ws::WebsocketContext<Self>) {
        self.last_heartbeat = Instant::now();
        let delivered = self
            .inbound
            .as_ref()
            .map_or(false, |inbound| inbound.send(frame).is_ok());

        if !delivered {
            // The session already ended; the close it requested is on its way.
            debug!(kind = %self.kind, "Frame arrived after the session ended");
            ctx.stop();
        }
    }
}

impl Actor for RelaySocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(kind = %self.kind, "WebSocket connection started");
        self.start_heartbeat(ctx);

        let (link, outbound) = ClientLink::channel();
        ctx.add_stream(UnboundedReceiverStream::new(outbound));

        let (tx, inbound) = mpsc::unbounded_channel();
        self.inbound = Some(tx);

        tokio::spawn(session::run(self.kind, self.state.clone(), link, inbound));
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // Dropping the sender tells the session the client disconnected.
        self.inbound.take();
        info!(kind = %self.kind, "WebSocket connection stopped");
    }
}

/// Frames from the client.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelaySocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => self.forward(ClientFrame::Text(text.to_string()), ctx),
            Ok(ws::Message::Binary(data)) => self.forward(ClientFrame::Binary(data.to_vec()), ctx),
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(kind = %self.kind, reason = ?reason, "WebSocket closed by client");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(kind = %self.kind, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!(kind = %self.kind, error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

/// Messages from the session task.
impl StreamHandler<Outbound> for RelaySocket {
    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        match msg {
            Outbound::Text(text) => ctx.text(text),
            Outbound::Binary(data) => ctx.binary(data),
            Outbound::Close => {
                ctx.close(Some(ws::CloseCode::Normal.into()));
                ctx.stop();
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        // Session task ended without asking for a close.
        ctx.stop();
    }
}

fn start_session(
    kind: SessionKind,
    req: &HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    info!(
        kind = %kind,
        peer = ?req.connection_info().peer_addr(),
        "New WebSocket connection request"
    );

    let socket = RelaySocket::new(kind, app_state.get_ref().clone());
    Ok(ws::start(socket, req, stream)?)
}

/// `GET /ws/echo/`
pub async fn echo_socket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    start_session(SessionKind::Echo, &req, stream, app_state)
}

/// `GET /ws/audio/`
pub async fn audio_socket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    start_session(SessionKind::ByteCount, &req, stream, app_state)
}

/// `GET /ws/stt/`
pub async fn stt_socket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let provider = app_state.config.relay.default_provider;
    start_session(SessionKind::Stt(provider), &req, stream, app_state)
}

/// `GET /ws/stt/{provider}/`
pub async fn stt_provider_socket(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<String>,
    app_state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let provider = parse_provider(&path)?;
    start_session(SessionKind::Stt(provider), &req, stream, app_state)
}

fn parse_provider(name: &str) -> AppResult<ProviderKind> {
    name.parse::<ProviderKind>().map_err(AppError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::test::{call_service, init_service, TestRequest};
    use actix_web::App;

    fn app_state() -> web::Data<AppState> {
        web::Data::new(AppState::new(AppConfig::default()))
    }

    #[test]
    fn test_parse_provider() {
        assert_eq!(parse_provider("deepgram").unwrap(), ProviderKind::Deepgram);
        assert_eq!(parse_provider("speechmatics").unwrap(), ProviderKind::Speechmatics);
        assert!(matches!(parse_provider("whisper"), Err(AppError::NotFound(_))));
    }

    #[actix_web::test]
    async fn test_unknown_provider_route_is_not_found() {
        let app = init_service(
            App::new()
                .app_data(app_state())
                .route("/ws/stt/{provider}/", web::get().to(stt_provider_socket)),
        )
        .await;

        let req = TestRequest::get().uri("/ws/stt/whisper/").to_request();
        let resp = call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_plain_http_request_is_rejected() {
        let app = init_service(
            App::new()
                .app_data(app_state())
                .route("/ws/echo/", web::get().to(echo_socket)),
        )
        .await;

        // No upgrade headers.
        let req = TestRequest::get().uri("/ws/echo/").to_request();
        let resp = call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);
    }
}
