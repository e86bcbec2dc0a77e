//! # WebSocket Relay Handler
//!
//! Browsers connect to `/ws` and stream binary audio; transcripts come back as JSON
//! text frames produced by the provider.
//!
//! ## Message Format:
//! - **Browser → Relay**: Binary audio frames (forwarded untouched), or text control
//!   messages such as `{"type":"KeepAlive"}` (forwarded as text)
//! - **Relay → Browser**: The provider's JSON events, byte for byte
//! - **Close**: The browser sees the provider's close code and reason, or 1011 if
//!   the provider connection failed
//!
//! ## Actor Model:
//! Each browser connection is one [`RelaySocket`] actor. Browser frames and upstream
//! events are both delivered to it as messages, so the two legs of a session are
//! handled one event at a time without any locking.

use crate::config::AppConfig;
use crate::error::AppError;
use crate::relay::{ClientFrame, RelayAction, RelayPump, SessionManager};
use crate::state::{AppState, SessionPermit};
use crate::upstream::connection::{self, UpstreamEvent, UpstreamHandle};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tracing::{debug, error, info, warn};

/// One relay session: the browser leg, the upstream leg and the pump between them.
pub struct RelaySocket {
    session_id: String,

    /// Forwarding and close-translation rules
    pump: RelayPump,

    /// Handshake request for the provider; taken on the one and only dial
    upstream_request: Option<Request>,

    /// Command channel into the upstream task, once dialed
    upstream: Option<UpstreamHandle>,

    connect_timeout: Duration,
    heartbeat_interval: Duration,
    client_timeout: Duration,

    /// Last ping/pong or frame from the browser
    last_heartbeat: Instant,

    /// Session slot, released when the actor is dropped
    permit: SessionPermit,
}

impl RelaySocket {
    pub fn new(session_id: String, upstream_request: Request, config: &AppConfig, permit: SessionPermit) -> Self {
        Self {
            pump: RelayPump::new(session_id.clone(), config.relay.forward_malformed),
            session_id,
            upstream_request: Some(upstream_request),
            upstream: None,
            connect_timeout: config.connect_timeout(),
            heartbeat_interval: Duration::from_secs(config.relay.heartbeat_interval_secs),
            client_timeout: Duration::from_secs(config.relay.client_timeout_secs),
            last_heartbeat: Instant::now(),
            permit,
        }
    }

    /// Start the upstream connection. Only the first call dials.
    fn dial_upstream(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(request) = self.upstream_request.take() else {
            warn!(session_id = %self.session_id, "Upstream already dialed for this session");
            return;
        };

        let handle = connection::spawn(
            self.session_id.clone(),
            request,
            self.connect_timeout,
            ctx.address().recipient(),
        );
        self.upstream = Some(handle);
    }

    /// Ping the browser periodically and drop it once it goes quiet.
    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(session_id = %act.session_id, "Browser heartbeat timeout, closing session");
                // stopped() closes the upstream leg
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn relay_client_frame(&mut self, frame: ClientFrame, ctx: &mut ws::WebsocketContext<Self>) {
        let writable = self.upstream.as_ref().map_or(false, UpstreamHandle::is_writable);
        if let Some(action) = self.pump.on_client_frame(frame, writable) {
            self.apply(action, ctx);
        }
    }

    fn apply(&mut self, action: RelayAction, ctx: &mut ws::WebsocketContext<Self>) {
        match action {
            RelayAction::SendUpstream(frame) => self.send_upstream(frame),
            RelayAction::SendClientText(text) => ctx.text(text),
            RelayAction::SendClientBinary(bytes) => ctx.binary(bytes),
            RelayAction::CloseClient(frame) => {
                debug!(session_id = %self.session_id, code = frame.code, "Closing browser connection");
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::from(frame.code),
                    description: Some(frame.reason),
                }));
                ctx.stop();
            }
            RelayAction::CloseUpstream => self.close_upstream(),
        }
    }

    fn send_upstream(&self, frame: ClientFrame) {
        let sent = self.upstream.as_ref().map_or(false, |upstream| upstream.send(frame));
        if !sent {
            warn!(session_id = %self.session_id, "Upstream writer gone, frame dropped");
        }
    }

    fn close_upstream(&self) {
        if let Some(upstream) = &self.upstream {
            upstream.close();
        }
    }
}

impl Actor for RelaySocket {
    type Context = ws::WebsocketContext<Self>;

    /// Called once the browser handshake completes.
    fn started(&mut self, ctx: &mut Self::Context) {
        debug!(session_id = %self.session_id, "Relay session started");
        self.dial_upstream(ctx);
        self.start_heartbeat(ctx);
    }

    /// Called when the browser leg is gone, whichever side ended the session.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(RelayAction::CloseUpstream) = self.pump.on_client_closed() {
            self.close_upstream();
        }

        let stats = self.pump.stats();
        info!(
            session_id = %self.session_id,
            frames_forwarded = stats.frames_forwarded,
            frames_dropped = stats.frames_dropped,
            events_forwarded = stats.events_forwarded,
            malformed_events = stats.malformed_events,
            last_transcript = ?self.pump.last_transcript(),
            "Relay session ended"
        );
        self.permit.record_stats(stats);
    }
}

/// Frames from the browser.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelaySocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.relay_client_frame(ClientFrame::Audio(data), ctx);
            }
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.relay_client_frame(ClientFrame::Control(text.to_string()), ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                debug!(session_id = %self.session_id, reason = ?reason, "Browser sent close");
                if let Some(action) = self.pump.on_client_closed() {
                    self.apply(action, ctx);
                }
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(session_id = %self.session_id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %self.session_id, error = %err, "Browser WebSocket error");
                ctx.stop();
            }
        }
    }
}

/// Events from the upstream task.
impl Handler<UpstreamEvent> for RelaySocket {
    type Result = ();

    fn handle(&mut self, event: UpstreamEvent, ctx: &mut Self::Context) {
        let action = match event {
            UpstreamEvent::Opened => self.pump.on_upstream_open(),
            UpstreamEvent::Message(payload) => self.pump.on_upstream_message(payload),
            UpstreamEvent::Closed { code, reason } => self.pump.on_upstream_closed(code, &reason),
            UpstreamEvent::Failed(reason) => self.pump.on_upstream_error(&reason),
        };

        if let Some(action) = action {
            self.apply(action, ctx);
        }
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Hands the request to the session manager, which upgrades it and starts the
/// session's actor. Returns 503 when the relay is at its session limit.
pub async fn relay_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
    sessions: web::Data<SessionManager>,
) -> Result<HttpResponse, AppError> {
    debug!("New WebSocket connection request from: {:?}", req.connection_info().peer_addr());
    sessions.accept(&req, stream, &app_state)
}
