//! # Upstream Connection
//!
//! Dials the transcription provider and bridges its socket into a session.
//!
//! Each session gets exactly one upstream task. The task owns the provider socket,
//! receives write commands from the session actor over an unbounded channel, and
//! reports what happens on the provider side back to the actor as [`UpstreamEvent`]
//! messages. Per-direction ordering is preserved: one channel in, one stream out.

use actix::{Message, Recipient};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{Credential, ListenOptions};
use crate::error::{AppError, AppResult};
use crate::relay::pump::ClientFrame;

type ProviderStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// How long to wait for the provider's close reply after we hang up.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Something that happened on the provider socket.
#[derive(Message, Debug, Clone, PartialEq, Eq)]
#[rtype(result = "()")]
pub enum UpstreamEvent {
    /// Handshake completed
    Opened,
    /// A text or binary message, as raw bytes
    Message(Vec<u8>),
    /// The provider closed the socket. 1005 when it sent no status.
    Closed { code: u16, reason: String },
    /// Dial failure, dial timeout or transport error
    Failed(String),
}

/// Commands from the session actor to the upstream task.
#[derive(Debug)]
pub enum UpstreamCommand {
    Send(ClientFrame),
    Close,
}

/// The session actor's end of an upstream task.
#[derive(Debug)]
pub struct UpstreamHandle {
    commands: mpsc::UnboundedSender<UpstreamCommand>,
}

impl UpstreamHandle {
    /// Whether the upstream task is still around to take frames.
    pub fn is_writable(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Queue a frame for the provider. Returns false if the task is gone.
    pub fn send(&self, frame: ClientFrame) -> bool {
        self.commands.send(UpstreamCommand::Send(frame)).is_ok()
    }

    /// Ask the task to close the provider socket (or abandon a pending dial).
    pub fn close(&self) {
        let _ = self.commands.send(UpstreamCommand::Close);
    }
}

/// Build the provider handshake request: listen options as query parameters and
/// the credential as `Authorization: Token <key>`.
pub fn build_request(base: &Url, credential: &Credential, options: &ListenOptions) -> AppResult<Request> {
    let mut url = base.clone();
    {
        let mut query = url.query_pairs_mut();
        for (key, value) in options.query_pairs() {
            query.append_pair(key, &value);
        }
    }

    let mut request = url.as_str().into_client_request()?;
    let token = HeaderValue::from_str(&format!("Token {}", credential.expose()))
        .map_err(|_| AppError::ConfigError("Credential contains characters not allowed in a header".to_string()))?;
    request.headers_mut().insert(AUTHORIZATION, token);
    Ok(request)
}

/// Start the upstream task for one session. Called once per session.
pub fn spawn(
    session_id: String,
    request: Request,
    connect_timeout: Duration,
    events: Recipient<UpstreamEvent>,
) -> UpstreamHandle {
    let (commands, receiver) = mpsc::unbounded_channel();
    tokio::spawn(run(session_id, request, connect_timeout, receiver, events));
    UpstreamHandle { commands }
}

async fn run(
    session_id: String,
    request: Request,
    connect_timeout: Duration,
    mut commands: mpsc::UnboundedReceiver<UpstreamCommand>,
    events: Recipient<UpstreamEvent>,
) {
    info!(session_id = %session_id, uri = %request.uri().path(), "Connecting to transcription service");

    let dial = tokio::time::timeout(connect_timeout, connect_async(request));
    let stream = tokio::select! {
        result = dial => match result {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(err)) => {
                events.do_send(UpstreamEvent::Failed(err.to_string()));
                return;
            }
            Err(_) => {
                events.do_send(UpstreamEvent::Failed(format!(
                    "connection not established within {}s",
                    connect_timeout.as_secs()
                )));
                return;
            }
        },
        _ = abandoned(&mut commands) => {
            debug!(session_id = %session_id, "Browser left before the transcription service answered");
            return;
        }
    };

    events.do_send(UpstreamEvent::Opened);
    pump_socket(&session_id, stream, commands, events).await;
    debug!(session_id = %session_id, "Upstream task finished");
}

/// Resolves when the session asks to close, or drops its handle, before the dial completes.
async fn abandoned(commands: &mut mpsc::UnboundedReceiver<UpstreamCommand>) {
    loop {
        match commands.recv().await {
            Some(UpstreamCommand::Close) | None => return,
            // The pump never forwards while connecting; nothing to deliver yet.
            Some(UpstreamCommand::Send(_)) => continue,
        }
    }
}

async fn pump_socket(
    session_id: &str,
    stream: ProviderStream,
    mut commands: mpsc::UnboundedReceiver<UpstreamCommand>,
    events: Recipient<UpstreamEvent>,
) {
    let (mut sink, mut source) = stream.split();
    let mut close_frame: Option<(u16, String)> = None;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(UpstreamCommand::Send(frame)) => {
                    // The provider is hanging up; its close code is what the browser should see
                    if close_frame.is_some() {
                        debug!(session_id = %session_id, bytes = frame.len(), "Transcription service closing, frame dropped");
                        continue;
                    }
                    let message = match frame {
                        ClientFrame::Audio(bytes) => WsMessage::Binary(bytes.to_vec()),
                        ClientFrame::Control(text) => WsMessage::Text(text),
                    };
                    if let Err(err) = sink.send(message).await {
                        events.do_send(closed_or_failed(close_frame.take(), err));
                        return;
                    }
                }
                Some(UpstreamCommand::Close) | None => {
                    debug!(session_id = %session_id, "Closing transcription service connection");
                    if let Err(err) = sink.send(WsMessage::Close(None)).await {
                        debug!(session_id = %session_id, error = %err, "Close frame not sent");
                    }
                    // Let the provider's close reply arrive so the handshake completes
                    let drain = async { while let Some(Ok(_)) = source.next().await {} };
                    if tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, drain).await.is_err() {
                        warn!(session_id = %session_id, "Transcription service did not acknowledge close");
                    }
                    return;
                }
            },
            message = source.next() => match message {
                Some(Ok(WsMessage::Text(text))) => events.do_send(UpstreamEvent::Message(text.into_bytes())),
                Some(Ok(WsMessage::Binary(data))) => events.do_send(UpstreamEvent::Message(data)),
                Some(Ok(WsMessage::Close(frame))) => {
                    // tungstenite queues the close reply; the next read flushes it and ends the stream
                    close_frame = Some(match frame {
                        Some(frame) => (u16::from(frame.code), frame.reason.to_string()),
                        None => (u16::from(CloseCode::Status), String::new()),
                    });
                }
                Some(Ok(_)) => {}  // ping/pong are answered by tungstenite
                Some(Err(err)) => {
                    events.do_send(closed_or_failed(close_frame.take(), err));
                    return;
                }
                None => {
                    let (code, reason) = close_frame
                        .take()
                        .unwrap_or((u16::from(CloseCode::Status), String::new()));
                    events.do_send(UpstreamEvent::Closed { code, reason });
                    return;
                }
            }
        }
    }
}

/// A read or write error after the provider's close frame is just the end of the
/// close handshake; anything else is a transport failure.
fn closed_or_failed(close_frame: Option<(u16, String)>, err: WsError) -> UpstreamEvent {
    match (close_frame, err) {
        (Some((code, reason)), _) => UpstreamEvent::Closed { code, reason },
        (None, WsError::ConnectionClosed) | (None, WsError::AlreadyClosed) => UpstreamEvent::Closed {
            code: u16::from(CloseCode::Status),
            reason: String::new(),
        },
        (None, err) => UpstreamEvent::Failed(err.to_string()),
    }
}
