//! End-to-end relay tests with a real browser-side client and a mock provider.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use actix_web::{web, App, HttpServer};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{accept_hdr_async, connect_async};

use transcribe_relay::config::{AppConfig, Credential};
use transcribe_relay::relay::SessionManager;
use transcribe_relay::state::AppState;

const TIMEOUT: Duration = Duration::from_secs(5);

const METADATA: &str = r#"{"type":"Metadata","request_id":"req-1","duration":0.0,"channels":1}"#;
const RESULTS: &str = r#"{"type":"Results","channel":{"alternatives":[{"transcript":"hello world","confidence":0.98}]},"is_final":true,"speech_final":true}"#;

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

// ── Mock provider ──

/// Accepts provider connections one at a time. Sends `Metadata` right after the
/// handshake, reports everything it receives, and sends whatever the test queues.
struct MockProvider {
    addr: SocketAddr,
    authorization: Arc<Mutex<Option<String>>>,
    query: Arc<Mutex<Option<String>>>,
    connections: Arc<AtomicUsize>,
    outbox: mpsc::UnboundedSender<Message>,
    received: mpsc::UnboundedReceiver<Message>,
}

impl MockProvider {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let authorization = Arc::new(Mutex::new(None));
        let query = Arc::new(Mutex::new(None));
        let connections = Arc::new(AtomicUsize::new(0));
        let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<Message>();
        let (received_tx, received) = mpsc::unbounded_channel();

        let (auth_slot, query_slot, counter) = (authorization.clone(), query.clone(), connections.clone());
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);

                let (auth_slot, query_slot) = (auth_slot.clone(), query_slot.clone());
                let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                    *auth_slot.lock().unwrap() = req
                        .headers()
                        .get(AUTHORIZATION)
                        .and_then(|value| value.to_str().ok())
                        .map(str::to_string);
                    *query_slot.lock().unwrap() = req.uri().query().map(str::to_string);
                    Ok(resp)
                };

                let Ok(mut ws) = accept_hdr_async(stream, callback).await else {
                    continue;
                };
                if ws.send(Message::Text(METADATA.to_string())).await.is_err() {
                    continue;
                }

                loop {
                    tokio::select! {
                        outgoing = outbox_rx.recv() => match outgoing {
                            Some(message) => {
                                if ws.send(message).await.is_err() {
                                    break;
                                }
                            }
                            None => return,
                        },
                        incoming = ws.next() => match incoming {
                            Some(Ok(message)) => {
                                let _ = received_tx.send(message);
                            }
                            _ => break,
                        },
                    }
                }
            }
        });

        Self { addr, authorization, query, connections, outbox, received }
    }

    fn url(&self) -> String {
        format!("ws://{}/v1/listen", self.addr)
    }

    fn send(&self, message: Message) {
        self.outbox.send(message).unwrap();
    }

    async fn next_received(&mut self) -> Message {
        loop {
            let message = timeout(TIMEOUT, self.received.recv())
                .await
                .expect("provider timed out waiting for a message")
                .expect("provider channel closed");
            if !matches!(message, Message::Ping(_) | Message::Pong(_)) {
                return message;
            }
        }
    }
}

// ── Relay and client helpers ──

fn relay_config(upstream_url: &str) -> AppConfig {
    let mut config = AppConfig::default();
    config.upstream.url = upstream_url.to_string();
    config.upstream.api_key = Credential::new("test-key");
    config
}

/// Boot the relay on an ephemeral port and return its `/ws` URL.
fn boot_relay(config: AppConfig) -> String {
    let state = AppState::new(config.clone());
    let sessions = SessionManager::new(&config.upstream).unwrap();

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .app_data(web::Data::new(sessions.clone()))
            .configure(transcribe_relay::configure)
    })
    .workers(1)
    .bind(("127.0.0.1", 0))
    .unwrap();

    let addr = server.addrs()[0];
    actix_web::rt::spawn(server.run());
    format!("ws://{}/ws", addr)
}

async fn connect_client(url: &str) -> WsStream {
    let (ws, _) = timeout(TIMEOUT, connect_async(url)).await.unwrap().unwrap();
    ws
}

async fn next_message(ws: &mut WsStream) -> Message {
    loop {
        let message = timeout(TIMEOUT, ws.next())
            .await
            .expect("client timed out waiting for a message")
            .expect("client stream ended")
            .expect("client websocket error");
        if !matches!(message, Message::Ping(_) | Message::Pong(_)) {
            return message;
        }
    }
}

/// Wait until the provider's `Metadata` reaches the client, which means the
/// upstream leg is open and frames will be forwarded.
async fn wait_until_open(ws: &mut WsStream) {
    match next_message(ws).await {
        Message::Text(text) => assert_eq!(text, METADATA),
        other => panic!("expected Metadata, got {:?}", other),
    }
}

fn close_of(message: Message) -> (u16, String) {
    match message {
        Message::Close(Some(frame)) => (u16::from(frame.code), frame.reason.to_string()),
        other => panic!("expected a close frame, got {:?}", other),
    }
}

// ── Tests ──

#[actix_web::test]
async fn relays_audio_and_events_and_mirrors_close() {
    let mut provider = MockProvider::start().await;
    let relay_url = boot_relay(relay_config(&provider.url()));

    let mut client = connect_client(&relay_url).await;
    wait_until_open(&mut client).await;

    assert_eq!(provider.authorization.lock().unwrap().as_deref(), Some("Token test-key"));
    let query = provider.query.lock().unwrap().clone().unwrap();
    assert!(query.contains("model=nova-2"));
    assert!(query.contains("sample_rate=16000"));

    for chunk in [vec![1u8, 2, 3], vec![4, 5], vec![6]] {
        client.send(Message::Binary(chunk)).await.unwrap();
    }
    assert_eq!(provider.next_received().await, Message::Binary(vec![1, 2, 3]));
    assert_eq!(provider.next_received().await, Message::Binary(vec![4, 5]));
    assert_eq!(provider.next_received().await, Message::Binary(vec![6]));

    provider.send(Message::Text(RESULTS.to_string()));
    assert_eq!(next_message(&mut client).await, Message::Text(RESULTS.to_string()));

    provider.send(Message::Close(Some(CloseFrame {
        code: CloseCode::from(4000),
        reason: "done".into(),
    })));
    assert_eq!(close_of(next_message(&mut client).await), (4000, "done".to_string()));
}

#[actix_web::test]
async fn provider_close_mirrored_while_audio_streams() {
    let provider = MockProvider::start().await;
    let relay_url = boot_relay(relay_config(&provider.url()));

    for round in 0..10 {
        let mut client = connect_client(&relay_url).await;
        wait_until_open(&mut client).await;

        let (mut writer, mut reader) = client.split();
        let streamer = tokio::spawn(async move {
            while writer.send(Message::Binary(vec![0; 320])).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        provider.send(Message::Close(Some(CloseFrame {
            code: CloseCode::from(4000),
            reason: "done".into(),
        })));

        let close = loop {
            let message = timeout(TIMEOUT, reader.next())
                .await
                .expect("client timed out waiting for close")
                .expect("client stream ended")
                .expect("client websocket error");
            if let Message::Close(_) = message {
                break message;
            }
        };
        assert_eq!(close_of(close), (4000, "done".to_string()), "round {}", round);

        streamer.abort();
    }
}

#[actix_web::test]
async fn keepalive_text_is_forwarded_as_text() {
    let mut provider = MockProvider::start().await;
    let relay_url = boot_relay(relay_config(&provider.url()));

    let mut client = connect_client(&relay_url).await;
    wait_until_open(&mut client).await;

    client.send(Message::Text(r#"{"type":"KeepAlive"}"#.to_string())).await.unwrap();
    assert_eq!(provider.next_received().await, Message::Text(r#"{"type":"KeepAlive"}"#.to_string()));
}

#[actix_web::test]
async fn malformed_provider_payload_is_not_fatal() {
    let provider = MockProvider::start().await;
    let relay_url = boot_relay(relay_config(&provider.url()));

    let mut client = connect_client(&relay_url).await;
    wait_until_open(&mut client).await;

    provider.send(Message::Text("not json at all".to_string()));
    provider.send(Message::Text(RESULTS.to_string()));

    // The malformed payload is swallowed and the session keeps going
    assert_eq!(next_message(&mut client).await, Message::Text(RESULTS.to_string()));
}

#[actix_web::test]
async fn provider_close_without_status_becomes_1011() {
    let provider = MockProvider::start().await;
    let relay_url = boot_relay(relay_config(&provider.url()));

    let mut client = connect_client(&relay_url).await;
    wait_until_open(&mut client).await;

    provider.send(Message::Close(None));
    let (code, _reason) = close_of(next_message(&mut client).await);
    assert_eq!(code, 1011);
}

#[actix_web::test]
async fn unreachable_provider_closes_client_with_1011() {
    // Reserve a port and free it so nothing is listening there
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = listener.local_addr().unwrap();
    drop(listener);

    let relay_url = boot_relay(relay_config(&format!("ws://{}/v1/listen", dead_addr)));
    let mut client = connect_client(&relay_url).await;

    let (code, reason) = close_of(next_message(&mut client).await);
    assert_eq!(code, 1011);
    assert_eq!(reason, "Transcription service connection error");
}

#[actix_web::test]
async fn client_close_closes_provider_leg() {
    let mut provider = MockProvider::start().await;
    let relay_url = boot_relay(relay_config(&provider.url()));

    let mut client = connect_client(&relay_url).await;
    wait_until_open(&mut client).await;

    client
        .send(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        })))
        .await
        .unwrap();

    assert!(matches!(provider.next_received().await, Message::Close(_)));
}

#[actix_web::test]
async fn one_provider_connection_per_client() {
    let provider = MockProvider::start().await;
    let relay_url = boot_relay(relay_config(&provider.url()));

    let mut client = connect_client(&relay_url).await;
    wait_until_open(&mut client).await;
    for _ in 0..5 {
        client.send(Message::Binary(vec![0; 320])).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(provider.connections.load(Ordering::SeqCst), 1);
}

#[actix_web::test]
async fn session_limit_refuses_with_503() {
    let provider = MockProvider::start().await;
    let mut config = relay_config(&provider.url());
    config.performance.max_concurrent_sessions = 1;
    let relay_url = boot_relay(config);

    let mut first = connect_client(&relay_url).await;
    wait_until_open(&mut first).await;

    match connect_async(relay_url.as_str()).await {
        Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 503),
        other => panic!("expected 503, got {:?}", other.map(|_| ())),
    }
}
