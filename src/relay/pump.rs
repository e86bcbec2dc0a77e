//! # Relay Pump
//!
//! The per-session state machine that decides what happens to every event on
//! either leg of a session. It performs no I/O: each event handler returns at most
//! one [`RelayAction`] for the socket actor to carry out. That keeps the forwarding
//! and close-translation rules testable without opening a single socket.
//!
//! ## Upstream phases:
//! - `Connecting`: dial in progress. Browser frames are dropped, not buffered.
//! - `Open`: forwarding in both directions.
//! - `Closed`: terminal. Every later event is a no-op.

use actix_web::web::Bytes;
use tracing::{debug, error, info, warn};

use crate::upstream::events::ProviderEvent;

/// Close code sent to the browser when the upstream leg fails.
pub const ABNORMAL_CLOSURE: u16 = 1011;

/// Close reason sent to the browser when the upstream leg fails.
pub const UPSTREAM_ERROR_REASON: &str = "Transcription service connection error";

/// Close reason used when the provider closed without one.
pub const NO_REASON: &str = "No reason provided";

/// Where the upstream leg is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamPhase {
    Connecting,
    Open,
    Closed,
}

/// A frame received from the browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// Raw audio, opaque to the relay
    Audio(Bytes),
    /// Provider control message such as `{"type":"KeepAlive"}`
    Control(String),
}

impl ClientFrame {
    pub fn len(&self) -> usize {
        match self {
            ClientFrame::Audio(bytes) => bytes.len(),
            ClientFrame::Control(text) => text.len(),
        }
    }
}

/// Close code and reason for a close frame sent to the browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

impl CloseFrame {
    /// Mirror a provider close onto the browser leg.
    ///
    /// 1005, 1006 and 1015 only ever describe a close locally and must not appear
    /// in a close frame on the wire; those become [`ABNORMAL_CLOSURE`] with the
    /// reason kept.
    pub fn mirror(code: u16, reason: &str) -> Self {
        let reason = if reason.is_empty() { NO_REASON } else { reason };
        let code = if is_sendable_close_code(code) { code } else { ABNORMAL_CLOSURE };
        Self { code, reason: reason.to_string() }
    }

    pub fn upstream_error() -> Self {
        Self { code: ABNORMAL_CLOSURE, reason: UPSTREAM_ERROR_REASON.to_string() }
    }
}

fn is_sendable_close_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
}

/// What the socket actor should do in response to an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayAction {
    SendUpstream(ClientFrame),
    SendClientText(String),
    SendClientBinary(Bytes),
    CloseClient(CloseFrame),
    CloseUpstream,
}

/// Per-session counters, folded into the process metrics when the session ends.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RelayStats {
    pub frames_forwarded: u64,
    pub frames_dropped: u64,
    pub events_forwarded: u64,
    pub malformed_events: u64,
}

pub struct RelayPump {
    session_id: String,
    phase: UpstreamPhase,
    /// Set once the upstream opens; never cleared.
    upstream_ready: bool,
    client_open: bool,
    forward_malformed: bool,
    stats: RelayStats,
    last_transcript: Option<String>,
}

impl RelayPump {
    pub fn new(session_id: impl Into<String>, forward_malformed: bool) -> Self {
        Self {
            session_id: session_id.into(),
            phase: UpstreamPhase::Connecting,
            upstream_ready: false,
            client_open: true,
            forward_malformed,
            stats: RelayStats::default(),
            last_transcript: None,
        }
    }

    pub fn phase(&self) -> UpstreamPhase {
        self.phase
    }

    pub fn is_upstream_ready(&self) -> bool {
        self.upstream_ready
    }

    pub fn is_client_open(&self) -> bool {
        self.client_open
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    /// Most recent non-empty transcript seen on this session.
    pub fn last_transcript(&self) -> Option<&str> {
        self.last_transcript.as_deref()
    }

    /// The upstream handshake completed.
    pub fn on_upstream_open(&mut self) -> Option<RelayAction> {
        match self.phase {
            UpstreamPhase::Connecting => {
                info!(session_id = %self.session_id, "Connected to transcription service");
                self.phase = UpstreamPhase::Open;
                self.upstream_ready = true;
                None
            }
            // The browser left while we were dialing; hang up right away.
            UpstreamPhase::Closed => Some(RelayAction::CloseUpstream),
            UpstreamPhase::Open => None,
        }
    }

    /// A frame arrived from the browser.
    ///
    /// `upstream_writable` reports whether the upstream writer can still accept
    /// frames; it is only consulted once the upstream is open.
    pub fn on_client_frame(&mut self, frame: ClientFrame, upstream_writable: bool) -> Option<RelayAction> {
        if !self.client_open {
            return None;
        }

        match self.phase {
            UpstreamPhase::Closed => None,
            UpstreamPhase::Connecting => {
                warn!(
                    session_id = %self.session_id,
                    bytes = frame.len(),
                    "Transcription service not connected yet, dropping frame"
                );
                self.stats.frames_dropped += 1;
                None
            }
            UpstreamPhase::Open if !upstream_writable => {
                warn!(
                    session_id = %self.session_id,
                    bytes = frame.len(),
                    "Transcription service connection not writable, dropping frame"
                );
                self.stats.frames_dropped += 1;
                None
            }
            UpstreamPhase::Open => {
                self.stats.frames_forwarded += 1;
                Some(RelayAction::SendUpstream(frame))
            }
        }
    }

    /// A message arrived from the provider.
    pub fn on_upstream_message(&mut self, payload: Vec<u8>) -> Option<RelayAction> {
        if self.phase == UpstreamPhase::Closed || !self.client_open {
            return None;
        }

        // Any JSON is forwarded; the event type only drives diagnostics
        match serde_json::from_slice::<serde_json::Value>(&payload) {
            Ok(value) => {
                match ProviderEvent::classify(&value) {
                    Some(event) => self.observe(&event),
                    None => debug!(session_id = %self.session_id, "Provider message with unrecognized shape"),
                }
                // serde_json only accepts valid UTF-8
                match String::from_utf8(payload) {
                    Ok(text) => {
                        self.stats.events_forwarded += 1;
                        Some(RelayAction::SendClientText(text))
                    }
                    Err(err) => {
                        self.stats.malformed_events += 1;
                        error!(session_id = %self.session_id, error = %err, "Provider message is not UTF-8");
                        None
                    }
                }
            }
            Err(err) => {
                self.stats.malformed_events += 1;
                error!(session_id = %self.session_id, error = %err, "Error processing provider message");

                if !self.forward_malformed {
                    return None;
                }

                self.stats.events_forwarded += 1;
                match String::from_utf8(payload) {
                    Ok(text) => Some(RelayAction::SendClientText(text)),
                    Err(err) => Some(RelayAction::SendClientBinary(Bytes::from(err.into_bytes()))),
                }
            }
        }
    }

    /// The upstream failed (handshake rejected, network error, dial timeout).
    pub fn on_upstream_error(&mut self, reason: &str) -> Option<RelayAction> {
        if self.phase == UpstreamPhase::Closed {
            return None;
        }

        error!(session_id = %self.session_id, error = %reason, "Transcription service error");
        self.phase = UpstreamPhase::Closed;
        self.close_client(CloseFrame::upstream_error())
    }

    /// The provider closed the upstream socket.
    pub fn on_upstream_closed(&mut self, code: u16, reason: &str) -> Option<RelayAction> {
        if self.phase == UpstreamPhase::Closed {
            return None;
        }

        let shown = if reason.is_empty() { NO_REASON } else { reason };
        info!(session_id = %self.session_id, code, reason = %shown, "Transcription service connection closed");
        match code {
            1002 => error!(session_id = %self.session_id, "Protocol error, check API key and listen options"),
            1005 => error!(session_id = %self.session_id, "No status received, possible authentication issue"),
            1006 => error!(session_id = %self.session_id, "Abnormal closure, network dropped"),
            _ => {}
        }

        self.phase = UpstreamPhase::Closed;
        self.close_client(CloseFrame::mirror(code, reason))
    }

    /// The browser closed its socket (or went silent past the heartbeat timeout).
    pub fn on_client_closed(&mut self) -> Option<RelayAction> {
        if !self.client_open {
            return None;
        }

        info!(session_id = %self.session_id, "Browser disconnected");
        self.client_open = false;

        match self.phase {
            UpstreamPhase::Closed => None,
            UpstreamPhase::Connecting | UpstreamPhase::Open => {
                self.phase = UpstreamPhase::Closed;
                Some(RelayAction::CloseUpstream)
            }
        }
    }

    fn close_client(&mut self, frame: CloseFrame) -> Option<RelayAction> {
        if !self.client_open {
            return None;
        }
        self.client_open = false;
        Some(RelayAction::CloseClient(frame))
    }

    fn observe(&mut self, event: &ProviderEvent) {
        match event {
            ProviderEvent::Metadata { request_id, .. } => {
                info!(session_id = %self.session_id, request_id = ?request_id, "Transcription service metadata");
            }
            ProviderEvent::Results { .. } => {
                if let Some(transcript) = event.transcript() {
                    info!(session_id = %self.session_id, transcript = %transcript, "Transcript");
                    self.last_transcript = Some(transcript.to_string());
                }
            }
            other => {
                debug!(session_id = %self.session_id, kind = other.kind(), "Provider event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio(bytes: &'static [u8]) -> ClientFrame {
        ClientFrame::Audio(Bytes::from_static(bytes))
    }

    fn open_pump() -> RelayPump {
        let mut pump = RelayPump::new("test-session", false);
        assert_eq!(pump.on_upstream_open(), None);
        pump
    }

    #[test]
    fn test_starts_connecting() {
        let pump = RelayPump::new("s", false);
        assert_eq!(pump.phase(), UpstreamPhase::Connecting);
        assert!(!pump.is_upstream_ready());
        assert!(pump.is_client_open());
    }

    #[test]
    fn test_frames_while_connecting_are_dropped() {
        let mut pump = RelayPump::new("s", false);
        assert_eq!(pump.on_client_frame(audio(b"early"), true), None);
        assert_eq!(pump.stats().frames_dropped, 1);
        assert_eq!(pump.stats().frames_forwarded, 0);
    }

    #[test]
    fn test_frame_before_open_dropped_frame_after_open_forwarded() {
        let mut pump = RelayPump::new("s", false);
        assert_eq!(pump.on_client_frame(audio(b"first"), true), None);

        pump.on_upstream_open();
        assert_eq!(
            pump.on_client_frame(audio(b"second"), true),
            Some(RelayAction::SendUpstream(audio(b"second")))
        );
        assert_eq!(pump.stats().frames_dropped, 1);
        assert_eq!(pump.stats().frames_forwarded, 1);
    }

    #[test]
    fn test_frames_forwarded_in_order_unmodified() {
        let mut pump = open_pump();
        let frames: [&'static [u8]; 3] = [b"\x00\x01", b"\x02\x03\x04", b"\xff"];
        let actions: Vec<_> = frames
            .iter()
            .filter_map(|f| pump.on_client_frame(audio(*f), true))
            .collect();
        assert_eq!(
            actions,
            frames.iter().map(|f| RelayAction::SendUpstream(audio(*f))).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_control_frames_forwarded_as_text() {
        let mut pump = open_pump();
        let keepalive = ClientFrame::Control(r#"{"type":"KeepAlive"}"#.to_string());
        assert_eq!(
            pump.on_client_frame(keepalive.clone(), true),
            Some(RelayAction::SendUpstream(keepalive))
        );
    }

    #[test]
    fn test_open_but_not_writable_drops() {
        let mut pump = open_pump();
        assert_eq!(pump.on_client_frame(audio(b"x"), false), None);
        assert_eq!(pump.stats().frames_dropped, 1);
        // Still open: the next writable frame goes through
        assert!(pump.on_client_frame(audio(b"y"), true).is_some());
    }

    #[test]
    fn test_ready_flag_never_resets() {
        let mut pump = open_pump();
        assert!(pump.is_upstream_ready());
        pump.on_upstream_closed(1000, "done");
        assert!(pump.is_upstream_ready());
        assert_eq!(pump.phase(), UpstreamPhase::Closed);
    }

    #[test]
    fn test_results_forwarded_verbatim() {
        let mut pump = open_pump();
        let payload = r#"{"type":"Results","channel":{"alternatives":[{"transcript":"hello"}]}}"#;
        assert_eq!(
            pump.on_upstream_message(payload.as_bytes().to_vec()),
            Some(RelayAction::SendClientText(payload.to_string()))
        );
        assert_eq!(pump.last_transcript(), Some("hello"));
        assert_eq!(pump.stats().events_forwarded, 1);
    }

    #[test]
    fn test_unknown_fields_and_whitespace_preserved() {
        let mut pump = open_pump();
        let payload = "{ \"type\" : \"Metadata\",\n  \"extra\": [1, 2, 3] }";
        assert_eq!(
            pump.on_upstream_message(payload.as_bytes().to_vec()),
            Some(RelayAction::SendClientText(payload.to_string()))
        );
    }

    #[test]
    fn test_any_json_forwarded_regardless_of_shape() {
        let payloads = [
            r#"{"type":"Metadata","request_id":12345}"#,
            r#"{"type":"Results","channel":{"alternatives":[{"transcript":"hi","confidence":"high"}]}}"#,
            r#"{"event":"no type field"}"#,
            r#"{"type":7}"#,
        ];
        let mut pump = open_pump();
        for payload in payloads {
            assert_eq!(
                pump.on_upstream_message(payload.as_bytes().to_vec()),
                Some(RelayAction::SendClientText(payload.to_string())),
                "{}",
                payload
            );
        }
        assert_eq!(pump.stats().events_forwarded, 4);
        assert_eq!(pump.stats().malformed_events, 0);
        // Shape mismatches are not mined for transcripts
        assert_eq!(pump.last_transcript(), None);
    }

    #[test]
    fn test_malformed_payload_swallowed_by_default() {
        let mut pump = open_pump();
        assert_eq!(pump.on_upstream_message(b"{oops".to_vec()), None);
        assert!(pump.is_client_open());
        assert_eq!(pump.phase(), UpstreamPhase::Open);
        assert_eq!(pump.stats().malformed_events, 1);

        // Later valid messages still flow
        let payload = r#"{"type":"Results","channel":{"alternatives":[{"transcript":"after"}]}}"#;
        assert_eq!(
            pump.on_upstream_message(payload.as_bytes().to_vec()),
            Some(RelayAction::SendClientText(payload.to_string()))
        );
    }

    #[test]
    fn test_malformed_payload_forwarded_raw_when_enabled() {
        let mut pump = RelayPump::new("s", true);
        pump.on_upstream_open();
        assert_eq!(
            pump.on_upstream_message(b"{oops".to_vec()),
            Some(RelayAction::SendClientText("{oops".to_string()))
        );
        assert_eq!(
            pump.on_upstream_message(vec![0xff, 0x00]),
            Some(RelayAction::SendClientBinary(Bytes::from_static(&[0xff, 0x00])))
        );
        assert_eq!(pump.stats().malformed_events, 2);
        assert!(pump.is_client_open());
    }

    #[test]
    fn test_upstream_close_mirrored() {
        let mut pump = open_pump();
        assert_eq!(
            pump.on_upstream_closed(4000, "stream finished"),
            Some(RelayAction::CloseClient(CloseFrame { code: 4000, reason: "stream finished".to_string() }))
        );
        assert!(!pump.is_client_open());
    }

    #[test]
    fn test_upstream_close_without_reason() {
        let mut pump = open_pump();
        assert_eq!(
            pump.on_upstream_closed(1000, ""),
            Some(RelayAction::CloseClient(CloseFrame { code: 1000, reason: NO_REASON.to_string() }))
        );
    }

    #[test]
    fn test_reserved_close_codes_translated() {
        for code in [1005, 1006, 1015] {
            let mut pump = open_pump();
            assert_eq!(
                pump.on_upstream_closed(code, "gone"),
                Some(RelayAction::CloseClient(CloseFrame { code: ABNORMAL_CLOSURE, reason: "gone".to_string() }))
            );
        }
    }

    #[test]
    fn test_upstream_error_closes_client_abnormally() {
        for reason in ["HTTP error: 401 Unauthorized", "connection reset", ""] {
            let mut pump = RelayPump::new("s", false);
            assert_eq!(
                pump.on_upstream_error(reason),
                Some(RelayAction::CloseClient(CloseFrame::upstream_error()))
            );
            assert_eq!(pump.phase(), UpstreamPhase::Closed);
        }
    }

    #[test]
    fn test_error_then_close_only_closes_client_once() {
        let mut pump = open_pump();
        assert!(pump.on_upstream_error("reset").is_some());
        assert_eq!(pump.on_upstream_closed(1006, ""), None);
        assert_eq!(pump.on_client_closed(), None);
    }

    #[test]
    fn test_client_close_closes_upstream() {
        let mut pump = open_pump();
        assert_eq!(pump.on_client_closed(), Some(RelayAction::CloseUpstream));
        assert_eq!(pump.phase(), UpstreamPhase::Closed);

        // Nothing is forwarded afterwards in either direction
        assert_eq!(pump.on_client_frame(audio(b"late"), true), None);
        assert_eq!(pump.on_upstream_message(br#"{"type":"Metadata"}"#.to_vec()), None);
        assert_eq!(pump.on_upstream_closed(1000, "bye"), None);
        assert_eq!(pump.on_client_closed(), None);
    }

    #[test]
    fn test_client_close_while_connecting_abandons_dial() {
        let mut pump = RelayPump::new("s", false);
        assert_eq!(pump.on_client_closed(), Some(RelayAction::CloseUpstream));
        // The dial finished anyway: hang up
        assert_eq!(pump.on_upstream_open(), Some(RelayAction::CloseUpstream));
        assert!(!pump.is_upstream_ready());
    }

    #[test]
    fn test_closed_is_terminal_after_upstream_close() {
        let mut pump = open_pump();
        pump.on_upstream_closed(1000, "done");
        assert_eq!(pump.on_client_frame(audio(b"x"), true), None);
        assert_eq!(pump.on_upstream_message(br#"{"type":"Metadata"}"#.to_vec()), None);
        assert_eq!(pump.on_upstream_error("late"), None);
        assert_eq!(pump.stats().frames_dropped, 0);
    }
}
