//! Provider events sent over the upstream socket.
//!
//! Only the fields the relay logs are modelled. Classification is best effort: a
//! payload that is valid JSON but matches none of these shapes is still provider
//! output and reaches the browser untouched, like every other field the types skip.

use serde::Deserialize;

/// A decoded provider message, discriminated by its `type` field.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ProviderEvent {
    /// Sent once after the stream opens, and again when it finishes.
    Metadata {
        request_id: Option<String>,
        duration: Option<f64>,
        channels: Option<u32>,
    },

    /// A (partial or final) transcription result.
    Results {
        channel: Option<ResultChannel>,
        is_final: Option<bool>,
        speech_final: Option<bool>,
    },

    UtteranceEnd {
        last_word_end: Option<f64>,
    },

    SpeechStarted {
        timestamp: Option<f64>,
    },

    /// Any discriminator the relay does not know about.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResultChannel {
    #[serde(default)]
    pub alternatives: Vec<Alternative>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Alternative {
    pub transcript: Option<String>,
    pub confidence: Option<f64>,
}

impl ProviderEvent {
    /// Best-effort view of an already parsed payload. `None` when the shape does not
    /// match any modelled event; the payload is still valid provider output.
    pub fn classify(value: &serde_json::Value) -> Option<Self> {
        Self::deserialize(value).ok()
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProviderEvent::Metadata { .. } => "Metadata",
            ProviderEvent::Results { .. } => "Results",
            ProviderEvent::UtteranceEnd { .. } => "UtteranceEnd",
            ProviderEvent::SpeechStarted { .. } => "SpeechStarted",
            ProviderEvent::Unknown => "Unknown",
        }
    }

    /// Transcript of the first alternative, if this is a non-empty result.
    pub fn transcript(&self) -> Option<&str> {
        match self {
            ProviderEvent::Results { channel: Some(channel), .. } => channel
                .alternatives
                .first()
                .and_then(|alt| alt.transcript.as_deref())
                .filter(|text| !text.is_empty()),
            _ => None,
        }
    }
}
