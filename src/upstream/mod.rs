//! # Upstream Transcription Provider
//!
//! Everything that talks to the provider side of a session:
//! - **connection**: builds the handshake request and runs the per-session socket task
//! - **events**: decodes provider messages for diagnostics

pub mod connection;
pub mod events;

pub use connection::{UpstreamEvent, UpstreamHandle};
pub use events::ProviderEvent;
