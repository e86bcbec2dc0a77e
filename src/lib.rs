//! # Transcription Relay
//!
//! A WebSocket relay that sits between browsers and a streaming transcription
//! provider. Browsers stream audio to `/ws`; the relay opens one authenticated
//! provider connection per browser, forwards audio up and transcription events
//! back down, and mirrors close codes between the two legs.
//!
//! ## Modules:
//! - **config**: Layered configuration (defaults, `config.toml`, environment)
//! - **state**: Shared metrics, session slots and the live configuration
//! - **relay**: The session manager and the per-session relay pump
//! - **upstream**: The provider connection task and provider event types
//! - **websocket**: The actor that hosts one relay session
//! - **health**, **handlers**, **middleware**: The operational HTTP surface
//! - **error**: Error types and their HTTP responses

pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod relay;
pub mod state;
pub mod upstream;
pub mod websocket;

use actix_web::web;

/// Register every route the relay serves.
///
/// Used by the binary and by integration tests, so both see the same app.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/ws", web::get().to(websocket::relay_websocket))
        .service(
            web::scope("/api/v1")
                .route("/health", web::get().to(health::health_check))
                .route("/metrics", web::get().to(health::detailed_metrics))
                .route("/config", web::get().to(handlers::get_config))
                .route("/config", web::put().to(handlers::update_config)),
        )
        // Also provide health check at root level for convenience
        .route("/health", web::get().to(health::health_check));
}
