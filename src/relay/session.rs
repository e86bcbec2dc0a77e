//! # Session Manager
//!
//! Accepts browser connections and binds each one to a fresh upstream connection.
//!
//! ## Session Lifecycle:
//! 1. **Accepted**: a session slot is claimed and a session id assigned
//! 2. **Connecting**: the socket actor starts and dials the provider exactly once
//! 3. **Open**: frames and events flow in both directions
//! 4. **Closed**: whichever leg closes first takes the other one down with it
//!
//! The credential is checked when the manager is built. A manager can't exist
//! without one, so the server never accepts a session it could not relay.

use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::{Credential, ListenOptions, UpstreamConfig, CREDENTIAL_ENV_VAR};
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::upstream::connection;
use crate::websocket::RelaySocket;

/// Creates relay sessions. Cheap to clone; one copy lives in each worker.
#[derive(Debug, Clone)]
pub struct SessionManager {
    credential: Credential,
    upstream_url: Url,
}

impl SessionManager {
    /// Fails when the credential is missing or blank, or the upstream URL is unusable.
    pub fn new(upstream: &UpstreamConfig) -> AppResult<Self> {
        if upstream.api_key.is_blank() {
            return Err(AppError::ConfigError(format!(
                "{} not found; refusing to accept sessions",
                CREDENTIAL_ENV_VAR
            )));
        }

        Ok(Self {
            credential: upstream.api_key.clone(),
            upstream_url: Url::parse(&upstream.url)?,
        })
    }

    /// The handshake request for one upstream connection.
    pub fn upstream_request(&self, options: &ListenOptions) -> AppResult<Request> {
        connection::build_request(&self.upstream_url, &self.credential, options)
    }

    /// Accept a browser connection and start its session.
    ///
    /// Registers both legs with a new [`RelaySocket`] and returns the upgrade
    /// response right away; the upstream dial happens in the background.
    pub fn accept(
        &self,
        req: &HttpRequest,
        stream: web::Payload,
        app_state: &AppState,
    ) -> AppResult<HttpResponse> {
        let config = app_state.get_config();
        let max_sessions = config.performance.max_concurrent_sessions;

        let permit = match app_state.try_acquire_session(max_sessions) {
            Some(permit) => permit,
            None => {
                warn!(max_sessions, "Session limit reached, refusing browser connection");
                return Err(AppError::Unavailable(format!("Session limit of {} reached", max_sessions)));
            }
        };

        let session_id = Uuid::new_v4().to_string();
        let request = self.upstream_request(&config.upstream.options)?;

        info!(
            session_id = %session_id,
            peer = ?req.connection_info().peer_addr(),
            model = %config.upstream.options.model,
            "Browser connected to relay"
        );

        let socket = RelaySocket::new(session_id, request, &config, permit);
        // On a failed handshake the socket is dropped here and the permit released with it
        ws::start(socket, req, stream).map_err(|err| AppError::BadRequest(err.to_string()))
    }
}
