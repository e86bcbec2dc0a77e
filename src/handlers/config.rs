use crate::{config::AppConfig, error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// The effective configuration, without the credential itself.
fn config_view(config: &AppConfig) -> serde_json::Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port
        },
        "upstream": {
            "url": config.upstream.url,
            "credential": if config.upstream.api_key.is_blank() { "unset" } else { "configured" },
            "connect_timeout_secs": config.upstream.connect_timeout_secs,
            "options": config.upstream.options
        },
        "relay": {
            "forward_malformed": config.relay.forward_malformed,
            "heartbeat_interval_secs": config.relay.heartbeat_interval_secs,
            "client_timeout_secs": config.relay.client_timeout_secs
        },
        "performance": {
            "max_concurrent_sessions": config.performance.max_concurrent_sessions
        }
    })
}

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_view(&config)
    })))
}

/// Partial update. Applies to sessions accepted after the call; running sessions
/// keep the options they were dialed with.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    // The body already parsed as JSON, so writing it back out can only fail on our side
    let json_str = serde_json::to_string(&body.into_inner())
        .map_err(|err| AppError::Internal(format!("Failed to re-encode config update: {}", err)))?;

    let mut current_config = state.get_config();
    current_config.update_from_json(&json_str)?;

    state.update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_view(&current_config)
    })))
}
