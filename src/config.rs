//! # Configuration Management
//!
//! This module handles loading and managing relay configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix, `__` between nested keys)
//! - Platform variables (`HOST`, `PORT`, `DEEPGRAM_API_KEY`)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization library for converting between Rust structs and data formats
//! - **Newtype pattern**: `Credential` wraps a `String` so it can never be printed by accident
//! - **impl blocks**: Add methods to structs
//! - **Result<T, E>**: Error handling that forces you to handle potential failures
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Platform variables (HOST, PORT, DEEPGRAM_API_KEY)
//! 2. Environment variables (APP_SERVER__PORT, APP_UPSTREAM__OPTIONS__MODEL, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use anyhow::Result;              // Better error handling with context
use serde::{Deserialize, Serialize};  // For converting to/from TOML, JSON, etc.
use std::env;                    // For reading environment variables
use std::fmt;
use std::time::Duration;

/// Default upstream endpoint for streaming transcription.
pub const DEFAULT_UPSTREAM_URL: &str = "wss://api.deepgram.com/v1/listen";

/// Environment variable holding the provider credential.
pub const CREDENTIAL_ENV_VAR: &str = "DEEPGRAM_API_KEY";

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// The HTTP listener, the upstream provider, the per-session relay behavior and
/// capacity limits change for different reasons, so each gets its own group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub relay: RelayConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
/// - `port = 10000`: Default listening port when `PORT` is not set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,  // u16 = unsigned 16-bit integer (0-65535), perfect for port numbers
}

/// Upstream transcription provider settings.
///
/// ## Fields:
/// - `url`: WebSocket endpoint of the provider's streaming API
/// - `api_key`: Credential sent as `Authorization: Token <key>` on every dial
/// - `connect_timeout_secs`: How long a dial may take before it counts as a failure
/// - `options`: Listen options encoded into the query string
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub url: String,
    pub api_key: Credential,
    pub connect_timeout_secs: u64,
    pub options: ListenOptions,
}

/// Listen options understood by the provider.
///
/// The relay never interprets these; they are only turned into query parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenOptions {
    /// Transcription model variant
    pub model: String,
    /// Recognized language tag
    pub language: String,
    /// Punctuation and formatting normalization
    pub smart_format: bool,
    /// Partial (non-final) results
    pub interim_results: bool,
    /// Raw audio sample encoding sent by the browser
    pub encoding: String,
    /// Audio sample rate in Hz
    pub sample_rate: u32,
    /// Channel count
    pub channels: u16,
}

/// Per-session relay behavior.
///
/// ## Fields:
/// - `forward_malformed`: Relay provider payloads that are not valid JSON instead of swallowing them
/// - `heartbeat_interval_secs`: How often the browser leg is pinged
/// - `client_timeout_secs`: Silence after which the browser leg is considered gone
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub forward_malformed: bool,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

/// Capacity limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,  // usize = platform-specific unsigned integer (usually 64-bit)
}

/// Provider credential.
///
/// ## Rust Concepts:
/// - **#[serde(transparent)]**: Serialized exactly like the inner `String`
/// - **Manual Debug impl**: `{:?}` prints a redacted value, so the key never reaches the logs
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw secret, only for building the Authorization header.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// First eight characters followed by an ellipsis, for startup logs.
    pub fn preview(&self) -> String {
        let head: String = self.0.chars().take(8).collect();
        format!("{}...", head)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_blank() {
            write!(f, "Credential(<unset>)")
        } else {
            write!(f, "Credential(<redacted>)")
        }
    }
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            model: "nova-2".to_string(),
            language: "en-US".to_string(),
            smart_format: true,
            interim_results: false,
            encoding: "linear16".to_string(),
            sample_rate: 16000,
            channels: 1,
        }
    }
}

impl ListenOptions {
    /// Query parameters in the order the provider documents them.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("model", self.model.clone()),
            ("language", self.language.clone()),
            ("smart_format", self.smart_format.to_string()),
            ("interim_results", self.interim_results.to_string()),
            ("encoding", self.encoding.clone()),
            ("sample_rate", self.sample_rate.to_string()),
            ("channels", self.channels.to_string()),
        ]
    }
}

/// Provides default configuration values.
///
/// ## Why defaults matter:
/// Everything except the credential has a sensible default, so a `.env` file with
/// just `DEEPGRAM_API_KEY=...` is enough to run the relay.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),  // Browsers usually connect from another machine
                port: 10000,
            },
            upstream: UpstreamConfig {
                url: DEFAULT_UPSTREAM_URL.to_string(),
                api_key: Credential::default(),  // Must come from the environment
                connect_timeout_secs: 10,
                options: ListenOptions::default(),
            },
            relay: RelayConfig {
                forward_malformed: false,
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 100,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST, PORT and DEEPGRAM_API_KEY
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=127.0.0.1`: Override server host
    /// - `APP_UPSTREAM__OPTIONS__LANGUAGE=de`: Override transcription language
    /// - `APP_RELAY__FORWARD_MALFORMED=true`: Relay undecodable provider payloads
    /// - `PORT=3000`: Special case for deployment platforms
    /// - `DEEPGRAM_API_KEY=...`: The provider credential
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            // 1. Start with defaults - converts our Default impl to config format
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // 2. Load from config.toml file (if it exists)
            .add_source(config::File::with_name("config").required(false))
            // 3. Load from environment variables with APP_ prefix
            // Example: APP_UPSTREAM__CONNECT_TIMEOUT_SECS becomes upstream.connect_timeout_secs
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        // Handle special environment variables used by deployment platforms
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var(CREDENTIAL_ENV_VAR) {
            settings = settings.set_override("upstream.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - The provider credential is present (the relay is useless without it)
    /// - Server port is not 0
    /// - The upstream URL is a ws:// or wss:// URL
    /// - Timeouts and the session cap are non-zero
    /// - The client timeout is longer than the heartbeat interval
    pub fn validate(&self) -> Result<()> {
        if self.upstream.api_key.is_blank() {
            return Err(anyhow::anyhow!("{} not found in environment or .env file", CREDENTIAL_ENV_VAR));
        }

        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        let url = url::Url::parse(&self.upstream.url)
            .map_err(|e| anyhow::anyhow!("Invalid upstream URL {}: {}", self.upstream.url, e))?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(anyhow::anyhow!("Upstream URL must use ws:// or wss://, got {}://", url.scheme()));
        }

        if self.upstream.connect_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Upstream connect timeout must be greater than 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.relay.heartbeat_interval_secs == 0 {
            return Err(anyhow::anyhow!("Heartbeat interval must be greater than 0"));
        }

        if self.relay.client_timeout_secs <= self.relay.heartbeat_interval_secs {
            return Err(anyhow::anyhow!("Client timeout must be longer than the heartbeat interval"));
        }

        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.connect_timeout_secs)
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## What can change:
    /// - `upstream.options.*`: listen options for sessions accepted afterwards
    /// - `relay.forward_malformed`
    /// - `performance.max_concurrent_sessions`
    ///
    /// The credential and the upstream URL are fixed for the life of the process;
    /// a payload that tries to set them is rejected as a whole.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;
        let mut updated = self.clone();

        if let Some(upstream) = partial_config.get("upstream") {
            if upstream.get("api_key").is_some() || upstream.get("url").is_some() {
                return Err(anyhow::anyhow!("Upstream credential and URL cannot be changed at runtime"));
            }

            if let Some(raw) = upstream.get("options") {
                let options = &mut updated.upstream.options;
                if let Some(model) = raw.get("model").and_then(|v| v.as_str()) {
                    options.model = model.to_string();
                }
                if let Some(language) = raw.get("language").and_then(|v| v.as_str()) {
                    options.language = language.to_string();
                }
                if let Some(encoding) = raw.get("encoding").and_then(|v| v.as_str()) {
                    options.encoding = encoding.to_string();
                }
                if let Some(flag) = raw.get("smart_format").and_then(|v| v.as_bool()) {
                    options.smart_format = flag;
                }
                if let Some(flag) = raw.get("interim_results").and_then(|v| v.as_bool()) {
                    options.interim_results = flag;
                }
                if let Some(rate) = raw.get("sample_rate").and_then(|v| v.as_u64()) {
                    options.sample_rate = u32::try_from(rate)
                        .map_err(|_| anyhow::anyhow!("sample_rate out of range: {}", rate))?;
                }
                if let Some(channels) = raw.get("channels").and_then(|v| v.as_u64()) {
                    options.channels = u16::try_from(channels)
                        .map_err(|_| anyhow::anyhow!("channels out of range: {}", channels))?;
                }
            }
        }

        if let Some(relay) = partial_config.get("relay") {
            if let Some(flag) = relay.get("forward_malformed").and_then(|v| v.as_bool()) {
                updated.relay.forward_malformed = flag;
            }
        }

        if let Some(performance) = partial_config.get("performance") {
            if let Some(sessions) = performance.get("max_concurrent_sessions").and_then(|v| v.as_u64()) {
                updated.performance.max_concurrent_sessions = sessions as usize;
            }
        }

        // Only commit when the result is still a valid configuration
        updated.validate()?;
        *self = updated;
        Ok(())
    }
}
