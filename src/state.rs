//! # Application State Management
//!
//! This module manages state shared by every HTTP request handler and every relay
//! session running in the process.
//!
//! Sessions never share *domain* state with each other: each one owns its two legs
//! and its pump. What lives here is the process-wide bookkeeping around them:
//! - the effective configuration (read when a session is accepted)
//! - request metrics collected by the middleware
//! - the active-session count and relay totals shown by the health endpoints
//!
//! ## Key Rust Concepts:
//! - **Arc<RwLock<T>>**: Multiple owners, many readers or one writer at a time
//! - **RAII guard**: `SessionPermit` gives a session slot back when it is dropped,
//!   however the session ends
//! - **Clone on a struct of Arcs**: Cloning `AppState` is cheap and shares the same data

use crate::config::AppConfig;        // Our configuration types
use crate::relay::RelayStats;        // Per-session counters folded in at session end
use std::collections::HashMap;       // For storing per-endpoint metrics
use std::sync::{Arc, RwLock};        // Thread-safe shared ownership and locking
use std::time::Instant;              // For tracking server uptime

/// The main application state that's shared across all HTTP request handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration (listen options can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Request and relay metrics
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started (never changes, so no Arc<RwLock> needed)
    pub start_time: Instant,
}

/// Metrics collected across all HTTP requests and relay sessions.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of errors encountered since server start
    pub error_count: u64,

    /// Relay sessions currently running
    pub active_sessions: u32,

    /// Detailed metrics for each API endpoint
    /// Key: endpoint name (e.g., "GET /health")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,

    /// Totals across all finished relay sessions
    pub relay: RelayTotals,
}

/// Detailed performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    /// Number of requests to this specific endpoint
    pub request_count: u64,

    /// Total time spent processing all requests to this endpoint (milliseconds)
    pub total_duration_ms: u64,

    /// Number of errors that occurred for this endpoint
    pub error_count: u64,
}

/// Relay counters summed over sessions.
///
/// `sessions_opened` and `sessions_rejected` are updated when a browser connects;
/// the frame and event counters when a session ends.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RelayTotals {
    pub sessions_opened: u64,
    pub sessions_rejected: u64,
    pub frames_forwarded: u64,
    pub frames_dropped: u64,
    pub events_forwarded: u64,
    pub malformed_events: u64,
}

/// A claimed session slot.
///
/// ## Why a guard:
/// A session can end in many ways (browser close, provider close, provider error,
/// heartbeat timeout, failed handshake). Releasing the slot in `Drop` means none of
/// those paths can forget to decrement the active-session count.
#[derive(Debug)]
pub struct SessionPermit {
    state: AppState,
}

impl SessionPermit {
    /// Fold a finished session's counters into the process totals.
    pub fn record_stats(&self, stats: &RelayStats) {
        self.state.record_relay_stats(stats);
    }
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        self.state.decrement_active_sessions();
    }
}

impl AppState {
    /// Create a new AppState with the given configuration.
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write().unwrap() = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.request_count += 1;
    }

    /// Increment the total error counter (called when any request fails).
    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Claim a session slot, or `None` when `max_sessions` are already running.
    ///
    /// The check and the increment happen under one write lock, so concurrent
    /// upgrades on different workers can't overshoot the limit.
    pub fn try_acquire_session(&self, max_sessions: usize) -> Option<SessionPermit> {
        let mut metrics = self.metrics.write().unwrap();
        if metrics.active_sessions as usize >= max_sessions {
            metrics.relay.sessions_rejected += 1;
            return None;
        }
        metrics.active_sessions += 1;
        metrics.relay.sessions_opened += 1;
        drop(metrics);

        Some(SessionPermit { state: self.clone() })
    }

    /// Decrement the active sessions counter (called when a session slot is released).
    ///
    /// Includes a check to prevent underflow.
    fn decrement_active_sessions(&self) {
        let mut metrics = self.metrics.write().unwrap();
        if metrics.active_sessions > 0 {
            metrics.active_sessions -= 1;
        }
    }

    pub fn record_relay_stats(&self, stats: &RelayStats) {
        let mut metrics = self.metrics.write().unwrap();
        let totals = &mut metrics.relay;
        totals.frames_forwarded += stats.frames_forwarded;
        totals.frames_dropped += stats.frames_dropped;
        totals.events_forwarded += stats.events_forwarded;
        totals.malformed_events += stats.malformed_events;
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    ///
    /// Cloning means we don't hold the lock while serializing the response.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap().clone()
    }

    /// Get server uptime in seconds.
    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average response time for this endpoint.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0  // No requests yet, so no average to calculate
        }
    }

    /// Error rate for this endpoint (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
