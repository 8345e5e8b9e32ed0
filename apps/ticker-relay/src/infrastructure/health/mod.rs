//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, relay status reporting, and Prometheus metrics.
//! Used by container orchestrators, load balancers, and monitoring systems.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status
//! - `GET /healthz` - Kubernetes liveness probe (simple OK)
//! - `GET /readyz` - Kubernetes readiness probe (checks the upstream feed)
//! - `GET /metrics` - Prometheus metrics in text format

use std::sync::Arc;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::status::{RelaySnapshot, RelayStatus, UpstreamState};
use crate::domain::market_hours::MarketHoursGate;
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Relay version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Upstream feed status.
    pub upstream: UpstreamInfo,
    /// Ticker currently relayed to all clients.
    pub active_ticker: Option<String>,
    /// Connected downstream clients.
    pub clients: usize,
    /// Trade updates queued to clients since start.
    pub trades_broadcast: u64,
    /// Market session status.
    pub market: MarketInfo,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Upstream open, or idle with nothing to relay.
    Healthy,
    /// Reconnecting while a ticker is active.
    Degraded,
    /// Retrying on the long fallback interval.
    Unhealthy,
}

/// Upstream feed status.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamInfo {
    /// Lifecycle state.
    pub state: UpstreamState,
    /// Whether the feed is open.
    pub connected: bool,
    /// Attempts since the last successful open.
    pub reconnect_attempts: u32,
    /// Whether the fallback interval is in effect.
    pub in_fallback: bool,
    /// Last successful open.
    pub last_connected_at: Option<DateTime<Utc>>,
    /// Last upstream error.
    pub last_error: Option<String>,
}

/// Market session status.
#[derive(Debug, Clone, Serialize)]
pub struct MarketInfo {
    /// Session name.
    pub session: &'static str,
    /// Whether the session is open now.
    pub open: bool,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
#[derive(Debug)]
pub struct HealthServerState {
    version: String,
    status: Arc<RelayStatus>,
    market_hours: MarketHoursGate,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub const fn new(version: String, status: Arc<RelayStatus>, market_hours: MarketHoursGate) -> Self {
        Self {
            version,
            status,
            market_hours,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
#[derive(Debug)]
pub struct HealthServer {
    addr: String,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(addr: String, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            addr,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let listener = TcpListener::bind(&self.addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.addr.clone(), e.to_string()))?;

        tracing::info!(addr = %self.addr, "Health server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

/// Build the health router.
pub fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if is_ready(&state.status.snapshot()) {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let snapshot = state.status.snapshot();

    HealthResponse {
        status: determine_health_status(&snapshot),
        version: state.version.clone(),
        uptime_secs: snapshot.uptime_secs,
        current_time: Utc::now(),
        upstream: UpstreamInfo {
            state: snapshot.upstream_state,
            connected: snapshot.upstream_state == UpstreamState::Open,
            reconnect_attempts: snapshot.reconnect_attempts,
            in_fallback: snapshot.in_fallback,
            last_connected_at: snapshot.last_connected_at,
            last_error: snapshot.last_error.clone(),
        },
        active_ticker: snapshot.active_ticker.clone(),
        clients: snapshot.clients,
        trades_broadcast: snapshot.trades_broadcast,
        market: MarketInfo {
            session: state.market_hours.session().as_str(),
            open: state.market_hours.is_open(),
        },
    }
}

fn determine_health_status(snapshot: &RelaySnapshot) -> HealthStatus {
    if snapshot.in_fallback {
        HealthStatus::Unhealthy
    } else if snapshot.upstream_state == UpstreamState::Open || snapshot.active_ticker.is_none() {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    }
}

fn is_ready(snapshot: &RelaySnapshot) -> bool {
    snapshot.active_ticker.is_none() || snapshot.upstream_state == UpstreamState::Open
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind the listener.
    #[error("failed to bind to {0}: {1}")]
    BindFailed(String, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::domain::market_hours::MarketSession;

    fn state() -> (Arc<RelayStatus>, Arc<HealthServerState>) {
        let status = Arc::new(RelayStatus::new());
        let state = Arc::new(HealthServerState::new(
            "0.1.0".to_string(),
            Arc::clone(&status),
            MarketHoursGate::new(MarketSession::regular()),
        ));
        (status, state)
    }

    async fn get(state: Arc<HealthServerState>, path: &str) -> (StatusCode, String) {
        let response = router(state)
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"degraded\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    #[test]
    fn idle_relay_is_healthy_and_ready() {
        let (status, _) = state();
        let snapshot = status.snapshot();
        assert_eq!(determine_health_status(&snapshot), HealthStatus::Healthy);
        assert!(is_ready(&snapshot));
    }

    #[test]
    fn reconnecting_with_active_ticker_is_degraded() {
        let (status, _) = state();
        status.set_active_ticker(Some("NVDA"));
        status.set_upstream_state(UpstreamState::Connecting);

        let snapshot = status.snapshot();
        assert_eq!(determine_health_status(&snapshot), HealthStatus::Degraded);
        assert!(!is_ready(&snapshot));

        status.set_upstream_state(UpstreamState::Open);
        assert_eq!(
            determine_health_status(&status.snapshot()),
            HealthStatus::Healthy
        );
    }

    #[test]
    fn fallback_is_unhealthy() {
        let (status, _) = state();
        status.set_reconnect(11, true);
        assert_eq!(
            determine_health_status(&status.snapshot()),
            HealthStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn health_endpoint_reports_relay_state() {
        let (status, state) = state();
        status.set_active_ticker(Some("AAPL"));
        status.set_upstream_state(UpstreamState::Open);
        status.set_clients(2);

        let (code, body) = get(state, "/health").await;

        assert_eq!(code, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["active_ticker"], "AAPL");
        assert_eq!(json["clients"], 2);
        assert_eq!(json["upstream"]["state"], "open");
        assert_eq!(json["market"]["session"], "regular");
    }

    #[tokio::test]
    async fn probes() {
        let (status, state) = state();
        assert_eq!(
            get(Arc::clone(&state), "/healthz").await,
            (StatusCode::OK, "OK".to_string())
        );

        status.set_active_ticker(Some("AAPL"));
        let (code, body) = get(state, "/readyz").await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "NOT READY");
    }
}
