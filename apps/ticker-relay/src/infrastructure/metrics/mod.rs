//! Prometheus Metrics Module
//!
//! Exposes relay metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Upstream**: feed messages by kind, connection state, reconnects
//! - **Clients**: connected clients, delivered updates, failed sends
//! - **Protocol**: malformed frames by direction, ticker switches
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! before [`init_metrics`] is a no-op.

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder.
///
/// Subsequent calls return the handle installed by the first.
///
/// # Errors
///
/// Returns [`BuildError`] if the recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Upstream
    describe_counter!(
        "ticker_relay_upstream_messages_total",
        "Messages received from the upstream feed by kind"
    );
    describe_gauge!(
        "ticker_relay_upstream_connected",
        "Whether the upstream feed connection is open (0 or 1)"
    );
    describe_counter!(
        "ticker_relay_reconnects_total",
        "Upstream reconnects scheduled by delay kind"
    );
    describe_counter!(
        "ticker_relay_upstream_errors_total",
        "Upstream connection failures and feed errors"
    );

    // Clients
    describe_gauge!(
        "ticker_relay_clients",
        "Number of connected downstream clients"
    );
    describe_counter!(
        "ticker_relay_trades_broadcast_total",
        "Trade updates queued to downstream clients"
    );
    describe_counter!(
        "ticker_relay_client_send_failures_total",
        "Frames not queued to a client by reason"
    );

    // Protocol
    describe_counter!(
        "ticker_relay_malformed_messages_total",
        "Frames or records that failed to parse by direction"
    );
    describe_counter!(
        "ticker_relay_ticker_switches_total",
        "Changes of the shared active ticker"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Which side a malformed frame came from.
#[derive(Debug, Clone, Copy)]
pub enum Direction {
    /// Frame from the upstream feed.
    Upstream,
    /// Frame from a downstream client.
    Client,
}

impl Direction {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Upstream => "upstream",
            Self::Client => "client",
        }
    }
}

/// Why a frame could not be queued to a client.
#[derive(Debug, Clone, Copy)]
pub enum SendFailure {
    /// The client's outbound queue is full.
    QueueFull,
    /// The client's writer has gone away.
    Closed,
}

impl SendFailure {
    const fn as_str(self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::Closed => "closed",
        }
    }
}

/// Record an upstream message by kind (`trade`, `ping`, `error`, ...).
pub fn record_upstream_message(kind: &str) {
    counter!(
        "ticker_relay_upstream_messages_total",
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Update the upstream connected gauge.
pub fn set_upstream_connected(connected: bool) {
    gauge!("ticker_relay_upstream_connected").set(if connected { 1.0 } else { 0.0 });
}

/// Record a scheduled reconnect.
pub fn record_reconnect(kind: &'static str) {
    counter!("ticker_relay_reconnects_total", "kind" => kind).increment(1);
}

/// Record an upstream failure.
pub fn record_upstream_error(error_type: &'static str) {
    counter!(
        "ticker_relay_upstream_errors_total",
        "error_type" => error_type
    )
    .increment(1);
}

/// Update the connected client count.
#[allow(clippy::cast_precision_loss)]
pub fn set_clients(count: usize) {
    gauge!("ticker_relay_clients").set(count as f64);
}

/// Record trade updates queued to clients.
pub fn record_trades_broadcast(count: u64) {
    counter!("ticker_relay_trades_broadcast_total").increment(count);
}

/// Record a frame that could not be queued to a client.
pub fn record_client_send_failure(reason: SendFailure) {
    counter!(
        "ticker_relay_client_send_failures_total",
        "reason" => reason.as_str()
    )
    .increment(1);
}

/// Record malformed input.
pub fn record_malformed(direction: Direction, count: u64) {
    counter!(
        "ticker_relay_malformed_messages_total",
        "direction" => direction.as_str()
    )
    .increment(count);
}

/// Record a change of the active ticker.
pub fn record_ticker_switch() {
    counter!("ticker_relay_ticker_switches_total").increment(1);
}

// =============================================================================
// Tests
// =============================================================================
