//! Relay Status Tracking
//!
//! Shared, read-mostly view of the relay written by the relay task and read
//! by the health server.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

/// Upstream lifecycle state as seen from outside the relay task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamState {
    /// No connection and none in progress.
    #[default]
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Connected and able to carry subscriptions.
    Open,
    /// Graceful close in progress during shutdown.
    Closing,
}

impl UpstreamState {
    /// State name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
        }
    }

    /// Whether a connection exists or is being established.
    #[must_use]
    pub const fn is_up(&self) -> bool {
        matches!(self, Self::Connecting | Self::Open)
    }
}

/// Point-in-time copy of [`RelayStatus`].
#[derive(Debug, Clone, Serialize)]
pub struct RelaySnapshot {
    /// Upstream lifecycle state.
    pub upstream_state: UpstreamState,
    /// Ticker currently relayed to all clients.
    pub active_ticker: Option<String>,
    /// Connected downstream clients.
    pub clients: usize,
    /// Reconnect attempts since the last successful open.
    pub reconnect_attempts: u32,
    /// Whether the long fallback retry interval is in effect.
    pub in_fallback: bool,
    /// Trade updates delivered to client queues.
    pub trades_broadcast: u64,
    /// Last successful upstream open.
    pub last_connected_at: Option<DateTime<Utc>>,
    /// Last upstream error.
    pub last_error: Option<String>,
    /// Seconds since the relay started.
    pub uptime_secs: u64,
}

/// Shared relay status.
#[derive(Debug)]
pub struct RelayStatus {
    started_at: Instant,
    upstream_state: RwLock<UpstreamState>,
    active_ticker: RwLock<Option<String>>,
    last_connected_at: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
    clients: AtomicUsize,
    reconnect_attempts: AtomicU32,
    in_fallback: AtomicBool,
    trades_broadcast: AtomicU64,
}

impl Default for RelayStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayStatus {
    /// Create status for a freshly started relay.
    #[must_use]
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            upstream_state: RwLock::new(UpstreamState::Disconnected),
            active_ticker: RwLock::new(None),
            last_connected_at: RwLock::new(None),
            last_error: RwLock::new(None),
            clients: AtomicUsize::new(0),
            reconnect_attempts: AtomicU32::new(0),
            in_fallback: AtomicBool::new(false),
            trades_broadcast: AtomicU64::new(0),
        }
    }

    /// Record the upstream state; an `Open` transition stamps the connect time
    /// and clears the last error.
    pub fn set_upstream_state(&self, state: UpstreamState) {
        let previous = std::mem::replace(&mut *self.upstream_state.write(), state);
        if state == UpstreamState::Open && previous != UpstreamState::Open {
            *self.last_connected_at.write() = Some(Utc::now());
            *self.last_error.write() = None;
        }
    }

    /// Record the latest upstream error.
    pub fn set_error(&self, message: impl Into<String>) {
        *self.last_error.write() = Some(message.into());
    }

    /// Record the active ticker.
    pub fn set_active_ticker(&self, ticker: Option<&str>) {
        *self.active_ticker.write() = ticker.map(ToString::to_string);
    }

    /// Record the connected client count.
    pub fn set_clients(&self, count: usize) {
        self.clients.store(count, Ordering::Relaxed);
    }

    /// Record reconnect progress.
    pub fn set_reconnect(&self, attempts: u32, in_fallback: bool) {
        self.reconnect_attempts.store(attempts, Ordering::Relaxed);
        self.in_fallback.store(in_fallback, Ordering::Relaxed);
    }

    /// Add delivered trade updates.
    pub fn add_trades_broadcast(&self, count: u64) {
        self.trades_broadcast.fetch_add(count, Ordering::Relaxed);
    }

    /// Current upstream state.
    #[must_use]
    pub fn upstream_state(&self) -> UpstreamState {
        *self.upstream_state.read()
    }

    /// Copy out the current status.
    #[must_use]
    pub fn snapshot(&self) -> RelaySnapshot {
        RelaySnapshot {
            upstream_state: *self.upstream_state.read(),
            active_ticker: self.active_ticker.read().clone(),
            clients: self.clients.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            in_fallback: self.in_fallback.load(Ordering::Relaxed),
            trades_broadcast: self.trades_broadcast.load(Ordering::Relaxed),
            last_connected_at: *self.last_connected_at.read(),
            last_error: self.last_error.read().clone(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_transition_stamps_connect_time_and_clears_error() {
        let status = RelayStatus::new();
        status.set_error("boom");
        assert!(status.snapshot().last_connected_at.is_none());

        status.set_upstream_state(UpstreamState::Open);

        let snapshot = status.snapshot();
        assert_eq!(snapshot.upstream_state, UpstreamState::Open);
        assert!(snapshot.last_connected_at.is_some());
        assert!(snapshot.last_error.is_none());
    }

    #[test]
    fn counters_accumulate() {
        let status = RelayStatus::new();
        status.set_clients(3);
        status.add_trades_broadcast(2);
        status.add_trades_broadcast(5);
        status.set_reconnect(4, true);
        status.set_active_ticker(Some("NVDA"));

        let snapshot = status.snapshot();
        assert_eq!(snapshot.clients, 3);
        assert_eq!(snapshot.trades_broadcast, 7);
        assert_eq!(snapshot.reconnect_attempts, 4);
        assert!(snapshot.in_fallback);
        assert_eq!(snapshot.active_ticker.as_deref(), Some("NVDA"));
    }

    #[test]
    fn state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&UpstreamState::Connecting).unwrap(),
            "\"connecting\""
        );
        assert!(UpstreamState::Open.is_up());
        assert!(!UpstreamState::Closing.is_up());
    }
}
