#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::panic
    )
)]

//! Ticker Relay - Live Price WebSocket Relay
//!
//! Maintains a single connection to Finnhub's real-time trade stream and
//! relays trades for one shared, client-selected ticker to every connected
//! browser over WebSocket.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pure types and rules
//!   - `ticker`: Normalized ticker symbols
//!   - `trade`: Normalized trade updates
//!   - `market_hours`: Advisory US equity session check
//!
//! - **Application**: The relay core
//!   - `ports`: Upstream connector and client channel contracts
//!   - `services`: Broadcast hub, upstream connection, reconnect scheduling
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `finnhub`: Upstream WebSocket client and codec
//!   - `websocket`: Downstream WebSocket server and protocol
//!   - `config`: Environment configuration
//!   - `health`: Health check HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//!                        ┌────────────────────────────┐
//! Finnhub WS ──events──► │ Relay task                 │ ──frames──► Client 1
//!            ◄─commands─ │  ClientBroadcastHub        │ ──frames──► Client 2
//!                        │   └ UpstreamFeedConnection │ ──frames──► Client N
//!                        └────────────────────────────┘
//!                              ▲ subscribe / disconnect
//!                              └──────────── clients
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Ticker, trade and market-hours types with no I/O.
pub mod domain;

/// Application layer - Relay services and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::market_hours::{MarketHoursGate, MarketSession};
pub use domain::ticker::{TickerError, TickerSymbol};
pub use domain::trade::TradeUpdate;

// Relay core
pub use application::services::{
    ClientBroadcastHub, RelayHandle, RelayOptions, RelayService, RelayStatus, UpstreamFeedConnection,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, Credentials, RelayConfig};

// Adapters
pub use infrastructure::finnhub::FinnhubConnector;
pub use infrastructure::websocket::{ClientServer, ClientServerError};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
