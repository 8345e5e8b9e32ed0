//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the socket adapters that implement the application
//! ports, plus configuration and observability.

/// Finnhub trade feed client and codec.
pub mod finnhub;

/// Browser-facing WebSocket server and protocol.
pub mod websocket;

/// Environment configuration.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Logging and OpenTelemetry tracing integration.
pub mod telemetry;
