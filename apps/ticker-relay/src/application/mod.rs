//! Application Layer - Relay core and port definitions.
//!
//! This layer contains the relay services and the port interfaces that
//! connect them to the socket adapters.

/// Port interfaces for the upstream feed and downstream clients.
pub mod ports;

/// Relay services: hub, upstream connection, reconnect scheduling.
pub mod services;
