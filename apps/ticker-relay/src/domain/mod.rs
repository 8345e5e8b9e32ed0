//! Domain Layer - Core relay types and business rules.
//!
//! This layer contains the pure domain types for the live price relay with
//! no I/O. Everything here is deterministic and unit-testable.

/// Normalized ticker symbols.
pub mod ticker;

/// Normalized trade updates.
pub mod trade;

/// Advisory market-hours evaluation.
pub mod market_hours;
