//! Client Protocol Messages
//!
//! JSON text frames exchanged with browser clients.
//!
//! ## Client → Server
//! - `{"type":"subscribe","ticker":"NVDA"}`
//! - `{"type":"unsubscribe","ticker":"NVDA"}`
//!
//! ## Server → Client
//! - `{"type":"status","ticker":"NVDA","message":"..."}`
//! - `{"type":"trade_update","ticker":"NVDA","price":113.98,"timestamp":"2023-11-14T22:13:20.000Z","volume":10}`
//! - `{"type":"error","message":"Invalid message format."}`

use serde::{Deserialize, Serialize};

use crate::domain::trade::TradeUpdate;

/// Error text sent for frames that do not parse as a client message.
pub const INVALID_MESSAGE_FORMAT: &str = "Invalid message format.";

/// Error text sent for subscribe requests with an unusable ticker.
pub const INVALID_TICKER: &str = "Invalid ticker symbol.";

/// Largest magnitude at which every integer is exactly representable in an `f64`.
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Request sent by a browser client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Make `ticker` the shared live ticker.
    Subscribe {
        /// Raw ticker as typed by the user.
        ticker: String,
    },
    /// Accepted but not acted on while the shared ticker may be in use.
    Unsubscribe {
        /// Raw ticker, if supplied.
        #[serde(default)]
        ticker: Option<String>,
    },
}

impl ClientMessage {
    /// Parse a client text frame.
    ///
    /// # Errors
    ///
    /// Returns the JSON error for malformed frames, unknown `type` values or
    /// missing fields.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Message sent to browser clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Human-readable progress or connection status.
    Status {
        /// Ticker the status refers to.
        ticker: String,
        /// Status text.
        message: String,
    },
    /// A trade for the active ticker.
    TradeUpdate {
        /// Ticker symbol.
        ticker: String,
        /// Trade price.
        price: f64,
        /// ISO-8601 UTC timestamp with milliseconds.
        timestamp: String,
        /// Traded volume; integral volumes serialize without a fraction.
        volume: serde_json::Number,
    },
    /// Request-scoped error.
    Error {
        /// Error text.
        message: String,
    },
}

impl ServerMessage {
    /// Build a status message.
    #[must_use]
    pub fn status(ticker: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Status {
            ticker: ticker.into(),
            message: message.into(),
        }
    }

    /// Build an error message.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Serialize to a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<&TradeUpdate> for ServerMessage {
    fn from(trade: &TradeUpdate) -> Self {
        Self::TradeUpdate {
            ticker: trade.ticker.to_string(),
            price: trade.price,
            timestamp: trade.timestamp_iso(),
            volume: volume_number(trade.volume),
        }
    }
}

fn volume_number(volume: f64) -> serde_json::Number {
    if volume.fract() == 0.0 && volume.abs() < MAX_EXACT_INTEGER {
        #[allow(clippy::cast_possible_truncation)]
        return serde_json::Number::from(volume as i64);
    }
    serde_json::Number::from_f64(volume).unwrap_or_else(|| serde_json::Number::from(0))
}
