//! Finnhub WebSocket Message Types
//!
//! Wire format types for the Finnhub real-time trade stream.
//!
//! # Message Types
//!
//! ## Outbound (relay → Finnhub)
//! - `{"type":"subscribe","symbol":"AAPL"}`
//! - `{"type":"unsubscribe","symbol":"AAPL"}`
//! - `{"type":"pong"}`
//!
//! ## Inbound (Finnhub → relay)
//! - `{"type":"trade","data":[{"s":"AAPL","p":189.5,"t":1700000000000,"v":100}]}`
//! - `{"type":"ping"}`
//! - `{"type":"error","msg":"Invalid API key"}`
//!
//! # References
//!
//! - [Finnhub WebSocket Trades](https://finnhub.io/docs/api/websocket-trades)

use serde::{Deserialize, Serialize};

use crate::application::ports::UpstreamCommand;
use crate::domain::ticker::TickerSymbol;
use crate::domain::trade::TradeUpdate;

// =============================================================================
// Outbound
// =============================================================================

/// Control request sent to Finnhub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FeedRequest<'a> {
    /// Subscribe to trades for a symbol.
    Subscribe {
        /// Upstream symbol.
        symbol: &'a str,
    },
    /// Unsubscribe from trades for a symbol.
    Unsubscribe {
        /// Upstream symbol.
        symbol: &'a str,
    },
    /// Reply to a ping.
    Pong,
}

impl<'a> FeedRequest<'a> {
    /// Map a relay command onto its wire request.
    ///
    /// Returns `None` for `Close`, which is a WebSocket control frame rather
    /// than a JSON message.
    #[must_use]
    pub fn from_command(command: &'a UpstreamCommand) -> Option<Self> {
        match command {
            UpstreamCommand::Subscribe(ticker) => Some(Self::Subscribe {
                symbol: ticker.as_str(),
            }),
            UpstreamCommand::Unsubscribe(ticker) => Some(Self::Unsubscribe {
                symbol: ticker.as_str(),
            }),
            UpstreamCommand::Pong => Some(Self::Pong),
            UpstreamCommand::Close => None,
        }
    }
}

// =============================================================================
// Inbound
// =============================================================================

/// One trade record inside a `trade` message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TradeRecord {
    /// Symbol.
    #[serde(rename = "s")]
    pub symbol: String,

    /// Last price.
    #[serde(rename = "p")]
    pub price: f64,

    /// Epoch milliseconds.
    #[serde(rename = "t")]
    pub timestamp_ms: i64,

    /// Volume.
    #[serde(rename = "v", default)]
    pub volume: f64,
}

impl TradeRecord {
    /// Normalize into a [`TradeUpdate`] if this record is for `ticker`.
    #[must_use]
    pub fn normalize_for(&self, ticker: &TickerSymbol) -> Option<TradeUpdate> {
        if !ticker.matches(&self.symbol) {
            return None;
        }
        TradeUpdate::from_epoch_millis(ticker.clone(), self.price, self.timestamp_ms, self.volume)
    }
}

/// Decoded inbound Finnhub message.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    /// Batch of trades.
    Trades {
        /// Well-formed records in arrival order.
        records: Vec<TradeRecord>,
        /// Number of records that failed to decode.
        malformed: usize,
    },
    /// Keep-alive that must be answered with a pong.
    Ping,
    /// Error reported by Finnhub.
    Error {
        /// Error text.
        msg: String,
    },
    /// Any other message type, ignored by the relay.
    Other {
        /// The `type` field.
        kind: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticker(s: &str) -> TickerSymbol {
        TickerSymbol::parse(s).unwrap()
    }

    #[test]
    fn requests_serialize_to_wire_format() {
        let sub = UpstreamCommand::Subscribe(ticker("NVDA"));
        let unsub = UpstreamCommand::Unsubscribe(ticker("AAPL"));

        assert_eq!(
            serde_json::to_string(&FeedRequest::from_command(&sub).unwrap()).unwrap(),
            r#"{"type":"subscribe","symbol":"NVDA"}"#
        );
        assert_eq!(
            serde_json::to_string(&FeedRequest::from_command(&unsub).unwrap()).unwrap(),
            r#"{"type":"unsubscribe","symbol":"AAPL"}"#
        );
        assert_eq!(
            serde_json::to_string(&FeedRequest::Pong).unwrap(),
            r#"{"type":"pong"}"#
        );
        assert!(FeedRequest::from_command(&UpstreamCommand::Close).is_none());
    }

    #[test]
    fn trade_record_normalizes_matching_symbol() {
        let record = TradeRecord {
            symbol: "NVDA".to_string(),
            price: 113.98,
            timestamp_ms: 1_700_000_000_000,
            volume: 10.0,
        };

        let update = record.normalize_for(&ticker("NVDA")).unwrap();
        assert_eq!(update.ticker.as_str(), "NVDA");
        assert!((update.price - 113.98).abs() < f64::EPSILON);
        assert_eq!(update.timestamp_iso(), "2023-11-14T22:13:20.000Z");

        assert!(record.normalize_for(&ticker("AAPL")).is_none());
    }
}
