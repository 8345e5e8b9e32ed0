//! Trade Updates
//!
//! The normalized, codec-agnostic trade event relayed to clients. One is
//! produced per matching upstream trade record and dropped after broadcast.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::domain::ticker::TickerSymbol;

/// A single normalized trade for the active ticker.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeUpdate {
    /// Ticker the trade belongs to.
    pub ticker: TickerSymbol,
    /// Last trade price.
    pub price: f64,
    /// Trade execution time.
    pub timestamp: DateTime<Utc>,
    /// Traded volume.
    pub volume: f64,
}

impl TradeUpdate {
    /// Build a trade update from raw upstream fields.
    ///
    /// Returns `None` when the price or volume is not finite, or the epoch
    /// milliseconds are outside chrono's representable range.
    #[must_use]
    pub fn from_epoch_millis(
        ticker: TickerSymbol,
        price: f64,
        epoch_ms: i64,
        volume: f64,
    ) -> Option<Self> {
        if !price.is_finite() || !volume.is_finite() {
            return None;
        }
        let timestamp = DateTime::<Utc>::from_timestamp_millis(epoch_ms)?;
        Some(Self {
            ticker,
            price,
            timestamp,
            volume,
        })
    }

    /// ISO-8601 timestamp with millisecond precision and a `Z` suffix.
    #[must_use]
    pub fn timestamp_iso(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}
