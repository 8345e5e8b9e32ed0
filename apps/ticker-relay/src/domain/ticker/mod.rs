//! Ticker Symbols
//!
//! A `TickerSymbol` is the normalized (trimmed, uppercase) identifier of one
//! tradable instrument. It is never empty once accepted.

use std::fmt;

/// Maximum accepted ticker length.
///
/// Finnhub symbols include exchange prefixes such as `BINANCE:BTCUSDT`,
/// so the bound is generous.
pub const MAX_TICKER_LEN: usize = 32;

/// Errors raised when a raw ticker string is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TickerError {
    /// The ticker was empty after trimming.
    #[error("ticker symbol is empty")]
    Empty,
    /// The ticker exceeded [`MAX_TICKER_LEN`].
    #[error("ticker symbol exceeds {MAX_TICKER_LEN} characters")]
    TooLong,
    /// The ticker contained whitespace or control characters.
    #[error("ticker symbol contains invalid character {0:?}")]
    InvalidCharacter(char),
}

/// Normalized ticker symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TickerSymbol(String);

impl TickerSymbol {
    /// Normalize and validate a raw ticker string.
    ///
    /// # Errors
    ///
    /// Returns a [`TickerError`] if the trimmed input is empty, too long, or
    /// contains whitespace or control characters.
    pub fn parse(raw: &str) -> Result<Self, TickerError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(TickerError::Empty);
        }
        if trimmed.chars().count() > MAX_TICKER_LEN {
            return Err(TickerError::TooLong);
        }
        if let Some(bad) = trimmed
            .chars()
            .find(|c| c.is_whitespace() || c.is_control())
        {
            return Err(TickerError::InvalidCharacter(bad));
        }
        Ok(Self(trimmed.to_uppercase()))
    }

    /// Borrow the symbol as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether an upstream symbol refers to this ticker.
    #[must_use]
    pub fn matches(&self, symbol: &str) -> bool {
        self.0 == symbol
    }
}

impl fmt::Display for TickerSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TickerSymbol {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for TickerSymbol {
    type Error = TickerError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("nvda", "NVDA" ; "lowercase")]
    #[test_case("  aapl ", "AAPL" ; "padded")]
    #[test_case("BINANCE:btcusdt", "BINANCE:BTCUSDT" ; "exchange prefix")]
    #[test_case("brk.b", "BRK.B" ; "share class")]
    fn parse_normalizes(raw: &str, expected: &str) {
        assert_eq!(TickerSymbol::parse(raw).unwrap().as_str(), expected);
    }

    #[test_case("" ; "empty")]
    #[test_case("   " ; "blank")]
    fn parse_rejects_empty(raw: &str) {
        assert_eq!(TickerSymbol::parse(raw), Err(TickerError::Empty));
    }

    #[test]
    fn parse_rejects_inner_whitespace() {
        assert_eq!(
            TickerSymbol::parse("BRK B"),
            Err(TickerError::InvalidCharacter(' '))
        );
    }

    #[test]
    fn parse_rejects_long_symbols() {
        let raw = "X".repeat(MAX_TICKER_LEN + 1);
        assert_eq!(TickerSymbol::parse(&raw), Err(TickerError::TooLong));
    }

    #[test]
    fn matches_is_exact() {
        let ticker = TickerSymbol::parse("nvda").unwrap();
        assert!(ticker.matches("NVDA"));
        assert!(!ticker.matches("nvda"));
        assert!(!ticker.matches("NVDAX"));
    }
}
