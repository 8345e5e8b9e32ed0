//! Market Hours Gate
//!
//! Pure helpers deciding whether an instant falls inside a US equity trading
//! session, evaluated in exchange-local (US Eastern) time.
//!
//! The result is advisory only. It stretches reconnect backoff and adds
//! context to client status messages; it never blocks a subscription or a
//! reconnect attempt. Exchange holidays are not modelled.

use chrono::{DateTime, Datelike, NaiveDate, TimeDelta, Timelike, Utc, Weekday};

const EST_OFFSET_HOURS: i64 = 5;
const EDT_OFFSET_HOURS: i64 = 4;

/// Trading session bounds in exchange-local minutes after midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarketSession {
    open_minute: u32,
    close_minute: u32,
}

impl MarketSession {
    /// Regular session, 09:30 to 16:00 Eastern.
    #[must_use]
    pub const fn regular() -> Self {
        Self {
            open_minute: 9 * 60 + 30,
            close_minute: 16 * 60,
        }
    }

    /// Extended session including pre-market and after-hours, 04:00 to 20:00 Eastern.
    #[must_use]
    pub const fn extended() -> Self {
        Self {
            open_minute: 4 * 60,
            close_minute: 20 * 60,
        }
    }

    /// Parse a session name, falling back to the regular session.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "extended" => Self::extended(),
            _ => Self::regular(),
        }
    }

    /// Session name for logs and health output.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        if self.open_minute == Self::extended().open_minute
            && self.close_minute == Self::extended().close_minute
        {
            "extended"
        } else {
            "regular"
        }
    }
}

impl Default for MarketSession {
    fn default() -> Self {
        Self::regular()
    }
}

/// Advisory market-hours check for one trading session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarketHoursGate {
    session: MarketSession,
}

impl MarketHoursGate {
    /// Create a gate for the given session.
    #[must_use]
    pub const fn new(session: MarketSession) -> Self {
        Self { session }
    }

    /// The session this gate evaluates.
    #[must_use]
    pub const fn session(&self) -> MarketSession {
        self.session
    }

    /// Whether the market is open right now.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.is_open_at(Utc::now())
    }

    /// Whether the market is open at the given instant.
    #[must_use]
    pub fn is_open_at(&self, at: DateTime<Utc>) -> bool {
        let local = at.naive_utc() - TimeDelta::hours(eastern_offset_hours(at));
        if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }
        let minute = local.hour() * 60 + local.minute();
        minute >= self.session.open_minute && minute < self.session.close_minute
    }
}

/// Hours Eastern time is behind UTC at the given instant.
///
/// US daylight saving starts the second Sunday of March at 02:00 EST (07:00
/// UTC) and ends the first Sunday of November at 02:00 EDT (06:00 UTC).
fn eastern_offset_hours(at: DateTime<Utc>) -> i64 {
    let year = at.year();
    let dst_start = NaiveDate::from_weekday_of_month_opt(year, 3, Weekday::Sun, 2)
        .and_then(|d| d.and_hms_opt(7, 0, 0))
        .map(|dt| dt.and_utc());
    let dst_end = NaiveDate::from_weekday_of_month_opt(year, 11, Weekday::Sun, 1)
        .and_then(|d| d.and_hms_opt(6, 0, 0))
        .map(|dt| dt.and_utc());

    match (dst_start, dst_end) {
        (Some(start), Some(end)) if at >= start && at < end => EDT_OFFSET_HOURS,
        _ => EST_OFFSET_HOURS,
    }
}
