//! Reconnection Policy and Scheduler
//!
//! Implements bounded exponential backoff with additive jitter for the
//! upstream WebSocket, plus the single-timer scheduler that delivers
//! reconnect deadlines back to the relay task.
//!
//! Three regimes apply:
//!
//! - **Backoff**: `min(initial * multiplier^attempts, max) + jitter`
//! - **Off-hours**: once past a few attempts while the market is closed, the
//!   delay is stretched to a multiple of the normal maximum
//! - **Fallback**: after the attempt budget is spent, a long fixed interval
//!   is used until a successful open or a forced retry resets the policy

use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::application::ports::UpstreamEvent;
use crate::infrastructure::config::ReconnectSettings;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Cap on the backoff delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub multiplier: f64,
    /// Upper bound of the uniformly distributed jitter added to each delay.
    pub max_jitter: Duration,
    /// Attempts before switching to the fallback interval (0 = never).
    pub max_attempts: u32,
    /// Fixed retry interval once the attempt budget is exhausted.
    pub fallback_interval: Duration,
    /// Attempts after which off-hours stretching applies.
    pub off_hours_after_attempts: u32,
    /// Factor applied to `max_delay` outside market hours.
    pub off_hours_multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 1.5,
            max_jitter: Duration::from_secs(1),
            max_attempts: 10,
            fallback_interval: Duration::from_secs(300),
            off_hours_after_attempts: 3,
            off_hours_multiplier: 6.0,
        }
    }
}

impl ReconnectConfig {
    /// Create configuration from `ReconnectSettings`.
    #[must_use]
    pub const fn from_settings(settings: &ReconnectSettings) -> Self {
        Self {
            initial_delay: settings.delay_initial,
            max_delay: settings.delay_max,
            multiplier: settings.delay_multiplier,
            max_jitter: settings.jitter_max,
            max_attempts: settings.max_attempts,
            fallback_interval: settings.fallback_interval,
            off_hours_after_attempts: settings.off_hours_after_attempts,
            off_hours_multiplier: settings.off_hours_multiplier,
        }
    }
}

/// The delay chosen for the next reconnection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDelay {
    /// Regular exponential backoff.
    Backoff {
        /// Delay including jitter.
        delay: Duration,
        /// Attempt number this delay precedes.
        attempt: u32,
    },
    /// Backoff stretched because the market is closed.
    OffHours {
        /// Delay including jitter.
        delay: Duration,
        /// Attempt number this delay precedes.
        attempt: u32,
    },
    /// Long fixed interval after the attempt budget is spent.
    Fallback {
        /// Delay including jitter.
        delay: Duration,
    },
}

impl ReconnectDelay {
    /// The wait before reconnecting.
    #[must_use]
    pub const fn duration(&self) -> Duration {
        match self {
            Self::Backoff { delay, .. } | Self::OffHours { delay, .. } | Self::Fallback { delay } => {
                *delay
            }
        }
    }

    /// Whether the fallback interval is in effect.
    #[must_use]
    pub const fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback { .. })
    }

    /// Label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Backoff { .. } => "backoff",
            Self::OffHours { .. } => "off_hours",
            Self::Fallback { .. } => "fallback",
        }
    }
}

/// Reconnection policy implementing exponential backoff with jitter.
///
/// # Example
///
/// ```rust
/// use ticker_relay::application::services::reconnect::{ReconnectConfig, ReconnectPolicy};
/// use std::time::Duration;
///
/// let config = ReconnectConfig {
///     max_jitter: Duration::ZERO,
///     ..ReconnectConfig::default()
/// };
/// let mut policy = ReconnectPolicy::new(config);
///
/// assert_eq!(policy.next_delay(true).duration(), Duration::from_secs(1));
/// assert_eq!(policy.next_delay(true).duration(), Duration::from_millis(1500));
///
/// // Successful open
/// policy.reset();
/// assert_eq!(policy.attempt_count(), 0);
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    current_delay: Duration,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        let initial_delay = config.initial_delay;
        Self {
            config,
            current_delay: initial_delay,
            attempt_count: 0,
        }
    }

    /// Compute the delay before the next attempt and advance the backoff.
    pub fn next_delay(&mut self, market_open: bool) -> ReconnectDelay {
        if self.exhausted() {
            self.attempt_count = self.attempt_count.saturating_add(1);
            return self.fallback_delay();
        }

        self.attempt_count += 1;
        // Delays never shrink and never pass the cap, whatever the settings.
        let base = self.current_delay.min(self.config.max_delay);
        self.current_delay = scale(base, self.config.multiplier.max(1.0)).min(self.config.max_delay);

        if !market_open && self.attempt_count > self.config.off_hours_after_attempts {
            let stretched = scale(self.config.max_delay, self.config.off_hours_multiplier).max(base);
            return ReconnectDelay::OffHours {
                delay: self.apply_jitter(stretched),
                attempt: self.attempt_count,
            };
        }

        ReconnectDelay::Backoff {
            delay: self.apply_jitter(base),
            attempt: self.attempt_count,
        }
    }

    /// The long fixed retry interval, used when the budget is spent or an
    /// attempt cannot even be started.
    #[must_use]
    pub fn fallback_delay(&self) -> ReconnectDelay {
        ReconnectDelay::Fallback {
            delay: self.apply_jitter(self.config.fallback_interval),
        }
    }

    /// Reset the policy after a successful connection or a forced retry.
    pub const fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.attempt_count = 0;
    }

    /// Number of attempts since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Base delay the next regular backoff will use, before jitter.
    #[must_use]
    pub const fn current_delay(&self) -> Duration {
        self.current_delay
    }

    /// Whether the attempt budget is spent.
    #[must_use]
    pub const fn exhausted(&self) -> bool {
        self.config.max_attempts > 0 && self.attempt_count >= self.config.max_attempts
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.max_jitter.is_zero() {
            return duration;
        }
        let max_millis = u64::try_from(self.config.max_jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = rand::rng().random_range(0..=max_millis);
        duration.saturating_add(Duration::from_millis(jitter))
    }
}

fn scale(duration: Duration, factor: f64) -> Duration {
    #[allow(clippy::cast_precision_loss)]
    let scaled = (duration.as_millis() as f64 * factor).round();
    if !scaled.is_finite() || scaled <= 0.0 {
        return Duration::ZERO;
    }
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    let millis = scaled.min(u64::MAX as f64) as u64;
    Duration::from_millis(millis)
}

// =============================================================================
// Scheduler
// =============================================================================

#[derive(Debug)]
struct PendingReconnect {
    token: u64,
    handle: JoinHandle<()>,
}

/// Owns the single pending reconnect timer.
///
/// Scheduling always cancels the previous timer first, so at most one
/// `ReconnectDue` event can be in flight per token.
#[derive(Debug)]
pub struct ReconnectScheduler {
    events: mpsc::Sender<UpstreamEvent>,
    pending: Option<PendingReconnect>,
    next_token: u64,
}

impl ReconnectScheduler {
    /// Create a scheduler that delivers deadlines on `events`.
    #[must_use]
    pub const fn new(events: mpsc::Sender<UpstreamEvent>) -> Self {
        Self {
            events,
            pending: None,
            next_token: 0,
        }
    }

    /// Schedule a reconnect after `delay`, replacing any pending timer.
    ///
    /// Returns the token the `ReconnectDue` event will carry.
    pub fn schedule(&mut self, delay: Duration) -> u64 {
        self.cancel();
        self.next_token += 1;
        let token = self.next_token;
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(UpstreamEvent::ReconnectDue { token }).await;
        });
        self.pending = Some(PendingReconnect { token, handle });
        token
    }

    /// Cancel the pending timer, if any. Returns whether one was pending.
    pub fn cancel(&mut self) -> bool {
        self.pending.take().is_some_and(|pending| {
            pending.handle.abort();
            true
        })
    }

    /// Consume the pending timer if `token` identifies it.
    ///
    /// Returns `false` for stale tokens from cancelled timers.
    pub fn take_if_current(&mut self, token: u64) -> bool {
        if self.pending.as_ref().is_some_and(|p| p.token == token) {
            self.pending = None;
            true
        } else {
            false
        }
    }

    /// Whether a timer is pending.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}

impl Drop for ReconnectScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}
