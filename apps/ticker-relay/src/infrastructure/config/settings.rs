//! Relay Configuration Settings
//!
//! Configuration types for the relay, loaded from environment variables.
//! Unparseable numeric values fall back to their defaults.

use std::time::Duration;

use crate::domain::market_hours::MarketSession;

/// Default upstream endpoint.
pub const DEFAULT_FEED_URL: &str = "wss://ws.finnhub.io";

/// Environment variable holding the upstream API key.
pub const API_KEY_VAR: &str = "FINNHUB_API_KEY";

/// Finnhub API credential.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    api_key: String,
}

impl Credentials {
    /// Create credentials; blank keys are treated as absent.
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Option<Self> {
        let api_key = api_key.into().trim().to_string();
        (!api_key.is_empty()).then_some(Self { api_key })
    }

    /// Read the key from `FINNHUB_API_KEY`.
    #[must_use]
    pub fn from_env() -> Option<Self> {
        std::env::var(API_KEY_VAR).ok().and_then(Self::new)
    }

    /// Get the API key.
    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

/// Upstream feed settings.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    /// WebSocket endpoint without the token query.
    pub url: String,
    /// Credential; when absent it is re-read from the environment on each
    /// connection attempt.
    pub credentials: Option<Credentials>,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_FEED_URL.to_string(),
            credentials: None,
        }
    }
}

/// Reconnection settings.
#[derive(Debug, Clone)]
pub struct ReconnectSettings {
    /// Initial reconnection delay.
    pub delay_initial: Duration,
    /// Maximum reconnection delay.
    pub delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub delay_multiplier: f64,
    /// Upper bound of the additive jitter.
    pub jitter_max: Duration,
    /// Attempts before switching to the fallback interval (0 = never).
    pub max_attempts: u32,
    /// Fixed retry interval once attempts are exhausted.
    pub fallback_interval: Duration,
    /// Attempts after which off-hours stretching applies.
    pub off_hours_after_attempts: u32,
    /// Factor applied to the maximum delay outside market hours.
    pub off_hours_multiplier: f64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            delay_initial: Duration::from_millis(1000),
            delay_max: Duration::from_secs(30),
            delay_multiplier: 1.5,
            jitter_max: Duration::from_millis(1000),
            max_attempts: 10,
            fallback_interval: Duration::from_secs(300),
            off_hours_after_attempts: 3,
            off_hours_multiplier: 6.0,
        }
    }
}

/// Listener settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Bind host for both listeners.
    pub host: String,
    /// Client WebSocket port.
    pub port: u16,
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            health_port: 8082,
        }
    }
}

impl ServerSettings {
    /// Client WebSocket bind address.
    #[must_use]
    pub fn client_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Health server bind address.
    #[must_use]
    pub fn health_addr(&self) -> String {
        format!("{}:{}", self.host, self.health_port)
    }
}

/// Relay task settings.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Trading session for market-hours decisions.
    pub market_session: MarketSession,
    /// Outbound frames queued per client before drops.
    pub client_queue_capacity: usize,
    /// Relay event channel capacity.
    pub event_capacity: usize,
    /// Hard limit on graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            market_session: MarketSession::regular(),
            client_queue_capacity: 256,
            event_capacity: 1024,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Complete relay configuration.
#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
    /// Upstream feed settings.
    pub feed: FeedSettings,
    /// Listener settings.
    pub server: ServerSettings,
    /// Reconnection settings.
    pub reconnect: ReconnectSettings,
    /// Relay task settings.
    pub relay: RelaySettings,
}

impl RelayConfig {
    /// Create configuration from environment variables.
    ///
    /// A missing `FINNHUB_API_KEY` is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if `FINNHUB_WS_URL` or `RELAY_HOST` is unusable, or
    /// if the reconnect backoff would shrink or start above its cap.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if `FINNHUB_WS_URL` or `RELAY_HOST` is unusable, or
    /// if the reconnect backoff would shrink or start above its cap.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let url = env
            .string("FINNHUB_WS_URL")
            .unwrap_or_else(|| DEFAULT_FEED_URL.to_string());
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue {
                key: "FINNHUB_WS_URL",
                value: url,
            });
        }
        let feed = FeedSettings {
            url: url.trim_end_matches('/').to_string(),
            credentials: env.string(API_KEY_VAR).and_then(Credentials::new),
        };

        let server_defaults = ServerSettings::default();
        let host = env.string("RELAY_HOST").unwrap_or(server_defaults.host);
        if host.chars().any(char::is_whitespace) {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_HOST",
                value: host,
            });
        }
        let server = ServerSettings {
            host,
            port: env.parse("RELAY_PORT", server_defaults.port),
            health_port: env.parse("RELAY_HEALTH_PORT", server_defaults.health_port),
        };

        let reconnect_defaults = ReconnectSettings::default();
        let reconnect = ReconnectSettings {
            delay_initial: env.millis(
                "RELAY_RECONNECT_DELAY_INITIAL_MS",
                reconnect_defaults.delay_initial,
            ),
            delay_max: env.secs(
                "RELAY_RECONNECT_DELAY_MAX_SECS",
                reconnect_defaults.delay_max,
            ),
            delay_multiplier: env.parse(
                "RELAY_RECONNECT_DELAY_MULTIPLIER",
                reconnect_defaults.delay_multiplier,
            ),
            jitter_max: env.millis(
                "RELAY_RECONNECT_JITTER_MAX_MS",
                reconnect_defaults.jitter_max,
            ),
            max_attempts: env.parse(
                "RELAY_MAX_RECONNECT_ATTEMPTS",
                reconnect_defaults.max_attempts,
            ),
            fallback_interval: env.secs(
                "RELAY_RECONNECT_FALLBACK_SECS",
                reconnect_defaults.fallback_interval,
            ),
            off_hours_after_attempts: env.parse(
                "RELAY_OFF_HOURS_AFTER_ATTEMPTS",
                reconnect_defaults.off_hours_after_attempts,
            ),
            off_hours_multiplier: env.parse(
                "RELAY_OFF_HOURS_MULTIPLIER",
                reconnect_defaults.off_hours_multiplier,
            ),
        };
        if !(reconnect.delay_multiplier.is_finite() && reconnect.delay_multiplier >= 1.0) {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_RECONNECT_DELAY_MULTIPLIER",
                value: reconnect.delay_multiplier.to_string(),
            });
        }
        if reconnect.delay_initial > reconnect.delay_max {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_RECONNECT_DELAY_INITIAL_MS",
                value: reconnect.delay_initial.as_millis().to_string(),
            });
        }

        let relay_defaults = RelaySettings::default();
        let relay = RelaySettings {
            market_session: env
                .string("RELAY_MARKET_SESSION")
                .map_or(relay_defaults.market_session, |s| {
                    MarketSession::from_str_case_insensitive(&s)
                }),
            client_queue_capacity: env
                .parse(
                    "RELAY_CLIENT_QUEUE_CAPACITY",
                    relay_defaults.client_queue_capacity,
                )
                .max(1),
            event_capacity: env
                .parse("RELAY_EVENT_CAPACITY", relay_defaults.event_capacity)
                .max(1),
            shutdown_timeout: env.secs(
                "RELAY_SHUTDOWN_TIMEOUT_SECS",
                relay_defaults.shutdown_timeout,
            ),
        };

        Ok(Self {
            feed,
            server,
            reconnect,
            relay,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has an unusable value.
    #[error("environment variable {key} has invalid value {value:?}")]
    InvalidValue {
        /// Variable name.
        key: &'static str,
        /// Offending value.
        value: String,
    },
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.string(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        self.string(key)
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        self.string(key)
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }
}
