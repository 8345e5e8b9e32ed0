//! Configuration Module
//!
//! Configuration loading for the relay service.

mod settings;

pub use settings::{
    API_KEY_VAR, ConfigError, Credentials, DEFAULT_FEED_URL, FeedSettings, ReconnectSettings,
    RelayConfig, RelaySettings, ServerSettings,
};
