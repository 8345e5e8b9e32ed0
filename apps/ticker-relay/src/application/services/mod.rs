//! Application Services
//!
//! The relay core. Everything here runs on the single relay task.
//!
//! - `RelayService`: event loop that serializes client and upstream events
//! - `ClientBroadcastHub`: client registry, active ticker and fan-out
//! - `UpstreamFeedConnection`: upstream lifecycle and subscription state
//! - `reconnect`: backoff policy and the single-timer scheduler
//! - `RelayStatus`: shared snapshot read by the health server

pub mod hub;
pub mod reconnect;
pub mod relay;
pub mod status;
pub mod upstream;

pub use hub::ClientBroadcastHub;
pub use reconnect::{ReconnectConfig, ReconnectDelay, ReconnectPolicy, ReconnectScheduler};
pub use relay::{RelayHandle, RelayOptions, RelayService, RelayStopped};
pub use status::{RelaySnapshot, RelayStatus, UpstreamState};
pub use upstream::UpstreamFeedConnection;
