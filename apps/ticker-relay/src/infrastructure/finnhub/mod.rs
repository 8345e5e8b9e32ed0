//! Finnhub Trade Feed Adapter
//!
//! WebSocket client and JSON codec for Finnhub's real-time trade stream.
//!
//! - `client`: connection task implementing `UpstreamConnector`
//! - `codec`: frame decoding with per-record error isolation
//! - `messages`: wire types

pub mod client;
pub mod codec;
pub mod messages;

pub use client::{FeedClientError, FinnhubConnector};
pub use codec::{CodecError, FeedCodec};
pub use messages::{FeedMessage, FeedRequest, TradeRecord};
