//! Downstream WebSocket Adapter
//!
//! Browser-facing server and its JSON protocol.

pub mod messages;
pub mod server;

pub use messages::{ClientMessage, INVALID_MESSAGE_FORMAT, INVALID_TICKER, ServerMessage};
pub use server::{ClientServer, ClientServerError};
