//! Port Interfaces
//!
//! Defines the contracts between the relay core and the socket adapters,
//! following the Hexagonal Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - `UpstreamConnector`: opens the single connection to the trade feed
//! - `UpstreamLink`: command channel into an open upstream connection
//! - `ClientSender`: outbound frame queue of one downstream client
//!
//! ## Driver Ports (Inbound)
//!
//! - `UpstreamEvent`: lifecycle and message events raised by the upstream adapter
//! - `ClientEvent`: connect/message/disconnect events raised by the client server

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::ticker::TickerSymbol;

// =============================================================================
// Upstream
// =============================================================================

/// Control commands the relay issues to the upstream feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamCommand {
    /// Start receiving trades for a ticker.
    Subscribe(TickerSymbol),
    /// Stop receiving trades for a ticker.
    Unsubscribe(TickerSymbol),
    /// Reply to an application-level ping.
    Pong,
    /// Close the connection with a normal close code.
    Close,
}

/// Events raised by an upstream connection task.
///
/// Connection events carry the generation of the connection that produced
/// them so the relay can discard events from superseded connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    /// The WebSocket handshake completed.
    Opened {
        /// Connection generation.
        generation: u64,
    },
    /// A text frame arrived.
    Message {
        /// Connection generation.
        generation: u64,
        /// Raw frame payload.
        text: String,
    },
    /// The connection failed or closed.
    Closed {
        /// Connection generation.
        generation: u64,
        /// Human-readable close reason.
        reason: String,
    },
    /// A scheduled reconnect timer fired.
    ReconnectDue {
        /// Scheduler token identifying the timer.
        token: u64,
    },
}

/// Errors raised synchronously when a connection cannot be started.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// No API credential is configured.
    #[error("missing upstream credential: {0} is not set")]
    MissingCredential(&'static str),
    /// The configured endpoint is unusable.
    #[error("invalid upstream endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Error returned when a command cannot be queued on an upstream link.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkSendError {
    /// The connection task has exited.
    #[error("upstream connection task has exited")]
    Closed,
    /// The outbound command queue is full.
    #[error("upstream command queue is full")]
    Full,
}

/// Handle to one upstream connection attempt.
///
/// Dropping the link cancels the connection task.
#[derive(Debug)]
pub struct UpstreamLink {
    generation: u64,
    commands: mpsc::Sender<UpstreamCommand>,
    cancel: CancellationToken,
}

impl UpstreamLink {
    /// Create a link from its command channel and cancellation token.
    #[must_use]
    pub const fn new(
        generation: u64,
        commands: mpsc::Sender<UpstreamCommand>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            generation,
            commands,
            cancel,
        }
    }

    /// Generation of the connection behind this link.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue a command without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`LinkSendError`] if the task has exited or its queue is full.
    pub fn send(&self, command: UpstreamCommand) -> Result<(), LinkSendError> {
        self.commands.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => LinkSendError::Full,
            mpsc::error::TrySendError::Closed(_) => LinkSendError::Closed,
        })
    }
}

impl Drop for UpstreamLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Opens connections to the upstream trade feed.
///
/// Implementations spawn a task that reports `Opened`, `Message` and finally
/// exactly one `Closed` event for the given generation.
pub trait UpstreamConnector: Send + Sync {
    /// Start a connection attempt.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError`] if the attempt cannot even be started, for
    /// example when no credential is available.
    fn connect(
        &self,
        generation: u64,
        events: mpsc::Sender<UpstreamEvent>,
    ) -> Result<UpstreamLink, ConnectError>;
}

// =============================================================================
// Downstream clients
// =============================================================================

/// Identifier of one downstream client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(uuid::Uuid);

impl ClientId {
    /// Generate a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Frames queued for a downstream client writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// Pre-serialized JSON text frame, shared across clients.
    Text(Arc<str>),
    /// Close the socket with a normal close code.
    Close,
}

/// Outbound frame queue of one client.
pub type ClientSender = mpsc::Sender<ClientFrame>;

/// Events raised by the downstream client server.
#[derive(Debug)]
pub enum ClientEvent {
    /// A client socket was accepted.
    Connected {
        /// Client identifier.
        id: ClientId,
        /// Outbound frame queue.
        sender: ClientSender,
    },
    /// A text frame arrived from a client.
    Message {
        /// Client identifier.
        id: ClientId,
        /// Raw frame payload.
        text: String,
    },
    /// A client socket closed.
    Disconnected {
        /// Client identifier.
        id: ClientId,
    },
}
