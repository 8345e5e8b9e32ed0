//! Relay Service
//!
//! The single task that owns the hub and the upstream connection. Client and
//! upstream events are processed strictly one at a time, so no state in the
//! hub needs locking.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{ClientEvent, ClientId, ClientSender, UpstreamConnector, UpstreamEvent};
use crate::application::services::hub::ClientBroadcastHub;
use crate::application::services::reconnect::ReconnectConfig;
use crate::application::services::status::RelayStatus;
use crate::application::services::upstream::UpstreamFeedConnection;
use crate::domain::market_hours::{MarketHoursGate, MarketSession};

/// Relay task settings.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Upstream reconnect behavior.
    pub reconnect: ReconnectConfig,
    /// Trading session used for market-hours decisions.
    pub market_session: MarketSession,
    /// Capacity of the client and upstream event channels.
    pub event_capacity: usize,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            market_session: MarketSession::regular(),
            event_capacity: 1024,
        }
    }
}

/// Returned when the relay task is no longer accepting events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("relay task has stopped")]
pub struct RelayStopped;

/// Cloneable handle used by client connections to reach the relay task.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    events: mpsc::Sender<ClientEvent>,
}

impl RelayHandle {
    /// Register a client and its outbound queue.
    ///
    /// # Errors
    ///
    /// Returns [`RelayStopped`] if the relay task has exited.
    pub async fn client_connected(&self, id: ClientId, sender: ClientSender) -> Result<(), RelayStopped> {
        self.send(ClientEvent::Connected { id, sender }).await
    }

    /// Forward a text frame from a client.
    ///
    /// # Errors
    ///
    /// Returns [`RelayStopped`] if the relay task has exited.
    pub async fn client_message(&self, id: ClientId, text: String) -> Result<(), RelayStopped> {
        self.send(ClientEvent::Message { id, text }).await
    }

    /// Report a closed client socket.
    ///
    /// # Errors
    ///
    /// Returns [`RelayStopped`] if the relay task has exited.
    pub async fn client_disconnected(&self, id: ClientId) -> Result<(), RelayStopped> {
        self.send(ClientEvent::Disconnected { id }).await
    }

    async fn send(&self, event: ClientEvent) -> Result<(), RelayStopped> {
        self.events.send(event).await.map_err(|_| RelayStopped)
    }
}

/// Owns the hub and drives it from the event channels.
#[derive(Debug)]
pub struct RelayService {
    hub: ClientBroadcastHub,
    client_events: mpsc::Receiver<ClientEvent>,
    upstream_events: mpsc::Receiver<UpstreamEvent>,
    cancel: CancellationToken,
}

impl RelayService {
    /// Create the relay and the handle client connections use to reach it.
    #[must_use]
    pub fn new(
        options: RelayOptions,
        connector: Arc<dyn UpstreamConnector>,
        status: Arc<RelayStatus>,
        cancel: CancellationToken,
    ) -> (Self, RelayHandle) {
        let capacity = options.event_capacity.max(1);
        let (client_tx, client_events) = mpsc::channel(capacity);
        let (upstream_tx, upstream_events) = mpsc::channel(capacity);

        let market_hours = MarketHoursGate::new(options.market_session);
        let upstream = UpstreamFeedConnection::new(
            connector,
            upstream_tx,
            options.reconnect,
            market_hours,
            Arc::clone(&status),
        );
        let hub = ClientBroadcastHub::new(upstream, market_hours, status);

        let service = Self {
            hub,
            client_events,
            upstream_events,
            cancel,
        };
        (service, RelayHandle { events: client_tx })
    }

    /// Run until cancelled, then close the upstream and every client.
    ///
    /// Returns once the upstream close has completed. Callers bound the wait
    /// with their own shutdown timeout.
    pub async fn run(mut self) {
        tracing::info!("Relay started");
        self.hub.start();

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => break,

                Some(event) = self.upstream_events.recv() => {
                    self.hub.on_upstream_event(event);
                }

                Some(event) = self.client_events.recv() => {
                    self.hub.on_client_event(event);
                }

                else => break,
            }
        }

        self.hub.shutdown();
        self.client_events.close();

        while self.hub.is_closing() {
            match self.upstream_events.recv().await {
                Some(event) => self.hub.on_upstream_event(event),
                None => break,
            }
        }

        tracing::info!("Relay stopped");
    }
}
