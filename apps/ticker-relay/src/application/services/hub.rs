//! Client Broadcast Hub
//!
//! Tracks downstream clients, owns the single shared active ticker and fans
//! trade updates out to every client.
//!
//! All handlers are synchronous: outbound frames are queued with `try_send`
//! so one slow client can never stall the relay task. A full or closed queue
//! is logged and skipped.

use std::collections::HashMap;
use std::sync::Arc;

use crate::application::ports::{ClientEvent, ClientFrame, ClientId, ClientSender, UpstreamEvent};
use crate::application::services::status::RelayStatus;
use crate::application::services::upstream::UpstreamFeedConnection;
use crate::domain::market_hours::MarketHoursGate;
use crate::domain::ticker::TickerSymbol;
use crate::domain::trade::TradeUpdate;
use crate::infrastructure::metrics::{self, Direction, SendFailure};
use crate::infrastructure::websocket::{
    ClientMessage, INVALID_MESSAGE_FORMAT, INVALID_TICKER, ServerMessage,
};

/// Fan-out hub for downstream clients.
#[derive(Debug)]
pub struct ClientBroadcastHub {
    clients: HashMap<ClientId, ClientSender>,
    active: Option<TickerSymbol>,
    upstream: UpstreamFeedConnection,
    market_hours: MarketHoursGate,
    status: Arc<RelayStatus>,
    announce_reopen: bool,
}

impl ClientBroadcastHub {
    /// Create a hub driving `upstream`.
    #[must_use]
    pub fn new(
        upstream: UpstreamFeedConnection,
        market_hours: MarketHoursGate,
        status: Arc<RelayStatus>,
    ) -> Self {
        Self {
            clients: HashMap::new(),
            active: None,
            upstream,
            market_hours,
            status,
            announce_reopen: false,
        }
    }

    /// Open the upstream connection ahead of the first subscription.
    pub fn start(&mut self) {
        self.upstream.connect();
    }

    /// The ticker currently relayed to all clients.
    #[must_use]
    pub const fn active_ticker(&self) -> Option<&TickerSymbol> {
        self.active.as_ref()
    }

    /// Number of connected clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// The upstream connection.
    #[must_use]
    pub const fn upstream(&self) -> &UpstreamFeedConnection {
        &self.upstream
    }

    /// Dispatch a client event.
    pub fn on_client_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Connected { id, sender } => self.on_client_connect(id, sender),
            ClientEvent::Message { id, text } => self.on_client_message(id, &text),
            ClientEvent::Disconnected { id } => self.on_client_disconnect(id),
        }
    }

    /// Register a client. No subscription is implied.
    pub fn on_client_connect(&mut self, id: ClientId, sender: ClientSender) {
        self.clients.insert(id, sender);
        tracing::info!(client_id = %id, clients = self.clients.len(), "Client connected");
        self.publish_clients();
    }

    /// Handle one text frame from a client.
    pub fn on_client_message(&mut self, id: ClientId, text: &str) {
        if !self.clients.contains_key(&id) {
            tracing::debug!(client_id = %id, "Message from unknown client");
            return;
        }

        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(client_id = %id, error = %e, "Malformed client message");
                metrics::record_malformed(Direction::Client, 1);
                self.send_to(id, &ServerMessage::error(INVALID_MESSAGE_FORMAT));
                return;
            }
        };

        match message {
            ClientMessage::Subscribe { ticker } => match TickerSymbol::parse(&ticker) {
                Ok(ticker) => self.subscribe(id, ticker),
                Err(e) => {
                    tracing::warn!(client_id = %id, error = %e, "Rejected ticker");
                    self.send_to(id, &ServerMessage::error(INVALID_TICKER));
                }
            },
            ClientMessage::Unsubscribe { ticker } => {
                // Other clients may still want the shared ticker.
                tracing::debug!(
                    client_id = %id,
                    ticker = ticker.as_deref().unwrap_or_default(),
                    "Ignoring client unsubscribe"
                );
            }
        }
    }

    /// Remove a client; the last one leaving releases the upstream ticker.
    pub fn on_client_disconnect(&mut self, id: ClientId) {
        if self.clients.remove(&id).is_none() {
            return;
        }
        tracing::info!(client_id = %id, clients = self.clients.len(), "Client disconnected");
        self.publish_clients();

        if self.clients.is_empty()
            && let Some(ticker) = self.active.take()
        {
            tracing::info!(ticker = %ticker, "Last client left, releasing ticker");
            self.upstream.unsubscribe(&ticker);
            self.announce_reopen = false;
            self.status.set_active_ticker(None);
        }
    }

    /// Dispatch an upstream event.
    pub fn on_upstream_event(&mut self, event: UpstreamEvent) {
        match event {
            UpstreamEvent::Opened { generation } => {
                if self.upstream.on_open(generation, self.active.as_ref()) && self.announce_reopen {
                    self.announce_reopen = false;
                    if let Some(ticker) = self.active.clone() {
                        self.broadcast(&ServerMessage::status(
                            ticker.as_str(),
                            format!("Live feed reconnected. Streaming {ticker} trades."),
                        ));
                    }
                }
            }
            UpstreamEvent::Message { generation, text } => {
                let trades = self.upstream.on_message(generation, &text, self.active.as_ref());
                for trade in &trades {
                    self.broadcast_trade(trade);
                }
            }
            UpstreamEvent::Closed { generation, reason } => {
                if self.upstream.on_closed(generation, &reason).is_some()
                    && let Some(ticker) = self.active.clone()
                {
                    self.announce_reopen = true;
                    self.broadcast(&ServerMessage::status(
                        ticker.as_str(),
                        "Live feed disconnected. Reconnecting...",
                    ));
                }
            }
            UpstreamEvent::ReconnectDue { token } => self.upstream.on_reconnect_due(token),
        }
    }

    /// Send a trade update to every client.
    pub fn broadcast_trade(&mut self, trade: &TradeUpdate) {
        let delivered = self.broadcast(&ServerMessage::from(trade));
        metrics::record_trades_broadcast(delivered);
        self.status.add_trades_broadcast(delivered);
    }

    /// Close the upstream and every client socket.
    pub fn shutdown(&mut self) {
        tracing::info!(clients = self.clients.len(), "Closing relay");
        self.upstream.shutdown();
        for (id, sender) in self.clients.drain() {
            if sender.try_send(ClientFrame::Close).is_err() {
                tracing::debug!(client_id = %id, "Client writer already gone");
            }
        }
        self.active = None;
        self.status.set_active_ticker(None);
        self.publish_clients();
    }

    /// Whether the upstream is still closing after `shutdown`.
    #[must_use]
    pub const fn is_closing(&self) -> bool {
        self.upstream.is_closing()
    }

    fn subscribe(&mut self, id: ClientId, ticker: TickerSymbol) {
        let progress = if self.upstream.is_up() {
            format!("Processing subscription for {ticker}...")
        } else {
            format!("Reconnecting to live feed for {ticker}...")
        };
        self.send_to(id, &ServerMessage::status(ticker.as_str(), progress));

        if self.active.as_ref() == Some(&ticker) {
            if !self.upstream.is_up() {
                self.upstream.reconnect_now();
            } else if self.upstream.subscribed_ticker() != Some(&ticker) {
                // An earlier subscribe may have been dropped on a full queue.
                self.upstream.subscribe(&ticker);
            }
        } else {
            if let Some(previous) = self.active.take() {
                self.upstream.unsubscribe(&previous);
            }
            tracing::info!(client_id = %id, ticker = %ticker, "Switching active ticker");
            metrics::record_ticker_switch();
            self.status.set_active_ticker(Some(ticker.as_str()));
            self.active = Some(ticker.clone());
            self.upstream.subscribe(&ticker);
        }

        let mut listening = format!("Now listening for live {ticker} trades.");
        if !self.market_hours.is_open() {
            listening.push_str(" The market is currently closed; updates may be sparse.");
        }
        self.send_to(id, &ServerMessage::status(ticker.as_str(), listening));
    }

    fn send_to(&self, id: ClientId, message: &ServerMessage) {
        let Some(sender) = self.clients.get(&id) else {
            return;
        };
        match message.to_json() {
            Ok(json) => {
                try_queue(id, sender, ClientFrame::Text(Arc::from(json)));
            }
            Err(e) => tracing::error!(error = %e, "Failed to serialize client message"),
        }
    }

    /// Serialize once and queue to every client; returns the delivered count.
    fn broadcast(&self, message: &ServerMessage) -> u64 {
        let json: Arc<str> = match message.to_json() {
            Ok(json) => Arc::from(json),
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize broadcast");
                return 0;
            }
        };

        let mut delivered = 0;
        for (id, sender) in &self.clients {
            if try_queue(*id, sender, ClientFrame::Text(Arc::clone(&json))) {
                delivered += 1;
            }
        }
        delivered
    }

    fn publish_clients(&self) {
        self.status.set_clients(self.clients.len());
        metrics::set_clients(self.clients.len());
    }
}

fn try_queue(id: ClientId, sender: &ClientSender, frame: ClientFrame) -> bool {
    match sender.try_send(frame) {
        Ok(()) => true,
        Err(tokio::sync::mpsc::error::TrySendError::Full(_)) => {
            tracing::warn!(client_id = %id, "Client queue full, dropping frame");
            metrics::record_client_send_failure(SendFailure::QueueFull);
            false
        }
        Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => {
            tracing::debug!(client_id = %id, "Client writer closed, dropping frame");
            metrics::record_client_send_failure(SendFailure::Closed);
            false
        }
    }
}
