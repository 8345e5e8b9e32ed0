//! Upstream Feed Connection
//!
//! Owns the single connection to the trade feed and its lifecycle:
//!
//! ```text
//! Disconnected --connect()--> Connecting --Opened--> Open
//!      ^                          |                   |
//!      +------- Closed -----------+-------------------+
//!                                                     |
//!                         shutdown() --> Closing -----+
//! ```
//!
//! Every close outside shutdown schedules a reconnect through
//! [`ReconnectScheduler`]. Events carry the generation of the connection that
//! raised them; events from superseded connections are ignored.
//!
//! The active ticker is owned by the hub and passed into each handler that
//! needs it.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::application::ports::{UpstreamCommand, UpstreamConnector, UpstreamEvent, UpstreamLink};
use crate::application::services::reconnect::{
    ReconnectConfig, ReconnectDelay, ReconnectPolicy, ReconnectScheduler,
};
use crate::application::services::status::{RelayStatus, UpstreamState};
use crate::domain::market_hours::MarketHoursGate;
use crate::domain::ticker::TickerSymbol;
use crate::domain::trade::TradeUpdate;
use crate::infrastructure::finnhub::{FeedCodec, FeedMessage};
use crate::infrastructure::metrics::{self, Direction};

/// Lifecycle phase; connected phases own the link to the connection task.
#[derive(Debug)]
enum ConnectionPhase {
    Disconnected,
    Connecting(UpstreamLink),
    Open(UpstreamLink),
    Closing(UpstreamLink),
}

impl ConnectionPhase {
    const fn state(&self) -> UpstreamState {
        match self {
            Self::Disconnected => UpstreamState::Disconnected,
            Self::Connecting(_) => UpstreamState::Connecting,
            Self::Open(_) => UpstreamState::Open,
            Self::Closing(_) => UpstreamState::Closing,
        }
    }

    const fn generation(&self) -> Option<u64> {
        match self {
            Self::Disconnected => None,
            Self::Connecting(link) | Self::Open(link) | Self::Closing(link) => {
                Some(link.generation())
            }
        }
    }
}

/// The single upstream trade feed connection.
pub struct UpstreamFeedConnection {
    connector: Arc<dyn UpstreamConnector>,
    events: mpsc::Sender<UpstreamEvent>,
    codec: FeedCodec,
    phase: ConnectionPhase,
    next_generation: u64,
    subscribed: Option<TickerSymbol>,
    policy: ReconnectPolicy,
    scheduler: ReconnectScheduler,
    market_hours: MarketHoursGate,
    status: Arc<RelayStatus>,
    shutting_down: bool,
}

impl std::fmt::Debug for UpstreamFeedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamFeedConnection")
            .field("phase", &self.phase)
            .field("subscribed", &self.subscribed)
            .field("policy", &self.policy)
            .field("shutting_down", &self.shutting_down)
            .finish_non_exhaustive()
    }
}

impl UpstreamFeedConnection {
    /// Create a disconnected feed connection.
    ///
    /// `events` is the relay's upstream event channel; it is handed to every
    /// connection task and to the reconnect scheduler.
    #[must_use]
    pub fn new(
        connector: Arc<dyn UpstreamConnector>,
        events: mpsc::Sender<UpstreamEvent>,
        reconnect: ReconnectConfig,
        market_hours: MarketHoursGate,
        status: Arc<RelayStatus>,
    ) -> Self {
        let scheduler = ReconnectScheduler::new(events.clone());
        Self {
            connector,
            events,
            codec: FeedCodec::new(),
            phase: ConnectionPhase::Disconnected,
            next_generation: 0,
            subscribed: None,
            policy: ReconnectPolicy::new(reconnect),
            scheduler,
            market_hours,
            status,
            shutting_down: false,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> UpstreamState {
        self.phase.state()
    }

    /// Whether a connection is open or being established.
    #[must_use]
    pub const fn is_up(&self) -> bool {
        self.phase.state().is_up()
    }

    /// Whether a graceful close is still in progress.
    #[must_use]
    pub const fn is_closing(&self) -> bool {
        matches!(self.phase, ConnectionPhase::Closing(_))
    }

    /// The ticker the upstream believes it is streaming.
    #[must_use]
    pub const fn subscribed_ticker(&self) -> Option<&TickerSymbol> {
        self.subscribed.as_ref()
    }

    /// Reconnect attempts since the last successful open.
    #[must_use]
    pub const fn reconnect_attempts(&self) -> u32 {
        self.policy.attempt_count()
    }

    /// Whether a reconnect timer is pending.
    #[must_use]
    pub const fn reconnect_pending(&self) -> bool {
        self.scheduler.is_pending()
    }

    /// Start a connection attempt if none exists.
    ///
    /// Any pending reconnect timer is cancelled first. If the attempt cannot
    /// be started the long fallback interval is scheduled.
    pub fn connect(&mut self) {
        self.scheduler.cancel();
        if self.shutting_down || !matches!(self.phase, ConnectionPhase::Disconnected) {
            return;
        }

        self.next_generation += 1;
        let generation = self.next_generation;

        match self.connector.connect(generation, self.events.clone()) {
            Ok(link) => {
                tracing::info!(
                    generation,
                    attempt = self.policy.attempt_count(),
                    "Connecting to upstream feed"
                );
                self.phase = ConnectionPhase::Connecting(link);
                self.publish_state();
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cannot start upstream connection");
                metrics::record_upstream_error("connect");
                self.status.set_error(e.to_string());
                let delay = self.policy.fallback_delay();
                self.schedule(delay);
            }
        }
    }

    /// Reset the backoff and connect immediately if disconnected.
    pub fn reconnect_now(&mut self) {
        if matches!(self.phase, ConnectionPhase::Disconnected) && !self.shutting_down {
            tracing::info!("Forcing immediate upstream reconnect");
            self.policy.reset();
            self.connect();
        }
    }

    /// Handle a completed handshake.
    ///
    /// Resets the backoff and subscribes `active` if set. Returns `false` for
    /// stale or unexpected events.
    pub fn on_open(&mut self, generation: u64, active: Option<&TickerSymbol>) -> bool {
        let phase = std::mem::replace(&mut self.phase, ConnectionPhase::Disconnected);
        let link = match phase {
            ConnectionPhase::Connecting(link) if link.generation() == generation => link,
            other => {
                self.phase = other;
                tracing::debug!(generation, "Ignoring stale upstream open");
                return false;
            }
        };

        self.phase = ConnectionPhase::Open(link);
        self.policy.reset();
        self.scheduler.cancel();
        self.subscribed = None;
        self.publish_state();
        metrics::set_upstream_connected(true);
        tracing::info!(generation, "Upstream feed connected");

        if let Some(ticker) = active {
            self.subscribe(ticker);
        }
        true
    }

    /// Handle an inbound text frame.
    ///
    /// Returns the trades for `active` in arrival order; records for any other
    /// symbol are dropped.
    pub fn on_message(
        &mut self,
        generation: u64,
        text: &str,
        active: Option<&TickerSymbol>,
    ) -> Vec<TradeUpdate> {
        if !matches!(&self.phase, ConnectionPhase::Open(link) if link.generation() == generation) {
            return Vec::new();
        }

        let message = match self.codec.decode(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed upstream message");
                metrics::record_malformed(Direction::Upstream, 1);
                return Vec::new();
            }
        };

        match message {
            FeedMessage::Trades { records, malformed } => {
                metrics::record_upstream_message("trade");
                if malformed > 0 {
                    metrics::record_malformed(Direction::Upstream, malformed as u64);
                }
                let Some(ticker) = active else {
                    return Vec::new();
                };
                records
                    .iter()
                    .filter_map(|record| record.normalize_for(ticker))
                    .collect()
            }
            FeedMessage::Ping => {
                metrics::record_upstream_message("ping");
                self.send(UpstreamCommand::Pong);
                Vec::new()
            }
            FeedMessage::Error { msg } => {
                metrics::record_upstream_message("error");
                metrics::record_upstream_error("feed");
                tracing::warn!(error = %msg, "Upstream feed reported an error");
                self.status.set_error(msg);
                Vec::new()
            }
            FeedMessage::Other { kind } => {
                tracing::debug!(kind = %kind, "Ignoring upstream message");
                Vec::new()
            }
        }
    }

    /// Handle the end of a connection.
    ///
    /// Returns the scheduled reconnect delay, or `None` when the event was
    /// stale or the relay is shutting down.
    pub fn on_closed(&mut self, generation: u64, reason: &str) -> Option<ReconnectDelay> {
        if self.phase.generation() != Some(generation) {
            tracing::debug!(generation, "Ignoring stale upstream close");
            return None;
        }

        let was_open = matches!(self.phase, ConnectionPhase::Open(_));
        self.phase = ConnectionPhase::Disconnected;
        self.subscribed = None;
        self.publish_state();
        metrics::set_upstream_connected(false);

        if self.shutting_down {
            tracing::info!(generation, "Upstream feed closed");
            return None;
        }

        if was_open {
            tracing::warn!(generation, reason = %reason, "Upstream feed disconnected");
        } else {
            tracing::warn!(generation, reason = %reason, "Upstream connection attempt failed");
        }
        metrics::record_upstream_error(if was_open { "disconnect" } else { "handshake" });
        self.status.set_error(reason);

        let delay = self.policy.next_delay(self.market_hours.is_open());
        self.schedule(delay);
        Some(delay)
    }

    /// Handle a fired reconnect timer; stale tokens are ignored.
    pub fn on_reconnect_due(&mut self, token: u64) {
        if self.scheduler.take_if_current(token) {
            self.connect();
        }
    }

    /// Subscribe `ticker`, replacing any other subscription.
    ///
    /// While connecting the change is deferred to `on_open`; while
    /// disconnected an immediate reconnect is forced.
    pub fn subscribe(&mut self, ticker: &TickerSymbol) {
        match self.state() {
            UpstreamState::Open => {
                if self.subscribed.as_ref() == Some(ticker) {
                    return;
                }
                if let Some(previous) = self.subscribed.take() {
                    self.send(UpstreamCommand::Unsubscribe(previous));
                }
                if self.send(UpstreamCommand::Subscribe(ticker.clone())) {
                    tracing::info!(ticker = %ticker, "Subscribed upstream");
                    self.subscribed = Some(ticker.clone());
                }
            }
            UpstreamState::Connecting => {
                tracing::debug!(ticker = %ticker, "Deferring subscription until open");
            }
            UpstreamState::Disconnected => self.reconnect_now(),
            UpstreamState::Closing => {}
        }
    }

    /// Unsubscribe `ticker` if it is the current subscription.
    pub fn unsubscribe(&mut self, ticker: &TickerSymbol) {
        if self.state() != UpstreamState::Open || self.subscribed.as_ref() != Some(ticker) {
            return;
        }
        self.subscribed = None;
        if self.send(UpstreamCommand::Unsubscribe(ticker.clone())) {
            tracing::info!(ticker = %ticker, "Unsubscribed upstream");
        }
    }

    /// Disable auto-reconnect and start a graceful close.
    pub fn shutdown(&mut self) {
        self.shutting_down = true;
        self.scheduler.cancel();

        match std::mem::replace(&mut self.phase, ConnectionPhase::Disconnected) {
            ConnectionPhase::Open(link) => {
                if let Err(e) = link.send(UpstreamCommand::Close) {
                    tracing::debug!(error = %e, "Upstream task already gone");
                } else {
                    self.phase = ConnectionPhase::Closing(link);
                }
            }
            ConnectionPhase::Closing(link) => self.phase = ConnectionPhase::Closing(link),
            // Dropping a connecting link cancels its task.
            ConnectionPhase::Connecting(_) | ConnectionPhase::Disconnected => {}
        }
        self.subscribed = None;
        self.publish_state();
    }

    fn send(&self, command: UpstreamCommand) -> bool {
        let ConnectionPhase::Open(link) = &self.phase else {
            return false;
        };
        match link.send(command) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to queue upstream command");
                false
            }
        }
    }

    fn schedule(&mut self, delay: ReconnectDelay) {
        tracing::info!(
            delay_ms = u64::try_from(delay.duration().as_millis()).unwrap_or(u64::MAX),
            kind = delay.kind(),
            attempt = self.policy.attempt_count(),
            "Scheduling upstream reconnect"
        );
        metrics::record_reconnect(delay.kind());
        self.scheduler.schedule(delay.duration());
        self.status
            .set_reconnect(self.policy.attempt_count(), delay.is_fallback());
    }

    fn publish_state(&self) {
        self.status.set_upstream_state(self.phase.state());
        if matches!(self.phase, ConnectionPhase::Open(_)) {
            self.status.set_reconnect(0, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::application::ports::ConnectError;
    use crate::domain::market_hours::MarketSession;

    #[derive(Default)]
    struct FakeConnector {
        links: Mutex<Vec<(u64, mpsc::Receiver<UpstreamCommand>, CancellationToken)>>,
        fail: Mutex<bool>,
    }

    impl UpstreamConnector for FakeConnector {
        fn connect(
            &self,
            generation: u64,
            _events: mpsc::Sender<UpstreamEvent>,
        ) -> Result<UpstreamLink, ConnectError> {
            if *self.fail.lock() {
                return Err(ConnectError::MissingCredential("FINNHUB_API_KEY"));
            }
            let (tx, rx) = mpsc::channel(16);
            let cancel = CancellationToken::new();
            self.links.lock().push((generation, rx, cancel.clone()));
            Ok(UpstreamLink::new(generation, tx, cancel))
        }
    }

    impl FakeConnector {
        fn drain(&self, index: usize) -> Vec<UpstreamCommand> {
            let mut links = self.links.lock();
            let mut commands = Vec::new();
            while let Ok(command) = links[index].1.try_recv() {
                commands.push(command);
            }
            commands
        }
    }

    fn config() -> ReconnectConfig {
        ReconnectConfig {
            max_jitter: Duration::ZERO,
            ..ReconnectConfig::default()
        }
    }

    fn setup() -> (
        Arc<FakeConnector>,
        UpstreamFeedConnection,
        mpsc::Receiver<UpstreamEvent>,
    ) {
        let connector = Arc::new(FakeConnector::default());
        let (tx, rx) = mpsc::channel(16);
        let connection = UpstreamFeedConnection::new(
            connector.clone(),
            tx,
            config(),
            MarketHoursGate::new(MarketSession::regular()),
            Arc::new(RelayStatus::new()),
        );
        (connector, connection, rx)
    }

    fn ticker(s: &str) -> TickerSymbol {
        TickerSymbol::parse(s).unwrap()
    }

    #[tokio::test]
    async fn open_subscribes_active_ticker() {
        let (connector, mut conn, _rx) = setup();
        conn.connect();
        assert_eq!(conn.state(), UpstreamState::Connecting);

        // Deferred while connecting.
        conn.subscribe(&ticker("NVDA"));
        assert!(connector.drain(0).is_empty());

        assert!(conn.on_open(1, Some(&ticker("NVDA"))));
        assert_eq!(conn.state(), UpstreamState::Open);
        assert_eq!(conn.subscribed_ticker(), Some(&ticker("NVDA")));
        assert_eq!(
            connector.drain(0),
            vec![UpstreamCommand::Subscribe(ticker("NVDA"))]
        );
    }

    #[tokio::test]
    async fn switching_unsubscribes_previous_first() {
        let (connector, mut conn, _rx) = setup();
        conn.connect();
        conn.on_open(1, Some(&ticker("NVDA")));
        connector.drain(0);

        conn.subscribe(&ticker("AAPL"));

        assert_eq!(
            connector.drain(0),
            vec![
                UpstreamCommand::Unsubscribe(ticker("NVDA")),
                UpstreamCommand::Subscribe(ticker("AAPL")),
            ]
        );
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let (connector, mut conn, _rx) = setup();
        conn.connect();
        conn.on_open(1, None);

        let trades = conn.on_message(1, r#"{"type":"ping"}"#, None);

        assert!(trades.is_empty());
        assert_eq!(connector.drain(0), vec![UpstreamCommand::Pong]);
    }

    #[tokio::test]
    async fn only_active_symbol_trades_are_emitted() {
        let (_connector, mut conn, _rx) = setup();
        conn.connect();
        conn.on_open(1, Some(&ticker("AAPL")));

        let trades = conn.on_message(
            1,
            r#"{"type":"trade","data":[{"s":"NVDA","p":1.0,"t":1,"v":1},{"s":"AAPL","p":2.0,"t":2,"v":3}]}"#,
            Some(&ticker("AAPL")),
        );

        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].ticker, ticker("AAPL"));
    }

    #[tokio::test]
    async fn malformed_message_keeps_connection_open() {
        let (_connector, mut conn, _rx) = setup();
        conn.connect();
        conn.on_open(1, None);

        assert!(conn.on_message(1, "{{garbage", None).is_empty());
        assert_eq!(conn.state(), UpstreamState::Open);
    }

    #[tokio::test]
    async fn close_schedules_backoff_and_ignores_stale_events() {
        let (_connector, mut conn, _rx) = setup();
        conn.connect();
        conn.on_open(1, Some(&ticker("NVDA")));

        assert!(conn.on_closed(7, "stale").is_none());
        assert_eq!(conn.state(), UpstreamState::Open);

        let delay = conn.on_closed(1, "reset by peer").unwrap();
        assert_eq!(delay.kind(), "backoff");
        assert_eq!(conn.state(), UpstreamState::Disconnected);
        assert!(conn.subscribed_ticker().is_none());
        assert!(conn.reconnect_pending());
        assert_eq!(conn.reconnect_attempts(), 1);

        // A stale message from the closed generation is dropped.
        assert!(conn.on_message(1, r#"{"type":"ping"}"#, None).is_empty());
    }

    #[tokio::test]
    async fn reconnect_timer_opens_new_generation_and_resets_backoff() {
        let (connector, mut conn, mut rx) = setup();
        conn.connect();
        conn.on_closed(1, "handshake failed");

        let event = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let UpstreamEvent::ReconnectDue { token } = event else {
            panic!("expected reconnect deadline");
        };

        conn.on_reconnect_due(token);
        assert_eq!(conn.state(), UpstreamState::Connecting);
        assert_eq!(connector.links.lock().len(), 2);

        assert!(!conn.on_open(1, None));
        assert!(conn.on_open(2, None));
        assert_eq!(conn.reconnect_attempts(), 0);
    }

    #[tokio::test]
    async fn missing_credential_schedules_fallback() {
        let (connector, mut conn, _rx) = setup();
        *connector.fail.lock() = true;

        conn.connect();

        assert_eq!(conn.state(), UpstreamState::Disconnected);
        assert!(conn.reconnect_pending());

        // A forced retry cancels the long timer and tries again.
        *connector.fail.lock() = false;
        conn.subscribe(&ticker("MSFT"));
        assert_eq!(conn.state(), UpstreamState::Connecting);
        assert!(!conn.reconnect_pending());
    }

    #[tokio::test]
    async fn shutdown_closes_and_disables_reconnect() {
        let (connector, mut conn, _rx) = setup();
        conn.connect();
        conn.on_open(1, Some(&ticker("NVDA")));
        connector.drain(0);

        conn.shutdown();
        assert!(conn.is_closing());
        assert_eq!(connector.drain(0), vec![UpstreamCommand::Close]);

        assert!(conn.on_closed(1, "normal closure").is_none());
        assert_eq!(conn.state(), UpstreamState::Disconnected);
        assert!(!conn.reconnect_pending());

        conn.connect();
        assert_eq!(conn.state(), UpstreamState::Disconnected);
    }

    #[tokio::test]
    async fn shutdown_while_connecting_cancels_task() {
        let (connector, mut conn, _rx) = setup();
        conn.connect();

        conn.shutdown();

        assert_eq!(conn.state(), UpstreamState::Disconnected);
        assert!(connector.links.lock()[0].2.is_cancelled());
    }
}
