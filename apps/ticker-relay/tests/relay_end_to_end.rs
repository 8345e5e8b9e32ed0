//! End-to-end relay tests.
//!
//! Runs the real relay, client server and Finnhub connector against a local
//! mock feed, with browser clients connecting over WebSocket.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use ticker_relay::application::services::ReconnectConfig;
use ticker_relay::infrastructure::config::{Credentials, FeedSettings};
use ticker_relay::{ClientServer, FinnhubConnector, RelayOptions, RelayService, RelayStatus};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_secs(5);

type FeedSocket = WebSocketStream<TcpStream>;
type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// Harness
// =============================================================================

struct TestRelay {
    client_addr: SocketAddr,
    feeds: mpsc::Receiver<FeedSocket>,
    status: Arc<RelayStatus>,
    cancel: CancellationToken,
    relay: JoinHandle<()>,
}

impl TestRelay {
    async fn start() -> Self {
        Self::start_with(fast_reconnect()).await
    }

    async fn start_with(reconnect: ReconnectConfig) -> Self {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let (feed_addr, feeds) = spawn_mock_feed().await;
        let connector = Arc::new(FinnhubConnector::new(FeedSettings {
            url: format!("ws://{feed_addr}"),
            credentials: Credentials::new("test-key"),
        }));

        let status = Arc::new(RelayStatus::new());
        let cancel = CancellationToken::new();
        let options = RelayOptions {
            reconnect,
            ..RelayOptions::default()
        };
        let (service, handle) =
            RelayService::new(options, connector, Arc::clone(&status), cancel.clone());
        let relay = tokio::spawn(service.run());

        let server = ClientServer::bind("127.0.0.1:0", handle, 64, cancel.clone())
            .await
            .unwrap();
        let client_addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        Self {
            client_addr,
            feeds,
            status,
            cancel,
            relay,
        }
    }

    async fn next_feed(&mut self) -> FeedSocket {
        tokio::time::timeout(TIMEOUT, self.feeds.recv())
            .await
            .expect("relay connected upstream")
            .expect("mock feed running")
    }

    async fn connect_client(&self) -> ClientSocket {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", self.client_addr))
            .await
            .unwrap();
        ws
    }
}

fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        initial_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(200),
        max_jitter: Duration::ZERO,
        ..ReconnectConfig::default()
    }
}

/// Accepts upstream connections and hands each socket to the test.
async fn spawn_mock_feed() -> (SocketAddr, mpsc::Receiver<FeedSocket>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::channel(8);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            if let Ok(ws) = tokio_tungstenite::accept_async(stream).await
                && tx.send(ws).await.is_err()
            {
                break;
            }
        }
    });

    (addr, rx)
}

async fn next_text<S>(ws: &mut WebSocketStream<S>) -> String
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    tokio::time::timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return text.as_str().to_owned(),
                Some(Ok(Message::Close(frame))) => panic!("socket closed: {frame:?}"),
                Some(Ok(_)) => {}
                other => panic!("socket ended: {other:?}"),
            }
        }
    })
    .await
    .expect("text frame within timeout")
}

async fn next_json<S>(ws: &mut WebSocketStream<S>) -> Value
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    serde_json::from_str(&next_text(ws).await).unwrap()
}

async fn send_text<S>(ws: &mut WebSocketStream<S>, text: &str)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    ws.send(Message::Text(text.into())).await.unwrap();
}

/// Subscribe and consume the two status replies.
async fn subscribe(client: &mut ClientSocket, ticker: &str) -> (Value, Value) {
    send_text(client, &format!(r#"{{"type":"subscribe","ticker":"{ticker}"}}"#)).await;
    (next_json(client).await, next_json(client).await)
}

fn trade_frame(symbol: &str, price: f64) -> String {
    format!(r#"{{"type":"trade","data":[{{"s":"{symbol}","p":{price},"t":1700000000000,"v":10}}]}}"#)
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn subscribe_then_receive_trade() {
    let mut relay = TestRelay::start().await;
    let mut feed = relay.next_feed().await;
    let mut client = relay.connect_client().await;

    let (processing, listening) = subscribe(&mut client, "nvda").await;
    assert_eq!(processing["type"], "status");
    assert_eq!(processing["ticker"], "NVDA");
    assert_eq!(processing["message"], "Processing subscription for NVDA...");
    assert_eq!(listening["ticker"], "NVDA");
    assert!(
        listening["message"]
            .as_str()
            .unwrap()
            .starts_with("Now listening for live NVDA trades.")
    );

    assert_eq!(
        serde_json::from_str::<Value>(&next_text(&mut feed).await).unwrap(),
        json!({"type": "subscribe", "symbol": "NVDA"})
    );

    send_text(&mut feed, &trade_frame("NVDA", 113.98)).await;

    assert_eq!(
        next_text(&mut client).await,
        r#"{"type":"trade_update","ticker":"NVDA","price":113.98,"timestamp":"2023-11-14T22:13:20.000Z","volume":10}"#
    );
    assert_eq!(relay.status.snapshot().active_ticker.as_deref(), Some("NVDA"));
}

#[tokio::test]
async fn second_subscriber_switches_everyone() {
    let mut relay = TestRelay::start().await;
    let mut feed = relay.next_feed().await;
    let mut a = relay.connect_client().await;
    let mut b = relay.connect_client().await;

    subscribe(&mut a, "NVDA").await;
    subscribe(&mut b, "AAPL").await;

    let mut requests = Vec::new();
    for _ in 0..3 {
        requests.push(serde_json::from_str::<Value>(&next_text(&mut feed).await).unwrap());
    }
    assert_eq!(
        requests,
        vec![
            json!({"type": "subscribe", "symbol": "NVDA"}),
            json!({"type": "unsubscribe", "symbol": "NVDA"}),
            json!({"type": "subscribe", "symbol": "AAPL"}),
        ]
    );

    // A late NVDA trade is dropped; only AAPL reaches either client.
    send_text(&mut feed, &trade_frame("NVDA", 113.98)).await;
    send_text(&mut feed, &trade_frame("AAPL", 189.5)).await;

    for client in [&mut a, &mut b] {
        let update = next_json(client).await;
        assert_eq!(update["type"], "trade_update");
        assert_eq!(update["ticker"], "AAPL");
        assert_eq!(update["price"], 189.5);
    }
}

#[tokio::test]
async fn malformed_message_gets_error_and_socket_survives() {
    let mut relay = TestRelay::start().await;
    let mut feed = relay.next_feed().await;
    let mut a = relay.connect_client().await;
    let mut b = relay.connect_client().await;

    subscribe(&mut b, "NVDA").await;
    next_text(&mut feed).await;

    send_text(&mut a, "{not json").await;
    assert_eq!(
        next_json(&mut a).await,
        json!({"type": "error", "message": "Invalid message format."})
    );

    send_text(&mut feed, &trade_frame("NVDA", 1.25)).await;
    for client in [&mut a, &mut b] {
        let update = next_json(client).await;
        assert_eq!(update["type"], "trade_update");
        assert_eq!(update["ticker"], "NVDA");
    }
}

#[tokio::test]
async fn last_client_leaving_unsubscribes_upstream() {
    let mut relay = TestRelay::start().await;
    let mut feed = relay.next_feed().await;
    let mut client = relay.connect_client().await;

    subscribe(&mut client, "TSLA").await;
    assert_eq!(
        serde_json::from_str::<Value>(&next_text(&mut feed).await).unwrap(),
        json!({"type": "subscribe", "symbol": "TSLA"})
    );

    client.close(None).await.unwrap();

    assert_eq!(
        serde_json::from_str::<Value>(&next_text(&mut feed).await).unwrap(),
        json!({"type": "unsubscribe", "symbol": "TSLA"})
    );
    tokio::time::timeout(TIMEOUT, async {
        while relay.status.snapshot().active_ticker.is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("active ticker released");
}

#[tokio::test]
async fn upstream_drop_reconnects_and_resubscribes() {
    let mut relay = TestRelay::start().await;
    let mut feed = relay.next_feed().await;
    let mut client = relay.connect_client().await;

    subscribe(&mut client, "NVDA").await;
    next_text(&mut feed).await;

    // Unclean drop: no close frame.
    drop(feed);

    let disconnected = next_json(&mut client).await;
    assert_eq!(disconnected["message"], "Live feed disconnected. Reconnecting...");

    let mut feed = relay.next_feed().await;
    assert_eq!(
        serde_json::from_str::<Value>(&next_text(&mut feed).await).unwrap(),
        json!({"type": "subscribe", "symbol": "NVDA"})
    );
    let reconnected = next_json(&mut client).await;
    assert_eq!(reconnected["message"], "Live feed reconnected. Streaming NVDA trades.");

    send_text(&mut feed, &trade_frame("NVDA", 114.0)).await;
    assert_eq!(next_json(&mut client).await["type"], "trade_update");
}

#[tokio::test]
async fn subscribe_while_down_reports_reconnecting() {
    let mut relay = TestRelay::start_with(ReconnectConfig {
        initial_delay: Duration::from_secs(60),
        max_delay: Duration::from_secs(60),
        max_jitter: Duration::ZERO,
        ..ReconnectConfig::default()
    })
    .await;
    let feed = relay.next_feed().await;
    let mut client = relay.connect_client().await;

    subscribe(&mut client, "NVDA").await;
    drop(feed);
    next_json(&mut client).await;

    // A fresh subscribe skips the pending backoff and reconnects now.
    let (progress, listening) = subscribe(&mut client, "NVDA").await;
    assert_eq!(progress["message"], "Reconnecting to live feed for NVDA...");
    assert!(
        listening["message"]
            .as_str()
            .unwrap()
            .starts_with("Now listening for live NVDA trades.")
    );

    let mut feed = relay.next_feed().await;
    assert_eq!(
        serde_json::from_str::<Value>(&next_text(&mut feed).await).unwrap(),
        json!({"type": "subscribe", "symbol": "NVDA"})
    );
}

#[tokio::test]
async fn shutdown_closes_clients_and_upstream() {
    let mut relay = TestRelay::start().await;
    let mut feed = relay.next_feed().await;
    let mut client = relay.connect_client().await;
    subscribe(&mut client, "NVDA").await;
    next_text(&mut feed).await;

    relay.cancel.cancel();

    let close = tokio::time::timeout(TIMEOUT, async {
        loop {
            match client.next().await {
                Some(Ok(Message::Close(frame))) => return frame,
                Some(Ok(_)) => {}
                other => panic!("expected close frame, got {other:?}"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(close.map(|f| f.code), Some(CloseCode::Normal));

    let upstream_close = tokio::time::timeout(TIMEOUT, async {
        loop {
            match feed.next().await {
                Some(Ok(Message::Close(_))) => return true,
                Some(Ok(_)) => {}
                _ => return false,
            }
        }
    })
    .await
    .unwrap();
    assert!(upstream_close);

    tokio::time::timeout(TIMEOUT, relay.relay)
        .await
        .expect("relay stops after upstream close")
        .unwrap();
}
