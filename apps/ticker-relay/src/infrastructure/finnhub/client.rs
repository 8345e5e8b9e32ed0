//! Finnhub WebSocket Client
//!
//! Connects to Finnhub's real-time trade stream. Each connection attempt runs
//! in its own task that reports `Opened`, every text frame, and exactly one
//! `Closed` event back to the relay, and writes the relay's commands to the
//! socket in order.
//!
//! # Stream URL
//!
//! `wss://ws.finnhub.io?token=<api key>`
//!
//! The token is never logged.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;

use super::codec::{CodecError, FeedCodec};
use super::messages::FeedRequest;
use crate::application::ports::{
    ConnectError, UpstreamCommand, UpstreamConnector, UpstreamEvent, UpstreamLink,
};
use crate::infrastructure::config::{API_KEY_VAR, Credentials, FeedSettings};

/// Commands buffered per connection before `send` reports a full queue.
const COMMAND_CAPACITY: usize = 64;

/// How long to wait for the server to acknowledge a close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// Error Type
// =============================================================================

/// Errors that end a Finnhub connection.
#[derive(Debug, thiserror::Error)]
pub enum FeedClientError {
    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The relay stopped listening for events.
    #[error("event channel closed")]
    ChannelSend,

    /// The server sent a close frame.
    #[error("closed by server: {0}")]
    ClosedByPeer(String),

    /// The stream ended without a close frame.
    #[error("connection closed")]
    ConnectionClosed,
}

// =============================================================================
// Connector
// =============================================================================

/// [`UpstreamConnector`] for the Finnhub trade stream.
#[derive(Debug, Clone)]
pub struct FinnhubConnector {
    settings: FeedSettings,
}

impl FinnhubConnector {
    /// Create a connector for the configured endpoint.
    #[must_use]
    pub const fn new(settings: FeedSettings) -> Self {
        Self { settings }
    }

    /// Configured credential, else whatever the environment holds now.
    fn credentials(&self) -> Option<Credentials> {
        self.settings
            .credentials
            .clone()
            .or_else(Credentials::from_env)
    }
}

impl UpstreamConnector for FinnhubConnector {
    fn connect(
        &self,
        generation: u64,
        events: mpsc::Sender<UpstreamEvent>,
    ) -> Result<UpstreamLink, ConnectError> {
        let credentials = self
            .credentials()
            .ok_or(ConnectError::MissingCredential(API_KEY_VAR))?;

        if !(self.settings.url.starts_with("ws://") || self.settings.url.starts_with("wss://")) {
            return Err(ConnectError::InvalidEndpoint(self.settings.url.clone()));
        }

        let (commands_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let cancel = CancellationToken::new();

        let session = FeedSession {
            generation,
            url: self.settings.url.clone(),
            endpoint: endpoint_with_token(&self.settings.url, &credentials),
            codec: FeedCodec::new(),
            commands,
            events,
            cancel: cancel.clone(),
        };
        tokio::spawn(session.run());

        Ok(UpstreamLink::new(generation, commands_tx, cancel))
    }
}

fn endpoint_with_token(url: &str, credentials: &Credentials) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}token={}", credentials.api_key())
}

// =============================================================================
// Connection Task
// =============================================================================

struct FeedSession {
    generation: u64,
    url: String,
    endpoint: String,
    codec: FeedCodec,
    commands: mpsc::Receiver<UpstreamCommand>,
    events: mpsc::Sender<UpstreamEvent>,
    cancel: CancellationToken,
}

impl FeedSession {
    async fn run(mut self) {
        let reason = match self.connect_and_run().await {
            Ok(reason) => reason.to_string(),
            Err(e) => {
                tracing::debug!(generation = self.generation, error = %e, "Finnhub connection ended");
                e.to_string()
            }
        };

        let _ = self
            .events
            .send(UpstreamEvent::Closed {
                generation: self.generation,
                reason,
            })
            .await;
    }

    /// Run until the socket closes; `Ok` carries the reason for a close the
    /// relay asked for.
    async fn connect_and_run(&mut self) -> Result<&'static str, FeedClientError> {
        tracing::info!(url = %self.url, generation = self.generation, "Connecting to Finnhub");

        let (ws_stream, _response) = tokio::select! {
            () = self.cancel.cancelled() => return Ok("connection cancelled"),
            result = tokio_tungstenite::connect_async(self.endpoint.as_str()) => result?,
        };

        self.events
            .send(UpstreamEvent::Opened {
                generation: self.generation,
            })
            .await
            .map_err(|_| FeedClientError::ChannelSend)?;

        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok("connection cancelled");
                }
                command = self.commands.recv() => {
                    match command {
                        Some(UpstreamCommand::Close) => {
                            write
                                .send(Message::Close(Some(CloseFrame {
                                    code: CloseCode::Normal,
                                    reason: "relay shutting down".into(),
                                })))
                                .await?;
                            // Wait briefly for the server's close reply.
                            let _ = tokio::time::timeout(CLOSE_TIMEOUT, async {
                                while let Some(Ok(msg)) = read.next().await {
                                    if msg.is_close() {
                                        break;
                                    }
                                }
                            })
                            .await;
                            return Ok("closed by relay");
                        }
                        Some(command) => {
                            if let Some(request) = FeedRequest::from_command(&command) {
                                let json = self.codec.encode(&request)?;
                                tracing::debug!(request = %json, "Sending Finnhub request");
                                write.send(Message::Text(json.into())).await?;
                            }
                        }
                        None => {
                            let _ = write.send(Message::Close(None)).await;
                            return Ok("link dropped");
                        }
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.events
                                .send(UpstreamEvent::Message {
                                    generation: self.generation,
                                    text: text.as_str().to_owned(),
                                })
                                .await
                                .map_err(|_| FeedClientError::ChannelSend)?;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame.map_or_else(
                                || "no close frame".to_string(),
                                |f| format!("{} {}", u16::from(f.code), f.reason.as_str()),
                            );
                            tracing::info!(reason = %reason, "Finnhub sent close frame");
                            return Err(FeedClientError::ClosedByPeer(reason));
                        }
                        Some(Ok(_)) => {
                            // Binary and pong frames are not used by the feed.
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(FeedClientError::ConnectionClosed),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    fn settings(url: &str) -> FeedSettings {
        FeedSettings {
            url: url.to_string(),
            credentials: Credentials::new("test-key"),
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<UpstreamEvent>) -> UpstreamEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event within timeout")
            .expect("channel open")
    }

    #[test]
    fn token_is_appended_as_query() {
        let creds = Credentials::new("abc").unwrap();
        assert_eq!(
            endpoint_with_token("wss://ws.finnhub.io", &creds),
            "wss://ws.finnhub.io?token=abc"
        );
        assert_eq!(
            endpoint_with_token("ws://host/feed?x=1", &creds),
            "ws://host/feed?x=1&token=abc"
        );
    }

    #[tokio::test]
    async fn invalid_endpoint_is_rejected() {
        let connector = FinnhubConnector::new(settings("http://ws.finnhub.io"));
        let (tx, _rx) = mpsc::channel(4);
        assert!(matches!(
            connector.connect(1, tx),
            Err(ConnectError::InvalidEndpoint(_))
        ));
    }

    #[tokio::test]
    async fn relays_frames_and_commands() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text(r#"{"type":"ping"}"#.into())).await.unwrap();
            let received = loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => break text.as_str().to_owned(),
                    Some(Ok(_)) => {}
                    other => panic!("unexpected frame: {other:?}"),
                }
            };
            drop(ws);
            received
        });

        let connector = FinnhubConnector::new(settings(&format!("ws://{addr}")));
        let (tx, mut rx) = mpsc::channel(16);
        let link = connector.connect(3, tx).unwrap();

        assert_eq!(next_event(&mut rx).await, UpstreamEvent::Opened { generation: 3 });
        assert_eq!(
            next_event(&mut rx).await,
            UpstreamEvent::Message {
                generation: 3,
                text: r#"{"type":"ping"}"#.to_string()
            }
        );

        link.send(UpstreamCommand::Pong).unwrap();
        assert_eq!(server.await.unwrap(), r#"{"type":"pong"}"#);

        assert!(matches!(
            next_event(&mut rx).await,
            UpstreamEvent::Closed { generation: 3, .. }
        ));
    }

    #[tokio::test]
    async fn refused_connection_reports_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = FinnhubConnector::new(settings(&format!("ws://{addr}")));
        let (tx, mut rx) = mpsc::channel(4);
        let _link = connector.connect(9, tx).unwrap();

        assert!(matches!(
            next_event(&mut rx).await,
            UpstreamEvent::Closed { generation: 9, .. }
        ));
    }
}
