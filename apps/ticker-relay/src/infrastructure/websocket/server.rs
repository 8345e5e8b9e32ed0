//! Client WebSocket Server
//!
//! Accepts browser connections on `/` and `/ws`. Each socket gets an outbound
//! frame queue drained by a writer task, while the reader forwards text
//! frames to the relay task.

use std::net::SocketAddr;

use axum::{
    Router,
    extract::{
        State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    response::IntoResponse,
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{ClientFrame, ClientId};
use crate::application::services::relay::RelayHandle;

/// Client server errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientServerError {
    /// Failed to bind the listener.
    #[error("failed to bind to {0}: {1}")]
    BindFailed(String, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

#[derive(Debug, Clone)]
struct ClientServerState {
    relay: RelayHandle,
    queue_capacity: usize,
}

/// Downstream WebSocket server.
#[derive(Debug)]
pub struct ClientServer {
    listener: TcpListener,
    state: ClientServerState,
    cancel: CancellationToken,
}

impl ClientServer {
    /// Bind the listener.
    ///
    /// # Errors
    ///
    /// Returns [`ClientServerError::BindFailed`] if the address cannot be bound.
    pub async fn bind(
        addr: &str,
        relay: RelayHandle,
        queue_capacity: usize,
        cancel: CancellationToken,
    ) -> Result<Self, ClientServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ClientServerError::BindFailed(addr.to_string(), e.to_string()))?;

        Ok(Self {
            listener,
            state: ClientServerState {
                relay,
                queue_capacity: queue_capacity.max(1),
            },
            cancel,
        })
    }

    /// Address the server is listening on.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the socket address cannot be read.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`ClientServerError::ServerFailed`] on a fatal server error.
    pub async fn run(self) -> Result<(), ClientServerError> {
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!(addr = %addr, "Client WebSocket server listening");
        }

        let app = Router::new()
            .route("/", get(ws_handler))
            .route("/ws", get(ws_handler))
            .with_state(self.state);

        axum::serve(self.listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| ClientServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Client WebSocket server stopped");
        Ok(())
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<ClientServerState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: ClientServerState) {
    let id = ClientId::generate();
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ClientFrame>(state.queue_capacity);

    if state.relay.client_connected(id, tx).await.is_err() {
        let _ = sink.send(Message::Close(Some(going_away()))).await;
        return;
    }

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame {
                ClientFrame::Text(text) => {
                    if sink.send(Message::Text(text.as_ref().into())).await.is_err() {
                        break;
                    }
                }
                ClientFrame::Close => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: "server shutting down".into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            _ = &mut writer => break,
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if state.relay.client_message(id, text.as_str().to_owned()).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Ping/pong are answered by axum; binary frames are ignored.
                    }
                    Some(Err(e)) => {
                        tracing::debug!(client_id = %id, error = %e, "Client socket error");
                        break;
                    }
                }
            }
        }
    }

    let _ = state.relay.client_disconnected(id).await;
    if !writer.is_finished() {
        writer.abort();
    }
}

fn going_away() -> CloseFrame {
    CloseFrame {
        code: close_code::AWAY,
        reason: "relay unavailable".into(),
    }
}
