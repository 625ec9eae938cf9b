//! WebSocket listener using tokio-tungstenite.
//!
//! Handshakes are checked against the [`ConnectionGuard`] before the
//! upgrade completes; only authorized `/ws` requests reach the session.
//! Each connection gets a [`ChannelViewer`] whose bounded queue is drained
//! by the connection task.

use crate::security::ConnectionGuard;
use crate::session::{Viewer, ViewerError};
use futures_util::SinkExt;
use kastty_core::{encode, KasttyError, KasttyResult, ServerMessage};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Frames a viewer may have queued before it counts as lagging.
pub const VIEWER_QUEUE_DEPTH: usize = 256;

/// Maximum inbound frame size (1 MiB).
pub const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// Path of the viewer endpoint.
pub const WS_PATH: &str = "/ws";

pub type WsStream = tokio_tungstenite::WebSocketStream<TcpStream>;

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WsStream,
    pub remote_addr: SocketAddr,
}

/// Bind the listener and start accepting guarded WebSocket connections.
///
/// Returns the bound address (useful when the port was 0) and a receiver
/// that yields connections which passed the handshake checks.
pub async fn start_listener(
    bind_addr: SocketAddr,
    token: String,
) -> KasttyResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| KasttyError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener
        .local_addr()
        .map_err(|e| KasttyError::Transport(format!("WS local address unavailable: {e}")))?;

    let guard = Arc::new(ConnectionGuard::new(local_addr.port(), token));
    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    let guard = guard.clone();
                    tokio::spawn(async move {
                        let check = move |request: &Request, response: Response| {
                            check_handshake(&guard, request, response)
                        };
                        match tokio_tungstenite::accept_hdr_async(stream, check).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    debug!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                debug!(remote = %addr, error = %e, "WebSocket handshake rejected");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok((local_addr, rx))
}

fn check_handshake(
    guard: &ConnectionGuard,
    request: &Request,
    response: Response,
) -> Result<Response, ErrorResponse> {
    if request.uri().path() != WS_PATH {
        return Err(reject(StatusCode::NOT_FOUND, "Not Found"));
    }
    if !guard.is_authorized(request) {
        return Err(reject(StatusCode::FORBIDDEN, "Forbidden"));
    }
    Ok(response)
}

fn reject(status: StatusCode, body: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(body.to_string()));
    *response.status_mut() = status;
    response
}

/// Helper: send a binary message over a WebSocket.
pub async fn ws_send_binary(ws: &mut WsStream, data: &[u8]) -> KasttyResult<()> {
    ws.send(Message::Binary(data.to_vec().into()))
        .await
        .map_err(|e| KasttyError::Transport(format!("WS send failed: {e}")))
}

/// Helper: send a text message over a WebSocket.
pub async fn ws_send_text(ws: &mut WsStream, text: String) -> KasttyResult<()> {
    ws.send(Message::Text(text.into()))
        .await
        .map_err(|e| KasttyError::Transport(format!("WS send failed: {e}")))
}

/// A frame queued for a viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Terminal output.
    Binary(Vec<u8>),
    /// Encoded control message.
    Text(String),
}

/// Session-side end of a connection: pushes frames into the connection's
/// bounded queue without ever waiting.
pub struct ChannelViewer {
    tx: mpsc::Sender<Outbound>,
    shutdown: Arc<Notify>,
}

impl ChannelViewer {
    /// Returns the viewer, the queue the connection task drains, and the
    /// notifier it waits on for [`Viewer::close`].
    pub fn new(depth: usize) -> (Self, mpsc::Receiver<Outbound>, Arc<Notify>) {
        let (tx, rx) = mpsc::channel(depth);
        let shutdown = Arc::new(Notify::new());
        let viewer = Self {
            tx,
            shutdown: shutdown.clone(),
        };
        (viewer, rx, shutdown)
    }

    fn push(&self, frame: Outbound) -> Result<(), ViewerError> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ViewerError::Lagging,
            mpsc::error::TrySendError::Closed(_) => ViewerError::Closed,
        })
    }
}

impl Viewer for ChannelViewer {
    fn send(&self, data: &[u8]) -> Result<(), ViewerError> {
        self.push(Outbound::Binary(data.to_vec()))
    }

    fn send_control(&self, message: &ServerMessage) -> Result<(), ViewerError> {
        match encode(message) {
            Ok(text) => self.push(Outbound::Text(text)),
            Err(e) => {
                warn!(error = %e, kind = message.kind(), "failed to encode control message");
                Ok(())
            }
        }
    }

    fn close(&self) {
        // notify_one stores a permit, so a close issued before the task
        // starts waiting is not lost.
        self.shutdown.notify_one();
    }
}
