//! kastty server: one shared terminal session served to WebSocket viewers.
//!
//! The server owns the [`SessionMultiplexer`] and the guarded listener.
//! Every accepted connection becomes a viewer; its task writes the Hello
//! frame and the replay snapshot first, then relays queued output and
//! applies inbound frames until the viewer or the session goes away.

use crate::config::Config;
use crate::security::{generate_token, mask_token};
use crate::session::{Attachment, ProcessSpawner, ProcessSpec, SessionMultiplexer, TitleWatcher};
use crate::transport::websocket::{
    self, ChannelViewer, Outbound, WebSocketConnection, WsStream, MAX_WS_FRAME_SIZE,
    VIEWER_QUEUE_DEPTH,
};
use futures_util::StreamExt;
use kastty_core::{
    decode_client, display_title, encode, ClientMessage, KasttyError, KasttyResult, ServerMessage,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Exit status reported when a shutdown signal ended the session.
pub const SIGNAL_EXIT_STATUS: i32 = 130;

/// How long to wait for the killed process to report its exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// How long connection tasks get to flush the Exit frame.
const FLUSH_GRACE: Duration = Duration::from_millis(500);

enum Stop {
    Exited(i32),
    Interrupted,
}

/// A bound, not yet running, kastty server.
pub struct KasttyServer {
    config: Config,
    token: String,
    local_addr: SocketAddr,
    connections: mpsc::Receiver<WebSocketConnection>,
    session: Arc<SessionMultiplexer>,
}

impl KasttyServer {
    /// Generate the access token, bind the listener and create the session.
    pub async fn bind(config: Config) -> KasttyResult<Self> {
        let token = generate_token();
        let bind_addr = SocketAddr::new(config.bind, config.port);
        let (local_addr, connections) = websocket::start_listener(bind_addr, token.clone()).await?;

        // The title watcher rides along as a viewer but never takes a client's slot.
        let max_viewers = config
            .max_viewers
            .map(|max| max + usize::from(config.log_titles));
        let session = Arc::new(SessionMultiplexer::new(config.replay_buffer_bytes, max_viewers));
        session.set_readonly(config.readonly);

        Ok(Self {
            config,
            token,
            local_addr,
            connections,
            session,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Viewer endpoint URL handed to the user, token included.
    pub fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}{}?t={}", self.local_addr.port(), websocket::WS_PATH, self.token)
    }

    /// Start the process and serve viewers until it exits or `shutdown` resolves.
    ///
    /// Returns the process's exit code, or [`SIGNAL_EXIT_STATUS`] when
    /// `shutdown` won.
    pub async fn run<F>(self, spawner: &dyn ProcessSpawner, shutdown: F) -> KasttyResult<i32>
    where
        F: Future<Output = ()>,
    {
        let ws_url = self.ws_url();
        let local_addr = self.local_addr();
        let Self {
            config,
            token,
            mut connections,
            session,
            ..
        } = self;

        println!("{ws_url}");
        info!(
            addr = %local_addr,
            url = %mask_token(&ws_url, &token),
            command = %config.command,
            readonly = session.is_readonly(),
            replay_buffer_bytes = config.replay_buffer_bytes,
            "kastty ready"
        );

        let title_watcher = if config.log_titles {
            let watcher = Arc::new(TitleWatcher::new());
            watcher.reset();
            let attachment = session.connect(watcher.clone())?;
            watcher.prime(&attachment.replay);
            Some(watcher)
        } else {
            None
        };

        let (exit_tx, mut exit_rx) = oneshot::channel();
        let on_exit_session = session.clone();
        session.on_exit(move |code| {
            on_exit_session.broadcast_control(&ServerMessage::Exit { code });
            let closed = on_exit_session.close_all();
            debug!(code, viewers = closed, "closed viewers after exit");
            let _ = exit_tx.send(code);
        });

        let spec = ProcessSpec::new(config.command.clone(), config.args.clone());
        session.start(spawner, &spec)?;

        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        let stop = loop {
            tokio::select! {
                code = &mut exit_rx => break Stop::Exited(code.unwrap_or(-1)),
                _ = &mut shutdown => break Stop::Interrupted,
                Some(conn) = connections.recv() => {
                    let session = session.clone();
                    tasks.spawn(async move {
                        let remote = conn.remote_addr;
                        if let Err(e) = handle_websocket(session, conn).await {
                            warn!(remote = %remote, error = %e, "WebSocket connection error");
                        }
                    });
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        };

        let code = match stop {
            Stop::Exited(code) => code,
            Stop::Interrupted => {
                info!(viewers = session.viewer_count(), "shutdown signal received, terminating session");
                session.destroy();
                if tokio::time::timeout(SHUTDOWN_GRACE, exit_rx).await.is_err() {
                    warn!("process did not exit after kill");
                    session.close_all();
                }
                SIGNAL_EXIT_STATUS
            }
        };

        let _ = tokio::time::timeout(FLUSH_GRACE, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if let Some(watcher) = title_watcher {
            info!(title = display_title(watcher.current().as_deref()), "last terminal title");
        }
        info!(code, "kastty stopped");
        Ok(code)
    }
}

/// Attach one connection to the session for its whole lifetime.
async fn handle_websocket(session: Arc<SessionMultiplexer>, conn: WebSocketConnection) -> KasttyResult<()> {
    let WebSocketConnection {
        mut ws_stream,
        remote_addr,
    } = conn;

    let (viewer, mut outbound_rx, shutdown) = ChannelViewer::new(VIEWER_QUEUE_DEPTH);
    let attachment = match session.connect(Arc::new(viewer)) {
        Ok(attachment) => attachment,
        Err(KasttyError::ViewerLimit(max)) => {
            info!(remote = %remote_addr, max, "viewer rejected: limit reached");
            let _ = ws_stream
                .close(Some(CloseFrame {
                    code: CloseCode::Policy,
                    reason: "Connection rejected".into(),
                }))
                .await;
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let id = attachment.id;
    info!(remote = %remote_addr, viewer = id, "viewer attached");
    let result = session_loop_ws(&session, &mut ws_stream, attachment, &mut outbound_rx, &shutdown).await;
    session.disconnect(id);
    result
}

/// Per-viewer message loop over WebSocket.
async fn session_loop_ws(
    session: &SessionMultiplexer,
    ws: &mut WsStream,
    attachment: Attachment,
    outbound_rx: &mut mpsc::Receiver<Outbound>,
    shutdown: &Notify,
) -> KasttyResult<()> {
    // Hello and snapshot go out before anything queued after the attach.
    let hello = encode(&ServerMessage::Hello {
        readonly: attachment.readonly,
    })?;
    websocket::ws_send_text(ws, hello).await?;
    if !attachment.replay.is_empty() {
        websocket::ws_send_binary(ws, &attachment.replay).await?;
    }

    loop {
        tokio::select! {
            biased;

            _ = shutdown.notified() => {
                while let Ok(frame) = outbound_rx.try_recv() {
                    send_outbound(ws, frame).await?;
                }
                debug!(viewer = attachment.id, "closing viewer connection");
                let _ = ws.close(None).await;
                break;
            }

            frame = outbound_rx.recv() => match frame {
                Some(frame) => send_outbound(ws, frame).await?,
                None => break,
            },

            msg = ws.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    if data.len() > MAX_WS_FRAME_SIZE {
                        warn!(viewer = attachment.id, bytes = data.len(), "dropping oversized input frame");
                        continue;
                    }
                    session.write(&data);
                }
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = handle_control(session, &text) {
                        websocket::ws_send_text(ws, encode(&reply)?).await?;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!(viewer = attachment.id, "WebSocket session ended (peer closed)");
                    break;
                }
                // Pings are answered by tungstenite itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(viewer = attachment.id, error = %e, "WebSocket session ended");
                    break;
                }
            },
        }
    }

    Ok(())
}

async fn send_outbound(ws: &mut WsStream, frame: Outbound) -> KasttyResult<()> {
    match frame {
        Outbound::Binary(data) => websocket::ws_send_binary(ws, &data).await,
        Outbound::Text(text) => websocket::ws_send_text(ws, text).await,
    }
}

/// Apply one inbound control message. Returns the reply owed to the sender, if any.
///
/// Messages that fail to decode are dropped.
fn handle_control(session: &SessionMultiplexer, text: &str) -> Option<ServerMessage> {
    match decode_client(text) {
        Ok(ClientMessage::Resize { cols, rows }) => {
            session.resize(cols, rows);
            None
        }
        Ok(ClientMessage::ReadonlyRequest { enabled }) => {
            session.set_readonly(enabled);
            None
        }
        Ok(ClientMessage::Ping { ts }) => Some(ServerMessage::Pong { ts }),
        Err(e) => {
            debug!(error = %e, "discarding control message");
            None
        }
    }
}
