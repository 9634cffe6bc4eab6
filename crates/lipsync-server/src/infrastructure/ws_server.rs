//! WebSocket server: accept loop, handshake routing, and per-connection tasks.
//!
//! This module is responsible for:
//!
//! 1. Binding a TCP listener on the configured address.
//! 2. Upgrading each accepted connection to a WebSocket, routing on the
//!    request path while the handshake is in progress.
//! 3. Running one receive loop and one writer task per session connection.
//! 4. Answering health probes with a single `health` frame, or with a JSON
//!    body when `/ws/health` arrives as a plain HTTP `GET`.
//! 5. Stopping the accept loop when the `running` flag is cleared.
//!
//! # Routes
//!
//! | Path                   | Behaviour                                   |
//! |------------------------|---------------------------------------------|
//! | `/ws/lip-sync`, `/`    | Session protocol                            |
//! | `/ws/health`           | One `health` frame, then close              |
//! | `/ws/health` (no upgrade) | `200 OK` with the `health` JSON body     |
//! | anything else          | Handshake rejected with HTTP 404            |

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{accept_hdr_async_with_config, WebSocketStream};
use tracing::{debug, error, info, warn};

use lipsync_core::protocol::now_timestamp;
use lipsync_core::{encode_server_message, ServerMessage};

use crate::application::{JobExecutor, Outbox, Session, SessionRegistry};
use crate::domain::ServerConfig;
use crate::infrastructure::inference::InferenceGateway;

/// How often the accept loop wakes up to check the `running` flag.
const ACCEPT_POLL: Duration = Duration::from_millis(200);

/// Largest request head inspected before the handshake.
const REQUEST_HEAD_LIMIT: usize = 8 * 1024;

/// How long to wait for a complete request head before leaving it to the
/// WebSocket handshake.
const REQUEST_HEAD_TIMEOUT: Duration = Duration::from_secs(2);

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;

// ── Routing ───────────────────────────────────────────────────────────────────

/// What a connection is for, decided from the handshake request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Session,
    Health,
}

impl Route {
    /// Maps a request path to a route; `None` means 404.
    ///
    /// A trailing slash and a query string are ignored.
    pub fn from_path(path: &str) -> Option<Route> {
        let path = path.split('?').next().unwrap_or_default();
        match path.trim_end_matches('/') {
            "" | "/ws/lip-sync" => Some(Route::Session),
            "/ws/health" => Some(Route::Health),
            _ => None,
        }
    }
}

/// The parts of an HTTP request head needed before the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub path: String,
    /// `Upgrade: websocket` was present.
    pub upgrade: bool,
}

impl RequestHead {
    /// Parses a complete request head (terminated by an empty line).
    ///
    /// Returns `None` while the head is still incomplete or when the request
    /// line is not `METHOD PATH VERSION`.
    pub fn parse(bytes: &[u8]) -> Option<RequestHead> {
        let end = bytes.windows(4).position(|w| w == b"\r\n\r\n")?;
        let head = std::str::from_utf8(&bytes[..end]).ok()?;
        let mut lines = head.split("\r\n");

        let mut request_line = lines.next()?.split_whitespace();
        let _method = request_line.next()?;
        let path = request_line.next()?.to_string();
        request_line.next()?;

        let upgrade = lines.filter_map(|line| line.split_once(':')).any(|(name, value)| {
            name.trim().eq_ignore_ascii_case("upgrade")
                && value.to_ascii_lowercase().contains("websocket")
        });
        Some(RequestHead { path, upgrade })
    }

    /// `true` for a plain HTTP request to the health route.
    pub fn is_plain_health_check(&self) -> bool {
        !self.upgrade && Route::from_path(&self.path) == Some(Route::Health)
    }
}

/// Peeks at the request head without consuming it, so the WebSocket
/// handshake still sees the full request.
async fn peek_request_head(stream: &TcpStream) -> std::io::Result<Option<RequestHead>> {
    let mut buf = vec![0u8; REQUEST_HEAD_LIMIT];
    loop {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        if let Some(head) = RequestHead::parse(&buf[..n]) {
            return Ok(Some(head));
        }
        if n == buf.len() {
            return Ok(None);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ── Server ────────────────────────────────────────────────────────────────────

/// Shared state handed to every connection task.
#[derive(Clone)]
pub struct Server {
    config: Arc<ServerConfig>,
    registry: Arc<SessionRegistry>,
    executor: JobExecutor,
}

impl Server {
    pub fn new(config: ServerConfig, gateway: Arc<InferenceGateway>) -> Self {
        let executor = JobExecutor::new(gateway, config.work_dir.clone());
        Self {
            config: Arc::new(config),
            registry: Arc::new(SessionRegistry::new()),
            executor,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Accepts connections on `listener` until `running` is cleared.
    ///
    /// Creates the scratch work directory first.  Each accepted connection is
    /// handed off to its own task so one slow client never blocks others.
    ///
    /// # Errors
    ///
    /// Returns an error if the work directory cannot be created.
    pub async fn serve(&self, listener: TcpListener, running: Arc<AtomicBool>) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.config.work_dir)
            .await
            .with_context(|| {
                format!("failed to create work directory {}", self.config.work_dir.display())
            })?;

        if let Ok(addr) = listener.local_addr() {
            info!("lip-sync WebSocket server listening on {addr}");
        }

        loop {
            if !running.load(Ordering::Relaxed) {
                info!("shutdown flag set; stopping accept loop");
                break;
            }

            match timeout(ACCEPT_POLL, listener.accept()).await {
                Ok(Ok((stream, peer_addr))) => {
                    debug!("new connection from {peer_addr}");
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_connection(stream, peer_addr).await;
                    });
                }
                Ok(Err(e)) => {
                    // Transient (e.g. too many open files); keep serving.
                    error!("accept error: {e}");
                }
                Err(_) => {}
            }
        }

        Ok(())
    }

    /// Logs the outcome of [`Server::run_connection`].
    async fn handle_connection(self, stream: TcpStream, peer_addr: SocketAddr) {
        match self.run_connection(stream, peer_addr).await {
            Ok(()) => debug!("connection {peer_addr} closed normally"),
            Err(e) => warn!("connection {peer_addr} closed with error: {e:#}"),
        }
    }

    async fn run_connection(&self, stream: TcpStream, peer_addr: SocketAddr) -> anyhow::Result<()> {
        if let Ok(Ok(Some(head))) = timeout(REQUEST_HEAD_TIMEOUT, peek_request_head(&stream)).await {
            if head.is_plain_health_check() {
                debug!("plain HTTP health check from {peer_addr}");
                return self.send_health_http(stream).await;
            }
        }

        let mut route = Route::Session;
        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            match Route::from_path(req.uri().path()) {
                Some(r) => {
                    route = r;
                    Ok(resp)
                }
                None => {
                    debug!("rejecting handshake for unknown path {}", req.uri().path());
                    let mut err = ErrorResponse::new(Some("Not Found".to_string()));
                    *err.status_mut() = StatusCode::NOT_FOUND;
                    Err(err)
                }
            }
        };

        let ws_stream =
            accept_hdr_async_with_config(stream, callback, Some(self.ws_config()))
                .await
                .with_context(|| format!("WebSocket handshake failed with {peer_addr}"))?;

        match route {
            Route::Session => self.run_session(ws_stream, peer_addr).await,
            Route::Health => self.send_health(ws_stream).await,
        }
    }

    fn ws_config(&self) -> WebSocketConfig {
        let mut cfg = WebSocketConfig::default();
        cfg.max_message_size = Some(self.config.max_message_bytes);
        cfg.max_frame_size = Some(self.config.max_message_bytes);
        cfg
    }

    /// Runs the session protocol until the peer leaves.
    async fn run_session(
        &self,
        ws_stream: WebSocketStream<TcpStream>,
        peer_addr: SocketAddr,
    ) -> anyhow::Result<()> {
        let (ws_tx, mut ws_rx) = ws_stream.split();
        let (outbox, outbox_rx) = Outbox::channel(self.config.outbox_capacity);
        let writer = tokio::spawn(write_frames(ws_tx, outbox_rx));

        let mut session = match Session::connect(
            Arc::clone(&self.registry),
            self.executor.clone(),
            self.config.limits,
            outbox.clone(),
            Some(peer_addr),
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                writer.abort();
                return Err(e).context("failed to register session");
            }
        };
        let session_id = session.id();

        loop {
            let frame = tokio::select! {
                frame = ws_rx.next() => frame,
                _ = outbox.closed() => {
                    debug!("session {session_id}: writer gone");
                    break;
                }
            };

            let frame = match frame {
                Some(Ok(frame)) => frame,
                Some(Err(WsError::ConnectionClosed | WsError::Protocol(_))) | None => {
                    debug!("session {session_id}: stream ended");
                    break;
                }
                Some(Err(e)) => {
                    warn!("session {session_id}: WebSocket error: {e}");
                    break;
                }
            };

            let dispatched = match frame {
                WsMessage::Text(text) => session.on_message(&text).await,
                WsMessage::Binary(_) => session.on_binary().await,
                WsMessage::Close(_) => {
                    debug!("session {session_id}: close frame received");
                    break;
                }
                // Control frames are answered by tungstenite itself.
                WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => Ok(()),
            };
            if dispatched.is_err() {
                debug!("session {session_id}: outbox closed");
                break;
            }
        }

        session.on_disconnect().await;
        drop(outbox);
        drop(session);
        writer.abort();
        Ok(())
    }

    fn health_snapshot(&self) -> ServerMessage {
        let stats = self.registry.snapshot_stats();
        ServerMessage::Health {
            active_connections: stats.active_sessions,
            active_jobs: stats.active_jobs,
            gateway_ready: self.executor.gateway().is_ready(),
            timestamp: now_timestamp(),
        }
    }

    /// Answers a non-upgrade `GET /ws/health` with the snapshot as JSON.
    async fn send_health_http(&self, mut stream: TcpStream) -> anyhow::Result<()> {
        let body = encode_server_message(&self.health_snapshot())
            .context("failed to encode health body")?;
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream
            .write_all(response.as_bytes())
            .await
            .context("failed to write health response")?;
        stream.shutdown().await.ok();
        Ok(())
    }

    /// Sends one `health` snapshot and closes the connection.
    async fn send_health(&self, mut ws_stream: WebSocketStream<TcpStream>) -> anyhow::Result<()> {
        let text = encode_server_message(&self.health_snapshot())
            .context("failed to encode health frame")?;
        ws_stream
            .send(WsMessage::Text(text))
            .await
            .context("failed to send health frame")?;
        ws_stream.close(None).await.ok();
        Ok(())
    }
}

/// Binds `config.bind_addr` and serves until `running` is cleared.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound (e.g. the port is
/// already in use) or the work directory cannot be created.
pub async fn run_server(
    config: ServerConfig,
    gateway: Arc<InferenceGateway>,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind WebSocket listener on {}", config.bind_addr))?;
    Server::new(config, gateway).serve(listener, running).await
}

/// Drains the outbox into the socket; the only writer for a connection.
async fn write_frames(mut ws_tx: WsSink, mut rx: mpsc::Receiver<ServerMessage>) {
    while let Some(msg) = rx.recv().await {
        let text = match encode_server_message(&msg) {
            Ok(text) => text,
            Err(e) => {
                error!("failed to encode {} frame: {e}", msg.kind());
                continue;
            }
        };
        if let Err(e) = ws_tx.send(WsMessage::Text(text)).await {
            debug!("WebSocket send failed (peer disconnected): {e}");
            return;
        }
    }
    let _ = ws_tx.close().await;
}

// ── Tests ─────────────────────────────────────────────────────────────────────
