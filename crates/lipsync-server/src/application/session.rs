//! Per-connection session: message dispatch and the outbound queue.
//!
//! A [`Session`] is created after the WebSocket handshake and lives for the
//! duration of the connection.  It owns at most one job at a time; a second
//! `process` while a job is still running is rejected, never queued.
//!
//! # Outbox
//!
//! Every frame sent to the client (connection ack, replies, and everything
//! the job executor emits) goes through one bounded [`Outbox`].  A single
//! writer task drains it into the socket, so frames are never interleaved
//! and per-session order is enqueue order.  A failed send means the writer
//! is gone, i.e. the peer disconnected.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use lipsync_core::protocol::{
    validate_process, DecodedInput, JobCounter, PayloadLimits, ProcessRequest,
};
use lipsync_core::{
    decode_client_message, ClientMessage, ErrorKind, JobFailure, JobId, ServerMessage, SessionId,
};

use super::executor::{JobExecutor, JobHandle};
use super::registry::{RegistryError, SessionInfo, SessionRegistry};

// ── Outbox ────────────────────────────────────────────────────────────────────

/// The writer task has exited; the peer is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("session outbox closed")]
pub struct OutboxClosed;

/// Cloneable handle to a session's outbound queue.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<ServerMessage>,
}

impl Outbox {
    /// Creates an outbox and the receiver the writer task drains.
    pub fn channel(capacity: usize) -> (Outbox, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Outbox { tx }, rx)
    }

    /// Queues `msg`, waiting while the queue is full.
    pub async fn send(&self, msg: ServerMessage) -> Result<(), OutboxClosed> {
        self.tx.send(msg).await.map_err(|_| OutboxClosed)
    }

    /// Resolves once the receiving side has been dropped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Validates a `process` request and decodes its payloads on the blocking
/// pool; base64 bodies can run to tens of megabytes.
async fn decode_request(
    request: ProcessRequest,
    limits: PayloadLimits,
) -> Result<DecodedInput, JobFailure> {
    tokio::task::spawn_blocking(move || validate_process(request, &limits))
        .await
        .unwrap_or_else(|e| Err(JobFailure::internal(format!("payload decoding failed: {e}"))))
}

// ── Session ───────────────────────────────────────────────────────────────────

/// Server-side state of one client connection.
pub struct Session {
    id: SessionId,
    peer: Option<SocketAddr>,
    created_at: DateTime<Utc>,
    outbox: Outbox,
    registry: Arc<SessionRegistry>,
    executor: JobExecutor,
    limits: PayloadLimits,
    jobs: JobCounter,
    current_job: Option<JobHandle>,
    disconnected: bool,
}

impl Session {
    /// Allocates an id, registers the session, and queues the `connection`
    /// acknowledgment.
    ///
    /// # Errors
    ///
    /// [`RegistryError::DuplicateSession`] on an id collision; the caller
    /// must drop the connection.
    pub async fn connect(
        registry: Arc<SessionRegistry>,
        executor: JobExecutor,
        limits: PayloadLimits,
        outbox: Outbox,
        peer: Option<SocketAddr>,
    ) -> Result<Session, RegistryError> {
        let id = SessionId::new_v4();
        let created_at = Utc::now();
        registry
            .register(SessionInfo {
                id,
                peer,
                created_at,
            })
            .await?;

        let session = Session {
            id,
            peer,
            created_at,
            outbox,
            registry,
            executor,
            limits,
            jobs: JobCounter::new(),
            current_job: None,
            disconnected: false,
        };

        let models = session.executor.gateway().available_variants();
        // A closed outbox here is noticed by the receive loop.
        let _ = session.send(ServerMessage::connection(id, models)).await;
        info!(
            "session {id} connected (peer {})",
            peer.map(|p| p.to_string()).unwrap_or_else(|| "unknown".into())
        );
        Ok(session)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn current_job_id(&self) -> Option<JobId> {
        self.current_job.as_ref().map(JobHandle::job_id)
    }

    async fn send(&self, msg: ServerMessage) -> Result<(), OutboxClosed> {
        self.outbox.send(msg).await
    }

    /// Handles one inbound text frame.
    ///
    /// # Errors
    ///
    /// [`OutboxClosed`] when a reply could not be queued; the connection is
    /// over and the caller should run [`Session::on_disconnect`].
    pub async fn on_message(&mut self, text: &str) -> Result<(), OutboxClosed> {
        let msg = match decode_client_message(text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("session {}: rejected frame: {e}", self.id);
                return self.send(ServerMessage::error(e.kind(), e.to_string(), None)).await;
            }
        };

        match msg {
            ClientMessage::Ping => self.send(ServerMessage::pong()).await,
            ClientMessage::Cancel => self.on_cancel().await,
            ClientMessage::Process(request) => {
                if self.has_active_job().await {
                    return self
                        .send(ServerMessage::error(
                            ErrorKind::AlreadyProcessing,
                            "Already processing a request. Wait for it to finish or cancel it.",
                            None,
                        ))
                        .await;
                }

                let input = match decode_request(request, self.limits).await {
                    Ok(input) => input,
                    Err(failure) => {
                        debug!("session {}: validation failed: {failure}", self.id);
                        return self.send(ServerMessage::from_failure(&failure, None)).await;
                    }
                };

                let job_id = self.jobs.next();
                info!(
                    "session {} job {job_id}: accepted ({} image bytes, {} audio bytes, model {})",
                    self.id,
                    input.image.len(),
                    input.audio.len(),
                    input.options.model_variant
                );
                let slot = self.registry.begin_job();
                let handle = self
                    .executor
                    .spawn(self.id, job_id, input, self.outbox.clone(), slot);
                self.current_job = Some(handle);
                Ok(())
            }
        }
    }

    /// Binary frames carry no envelopes.
    pub async fn on_binary(&mut self) -> Result<(), OutboxClosed> {
        self.send(ServerMessage::error(
            ErrorKind::ProtocolError,
            "Binary frames are not supported; send JSON text frames",
            None,
        ))
        .await
    }

    async fn on_cancel(&self) -> Result<(), OutboxClosed> {
        if let Some(job) = &self.current_job {
            // The `cancelled` reply is sent by the job control block.
            if job.cancel().await {
                info!("session {} job {}: cancelled by client", self.id, job.job_id());
                return Ok(());
            }
        }
        self.send(ServerMessage::info("No active processing to cancel"))
            .await
    }

    async fn has_active_job(&self) -> bool {
        match &self.current_job {
            Some(job) => !job.is_terminal().await,
            None => false,
        }
    }

    /// Tears the session down: cancels the job silently and unregisters.
    /// Safe to call more than once.
    pub async fn on_disconnect(&mut self) {
        if self.disconnected {
            return;
        }
        self.disconnected = true;

        if let Some(job) = self.current_job.take() {
            if job.cancel_silently().await {
                info!("session {} job {}: cancelled on disconnect", self.id, job.job_id());
            }
        }
        if !self.registry.unregister(self.id).await {
            warn!("session {} was not registered at disconnect", self.id);
        }
        info!("session {} disconnected", self.id);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
