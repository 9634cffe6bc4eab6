//! Job executor: runs one lip-sync job on its own task.
//!
//! # Pipeline
//!
//! ```text
//!  5  Preparing job                 ── checkpoint 1
//! 15  Saving input files            (scratch dir + staged inputs)
//! 25  Waiting for inference slot    (cancellable wait)
//!                                   ── checkpoint 2 (slot granted)
//! 40  Running lip-sync inference    (blocking pool, not cancellable)
//!                                   ── checkpoint 3
//! 80  Encoding output video
//! 100 Processing complete           → result
//! ```
//!
//! # Terminal decision
//!
//! A job can end three ways: the executor finishes (`result` / `error`) or the
//! session cancels it (`cancelled`).  Both sides go through [`JobControl`],
//! which holds the job state behind one async lock and sends job-scoped frames
//! while holding it.  Whichever side takes the lock first and makes a legal
//! transition wins; the other sees a terminal state and sends nothing.  That
//! gives exactly one terminal event per job, and no progress after it.

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use lipsync_core::protocol::{encode_video, DecodedInput};
use lipsync_core::{
    ErrorKind, JobEvent, JobFailure, JobId, JobState, ProgressTracker, ServerMessage, SessionId,
};

use super::registry::ActiveJobSlot;
use super::session::Outbox;
use crate::domain::Device;
use crate::infrastructure::inference::{GatewayError, InferenceGateway, InferenceRequest};

// ── Job control block ─────────────────────────────────────────────────────────

struct ControlState {
    state: JobState,
    progress: ProgressTracker,
    slot: Option<ActiveJobSlot>,
}

/// Shared between the executor task and the session's [`JobHandle`].
pub struct JobControl {
    job_id: JobId,
    session_id: SessionId,
    inner: Mutex<ControlState>,
    token: CancellationToken,
    outbox: Outbox,
}

impl JobControl {
    fn new(session_id: SessionId, job_id: JobId, outbox: Outbox, slot: ActiveJobSlot) -> Self {
        Self {
            job_id,
            session_id,
            inner: Mutex::new(ControlState {
                state: JobState::Pending,
                progress: ProgressTracker::new(),
                slot: Some(slot),
            }),
            token: CancellationToken::new(),
            outbox,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub async fn state(&self) -> JobState {
        self.inner.lock().await.state
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Pending → Running.  Returns `false` if the job was cancelled first.
    async fn start(&self) -> bool {
        self.inner.lock().await.state.apply(JobEvent::Start).is_ok()
    }

    /// Emits a progress frame while the job is Running.
    async fn progress(&self, percent: u8, phase: &str) {
        let mut inner = self.inner.lock().await;
        if inner.state != JobState::Running {
            return;
        }
        if let Some(accepted) = inner.progress.advance(percent, phase) {
            let msg = ServerMessage::progress(self.job_id, accepted, phase);
            if self.outbox.send(msg).await.is_err() {
                debug!("session {} job {}: progress dropped, peer gone", self.session_id, self.job_id);
            }
        }
    }

    /// Running → Succeeded/Failed and sends the terminal frame.
    ///
    /// Returns `false` (and sends nothing) if the job already ended.
    async fn finish(&self, outcome: Result<ServerMessage, JobFailure>) -> bool {
        let mut inner = self.inner.lock().await;
        let (event, msg) = match outcome {
            Ok(result) => (JobEvent::Succeed, result),
            Err(failure) => (
                JobEvent::Fail,
                ServerMessage::from_failure(&failure, Some(self.job_id)),
            ),
        };
        if inner.state.apply(event).is_err() {
            return false;
        }
        if let Some(mut slot) = inner.slot.take() {
            slot.release();
        }
        if self.outbox.send(msg).await.is_err() {
            debug!("session {} job {}: terminal frame dropped, peer gone", self.session_id, self.job_id);
        }
        true
    }

    /// Pending/Running → Cancelled.  Fires the token and, when `notify` is
    /// set, sends the `cancelled` frame.
    ///
    /// Returns `false` if the job already ended.
    pub async fn cancel(&self, notify: bool) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.state.apply(JobEvent::Cancel).is_err() {
            return false;
        }
        self.token.cancel();
        if let Some(mut slot) = inner.slot.take() {
            slot.release();
        }
        if notify && self.outbox.send(ServerMessage::cancelled(self.job_id)).await.is_err() {
            debug!("session {} job {}: cancel reply dropped, peer gone", self.session_id, self.job_id);
        }
        true
    }
}

// ── Job handle ────────────────────────────────────────────────────────────────

/// The session's view of a running job.
pub struct JobHandle {
    control: Arc<JobControl>,
    task: JoinHandle<()>,
}

impl JobHandle {
    pub fn job_id(&self) -> JobId {
        self.control.job_id()
    }

    pub async fn state(&self) -> JobState {
        self.control.state().await
    }

    pub async fn is_terminal(&self) -> bool {
        self.state().await.is_terminal()
    }

    /// Requests cancellation and replies `cancelled`.  Returns `false` when
    /// the job had already ended.
    pub async fn cancel(&self) -> bool {
        self.control.cancel(true).await
    }

    /// Requests cancellation without sending anything.  Used on disconnect.
    pub async fn cancel_silently(&self) -> bool {
        self.control.cancel(false).await
    }

    /// `true` once the executor task, including scratch cleanup, has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the executor task to exit.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!("job task ended abnormally: {e}");
        }
    }
}

// ── Executor ──────────────────────────────────────────────────────────────────

/// Spawns jobs against a shared inference gateway.
#[derive(Clone)]
pub struct JobExecutor {
    gateway: Arc<InferenceGateway>,
    work_dir: Arc<PathBuf>,
}

impl JobExecutor {
    pub fn new(gateway: Arc<InferenceGateway>, work_dir: PathBuf) -> Self {
        Self {
            gateway,
            work_dir: Arc::new(work_dir),
        }
    }

    pub fn gateway(&self) -> &Arc<InferenceGateway> {
        &self.gateway
    }

    /// Starts `input` as job `job_id` of `session_id` and returns at once.
    pub fn spawn(
        &self,
        session_id: SessionId,
        job_id: JobId,
        input: DecodedInput,
        outbox: Outbox,
        slot: ActiveJobSlot,
    ) -> JobHandle {
        let control = Arc::new(JobControl::new(session_id, job_id, outbox, slot));
        let job = Job {
            control: Arc::clone(&control),
            gateway: Arc::clone(&self.gateway),
            work_dir: Arc::clone(&self.work_dir),
            input,
        };

        let task = tokio::spawn(async move {
            let control = Arc::clone(&job.control);
            if AssertUnwindSafe(job.execute()).catch_unwind().await.is_err() {
                error!("session {session_id} job {job_id}: executor panicked");
                control
                    .finish(Err(JobFailure::internal("Unexpected error during processing")))
                    .await;
            }
        });

        JobHandle { control, task }
    }
}

struct Job {
    control: Arc<JobControl>,
    gateway: Arc<InferenceGateway>,
    work_dir: Arc<PathBuf>,
    input: DecodedInput,
}

impl Job {
    async fn execute(self) {
        let control = Arc::clone(&self.control);
        let (session_id, job_id) = (control.session_id, control.job_id);

        if !control.start().await {
            debug!("session {session_id} job {job_id}: cancelled before start");
            return;
        }
        let started = Instant::now();
        control.progress(5, "Preparing job").await;
        if control.is_cancelled() {
            return;
        }

        let scratch = match tempfile::Builder::new()
            .prefix(&format!("job-{session_id}-{job_id}-"))
            .tempdir_in(self.work_dir.as_path())
        {
            Ok(dir) => dir,
            Err(e) => {
                error!("session {session_id} job {job_id}: cannot create scratch dir: {e}");
                control
                    .finish(Err(JobFailure::internal(format!("Failed to prepare job: {e}"))))
                    .await;
                return;
            }
        };

        let outcome = self.run_pipeline(scratch.path(), started).await;

        // Removed when this task exits.  A cancelled job's `cancelled` frame
        // may already be out while the inference call still holds the dir.
        let scratch_path = scratch.path().to_path_buf();
        if let Err(e) = scratch.close() {
            warn!("session {session_id} job {job_id}: failed to remove {}: {e}", scratch_path.display());
        }

        match outcome {
            Ok(Some(result)) => {
                if control.finish(Ok(result)).await {
                    info!(
                        "session {session_id} job {job_id}: completed in {:.2}s",
                        started.elapsed().as_secs_f64()
                    );
                }
            }
            Ok(None) => debug!("session {session_id} job {job_id}: stopped at checkpoint after cancel"),
            Err(failure) => {
                warn!("session {session_id} job {job_id}: failed: {failure}");
                control.finish(Err(failure)).await;
            }
        }
    }

    /// Returns `Ok(None)` when a checkpoint observed cancellation.
    async fn run_pipeline(
        &self,
        scratch: &Path,
        started: Instant,
    ) -> Result<Option<ServerMessage>, JobFailure> {
        let control = &self.control;
        let options = &self.input.options;

        control.progress(15, "Saving input files").await;
        let image_path = scratch.join(format!("input_image.{}", options.image_format));
        let audio_path = scratch.join(format!("input_audio.{}", options.audio_format));
        let output_path = scratch.join("output.mp4");
        tokio::fs::write(&image_path, &self.input.image)
            .await
            .map_err(|e| JobFailure::internal(format!("Failed to save input image: {e}")))?;
        tokio::fs::write(&audio_path, &self.input.audio)
            .await
            .map_err(|e| JobFailure::internal(format!("Failed to save input audio: {e}")))?;

        control.progress(25, "Waiting for inference slot").await;
        let slot = match self.gateway.acquire(options.model_variant, &control.token).await {
            Ok(slot) => slot,
            Err(GatewayError::Cancelled) => return Ok(None),
            Err(e) => return Err(JobFailure::internal(format!("Inference unavailable: {e}"))),
        };
        if control.is_cancelled() {
            return Ok(None);
        }

        control.progress(40, "Running lip-sync inference").await;
        let request = InferenceRequest {
            image_path,
            audio_path,
            output_path,
            options: options.clone(),
            device: Device::Auto,
        };
        let video = slot
            .process(request)
            .await
            .map_err(|e| JobFailure::internal(format!("Lip-sync inference failed: {e}")))?;
        if control.is_cancelled() {
            return Ok(None);
        }
        if video.is_empty() {
            return Err(JobFailure::new(
                ErrorKind::EmptyOutput,
                "Inference produced an empty video",
            ));
        }

        control.progress(80, "Encoding output video").await;
        let video_size_bytes = video.len() as u64;
        let video_base64 = tokio::task::spawn_blocking(move || encode_video(&video))
            .await
            .map_err(|e| JobFailure::internal(format!("Failed to encode video: {e}")))?;

        control.progress(100, "Processing complete").await;
        Ok(Some(ServerMessage::Result {
            job_id: control.job_id,
            video_base64,
            video_size_bytes,
            processing_time: started.elapsed().as_secs_f64(),
            model_used: options.model_variant,
            timestamp: lipsync_core::protocol::now_timestamp(),
        }))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
