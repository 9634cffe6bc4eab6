//! Inference gateway: the boundary to the lip-sync model service.
//!
//! The neural pipeline (face detection, the Wav2Lip forward pass, muxing the
//! output video) lives outside this crate behind the [`InferenceBackend`]
//! trait.  Backends are synchronous and may take seconds to minutes per call,
//! so the gateway always runs them on Tokio's blocking pool.
//!
//! # Concurrency
//!
//! A single model instance is not safe to drive from two threads, and GPU
//! memory is finite.  [`InferenceGateway`] therefore holds a semaphore with
//! `max_concurrent` permits (default 1).  Jobs wait for a permit in FIFO
//! order; the wait is cancellable, the call itself is not.
//!
//! # Testability
//!
//! The trait allows tests to inject [`mock::MockBackend`] (scriptable output,
//! failures, delays, concurrency tracking) without Python or a GPU.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use lipsync_core::{JobOptions, ModelVariant};

use crate::domain::Device;

pub mod command;
pub mod mock;

pub use command::{CommandBackend, CommandTemplate};
pub use mock::MockBackend;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Failures reported by a backend.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// The external program could not be started.
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The external program is not on `PATH`.
    #[error("inference program '{0}' not found on PATH")]
    ProgramNotFound(String),

    /// The external program exited unsuccessfully.
    #[error("inference process failed ({status}): {stderr}")]
    ProcessFailed { status: String, stderr: String },

    /// The program reported success but wrote no output file.
    #[error("inference produced no output file at {0}")]
    MissingOutput(PathBuf),

    #[error("I/O error during inference: {0}")]
    Io(#[from] std::io::Error),

    /// Any other backend-specific failure.
    #[error("{0}")]
    Backend(String),
}

/// Failures reported by [`InferenceGateway::run`] and
/// [`InferenceGateway::warmup`].
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("inference service is not ready")]
    NotReady,

    #[error("model variant '{0}' is not available")]
    UnsupportedVariant(ModelVariant),

    /// The cancellation token fired while waiting for a slot.
    #[error("inference cancelled before it started")]
    Cancelled,

    #[error(transparent)]
    Inference(#[from] InferenceError),

    /// The blocking task running the backend panicked or was aborted.
    #[error("inference task failed: {0}")]
    Join(String),
}

// ── Backend contract ──────────────────────────────────────────────────────────

/// Everything a backend needs for one call.
///
/// The input files are already staged inside the job's scratch directory;
/// the backend writes the video to `output_path` or returns its bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceRequest {
    pub image_path: PathBuf,
    pub audio_path: PathBuf,
    pub output_path: PathBuf,
    pub options: JobOptions,
    /// Filled in by the gateway with its resolved device.
    pub device: Device,
}

/// The external lip-sync model service.
///
/// All methods block; the gateway calls them from the blocking pool.
#[cfg_attr(test, mockall::automock)]
pub trait InferenceBackend: Send + Sync {
    /// Loads weights and prepares `device`.  Called once before any
    /// `process` call.
    fn warmup(&self, device: Device) -> Result<(), InferenceError>;

    /// Produces the output video bytes for one request.
    fn process(&self, request: &InferenceRequest) -> Result<Vec<u8>, InferenceError>;

    /// Releases model resources.  Called once at shutdown.
    fn teardown(&self);
}

/// Picks a concrete device for `Device::Auto`: CUDA when the NVIDIA driver
/// tooling is visible on `PATH`, otherwise CPU.
pub fn resolve_device(requested: Device) -> Device {
    match requested {
        Device::Auto if which::which("nvidia-smi").is_ok() => Device::Cuda(None),
        Device::Auto => Device::Cpu,
        explicit => explicit,
    }
}

// ── Gateway ───────────────────────────────────────────────────────────────────

/// Shared, concurrency-bounded handle to the inference backends.
///
/// Built once in `main`, warmed up, and shared by `Arc` into every session.
pub struct InferenceGateway {
    backends: HashMap<ModelVariant, Arc<dyn InferenceBackend>>,
    slots: Arc<Semaphore>,
    max_concurrent: usize,
    device: Device,
    ready: AtomicBool,
    /// Serializes `warmup` and `shutdown` against each other.
    lifecycle: Mutex<()>,
}

impl InferenceGateway {
    /// Creates a gateway with no backends.
    ///
    /// `max_concurrent` is raised to 1 if zero.  `device` is resolved
    /// immediately, so `Auto` never reaches a backend.
    pub fn new(device: Device, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            backends: HashMap::new(),
            slots: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            device: resolve_device(device),
            ready: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
        }
    }

    /// Registers the backend serving `variant`, replacing any previous one.
    pub fn with_backend(mut self, variant: ModelVariant, backend: Arc<dyn InferenceBackend>) -> Self {
        self.backends.insert(variant, backend);
        self
    }

    /// Warms every backend on the blocking pool and marks the gateway ready.
    ///
    /// Idempotent: a second call on a ready gateway returns immediately.
    ///
    /// # Errors
    ///
    /// [`GatewayError::NotReady`] after `shutdown`, or the first backend
    /// failure.  The gateway stays not-ready on error.
    pub async fn warmup(&self) -> Result<(), GatewayError> {
        let _guard = self.lifecycle.lock().await;
        if self.is_ready() {
            return Ok(());
        }
        if self.slots.is_closed() {
            return Err(GatewayError::NotReady);
        }

        for variant in self.available_variants() {
            let Some(backend) = self.backends.get(&variant).cloned() else {
                continue;
            };
            let device = self.device;
            info!("warming up '{variant}' backend on {device}");
            tokio::task::spawn_blocking(move || backend.warmup(device))
                .await
                .map_err(|e| GatewayError::Join(e.to_string()))??;
        }

        self.ready.store(true, Ordering::Release);
        info!(
            "inference gateway ready: {} backend(s), {} slot(s), device {}",
            self.backends.len(),
            self.max_concurrent,
            self.device
        );
        Ok(())
    }

    /// Runs one inference call, waiting for a free slot first.
    ///
    /// The `cancel` token is observed while waiting for the slot and once more
    /// after the slot is granted.  Once the backend call starts it runs to
    /// completion and its result is returned even if `cancel` fires meanwhile.
    pub async fn run(
        &self,
        request: InferenceRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, GatewayError> {
        let slot = self.acquire(request.options.model_variant, cancel).await?;
        if cancel.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }
        slot.process(request).await
    }

    /// Waits for a free slot for `variant`.
    ///
    /// Callers that need to act between "slot granted" and "call started"
    /// (emit progress, re-check cancellation) use this instead of
    /// [`InferenceGateway::run`].  Dropping the slot frees it.
    pub async fn acquire(
        &self,
        variant: ModelVariant,
        cancel: &CancellationToken,
    ) -> Result<InferenceSlot, GatewayError> {
        if !self.is_ready() {
            return Err(GatewayError::NotReady);
        }
        let backend = self
            .backends
            .get(&variant)
            .cloned()
            .ok_or(GatewayError::UnsupportedVariant(variant))?;

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            permit = Arc::clone(&self.slots).acquire_owned() => {
                permit.map_err(|_| GatewayError::NotReady)?
            }
        };

        debug!(
            "inference slot granted ({} of {} in use)",
            self.max_concurrent - self.slots.available_permits(),
            self.max_concurrent
        );
        Ok(InferenceSlot {
            backend,
            device: self.device,
            permit,
        })
    }

    /// Stops admitting work and tears every backend down.
    ///
    /// Jobs still waiting for a slot fail with [`GatewayError::NotReady`].
    /// Calls already running are not interrupted.
    pub async fn shutdown(&self) {
        let _guard = self.lifecycle.lock().await;
        self.ready.store(false, Ordering::Release);
        if self.slots.is_closed() {
            return;
        }
        self.slots.close();

        for (variant, backend) in &self.backends {
            let backend = Arc::clone(backend);
            if let Err(e) = tokio::task::spawn_blocking(move || backend.teardown()).await {
                warn!("teardown of '{variant}' backend failed: {e}");
            }
        }
        info!("inference gateway shut down");
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Variants with a registered backend, in stable order.
    pub fn available_variants(&self) -> Vec<ModelVariant> {
        ModelVariant::ALL
            .into_iter()
            .filter(|v| self.backends.contains_key(v))
            .collect()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn device(&self) -> Device {
        self.device
    }
}

/// A granted inference slot bound to one backend.
///
/// Holds one semaphore permit; the permit is released when the slot is
/// dropped or when the backend call it was moved into returns.
pub struct InferenceSlot {
    backend: Arc<dyn InferenceBackend>,
    device: Device,
    permit: OwnedSemaphorePermit,
}

impl InferenceSlot {
    /// Runs the backend on the blocking pool.  Not cancellable.
    pub async fn process(self, mut request: InferenceRequest) -> Result<Vec<u8>, GatewayError> {
        let InferenceSlot {
            backend,
            device,
            permit,
        } = self;
        request.device = device;

        let output = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            backend.process(&request)
        })
        .await
        .map_err(|e| GatewayError::Join(e.to_string()))??;

        Ok(output)
    }
}

impl std::fmt::Debug for InferenceGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceGateway")
            .field("variants", &self.available_variants())
            .field("max_concurrent", &self.max_concurrent)
            .field("device", &self.device)
            .field("ready", &self.is_ready())
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request(variant: ModelVariant) -> InferenceRequest {
        InferenceRequest {
            image_path: PathBuf::from("face.jpg"),
            audio_path: PathBuf::from("speech.wav"),
            output_path: PathBuf::from("out.mp4"),
            options: JobOptions {
                model_variant: variant,
                ..JobOptions::default()
            },
            device: Device::Auto,
        }
    }

    fn gateway_with(backend: MockInferenceBackend) -> InferenceGateway {
        InferenceGateway::new(Device::Cpu, 1).with_backend(ModelVariant::Fast, Arc::new(backend))
    }

    #[tokio::test]
    async fn test_run_before_warmup_is_not_ready() {
        // Arrange
        let mut backend = MockInferenceBackend::new();
        backend.expect_process().never();
        let gateway = gateway_with(backend);

        // Act
        let result = gateway.run(request(ModelVariant::Fast), &CancellationToken::new()).await;

        // Assert
        assert!(matches!(result, Err(GatewayError::NotReady)));
    }

    #[tokio::test]
    async fn test_warmup_is_idempotent() {
        // Arrange: warmup must reach the backend exactly once.
        let mut backend = MockInferenceBackend::new();
        backend
            .expect_warmup()
            .withf(|device| *device == Device::Cpu)
            .times(1)
            .returning(|_| Ok(()));
        let gateway = gateway_with(backend);

        // Act
        gateway.warmup().await.unwrap();
        gateway.warmup().await.unwrap();

        // Assert
        assert!(gateway.is_ready());
    }

    #[tokio::test]
    async fn test_failed_warmup_leaves_gateway_not_ready() {
        let mut backend = MockInferenceBackend::new();
        backend
            .expect_warmup()
            .returning(|_| Err(InferenceError::Backend("weights missing".into())));
        let gateway = gateway_with(backend);

        let result = gateway.warmup().await;

        assert!(matches!(result, Err(GatewayError::Inference(_))));
        assert!(!gateway.is_ready());
    }

    #[tokio::test]
    async fn test_run_passes_resolved_device_to_backend() {
        // Arrange
        let mut backend = MockInferenceBackend::new();
        backend.expect_warmup().returning(|_| Ok(()));
        backend
            .expect_process()
            .withf(|req| req.device == Device::Cpu && req.output_path == PathBuf::from("out.mp4"))
            .times(1)
            .returning(|_| Ok(b"video".to_vec()));
        let gateway = gateway_with(backend);
        gateway.warmup().await.unwrap();

        // Act
        let bytes = gateway
            .run(request(ModelVariant::Fast), &CancellationToken::new())
            .await
            .unwrap();

        // Assert
        assert_eq!(bytes, b"video");
    }

    #[tokio::test]
    async fn test_run_rejects_variant_without_backend() {
        let mut backend = MockInferenceBackend::new();
        backend.expect_warmup().returning(|_| Ok(()));
        let gateway = gateway_with(backend);
        gateway.warmup().await.unwrap();

        let result = gateway
            .run(request(ModelVariant::HighQuality), &CancellationToken::new())
            .await;

        assert!(matches!(
            result,
            Err(GatewayError::UnsupportedVariant(ModelVariant::HighQuality))
        ));
    }

    #[tokio::test]
    async fn test_backend_error_is_surfaced() {
        let mut backend = MockInferenceBackend::new();
        backend.expect_warmup().returning(|_| Ok(()));
        backend.expect_process().returning(|_| {
            Err(InferenceError::ProcessFailed {
                status: "exit status: 1".into(),
                stderr: "no face detected".into(),
            })
        });
        let gateway = gateway_with(backend);
        gateway.warmup().await.unwrap();

        let err = gateway
            .run(request(ModelVariant::Fast), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("no face detected"));
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_slot() {
        // Arrange: a slow backend holds the only slot.
        let slow = Arc::new(MockBackend::new(b"v".to_vec()).with_delay(Duration::from_millis(300)));
        let gateway = Arc::new(
            InferenceGateway::new(Device::Cpu, 1).with_backend(ModelVariant::Fast, slow.clone()),
        );
        gateway.warmup().await.unwrap();

        let holder = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move {
                gateway.run(request(ModelVariant::Fast), &CancellationToken::new()).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Act
        let token = CancellationToken::new();
        let waiter = {
            let gateway = Arc::clone(&gateway);
            let token = token.clone();
            tokio::spawn(async move { gateway.run(request(ModelVariant::Fast), &token).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        // Assert
        assert!(matches!(waiter.await.unwrap(), Err(GatewayError::Cancelled)));
        // The holder's paths are not staged, so only the call count matters.
        let _ = holder.await.unwrap();
        assert_eq!(slow.calls(), 1, "cancelled waiter must never reach the backend");
    }

    #[tokio::test]
    async fn test_shutdown_tears_down_and_blocks_new_runs() {
        // Arrange
        let mut backend = MockInferenceBackend::new();
        backend.expect_warmup().returning(|_| Ok(()));
        backend.expect_teardown().times(1).return_const(());
        backend.expect_process().never();
        let gateway = gateway_with(backend);
        gateway.warmup().await.unwrap();

        // Act
        gateway.shutdown().await;
        gateway.shutdown().await;

        // Assert
        assert!(!gateway.is_ready());
        assert!(matches!(gateway.warmup().await, Err(GatewayError::NotReady)));
        assert!(matches!(
            gateway.run(request(ModelVariant::Fast), &CancellationToken::new()).await,
            Err(GatewayError::NotReady)
        ));
    }

    #[test]
    fn test_explicit_device_is_not_resolved_away() {
        assert_eq!(resolve_device(Device::Cuda(Some(1))), Device::Cuda(Some(1)));
        assert_eq!(resolve_device(Device::Cpu), Device::Cpu);
        assert_ne!(resolve_device(Device::Auto), Device::Auto);
    }

    #[test]
    fn test_available_variants_in_stable_order() {
        let gateway = InferenceGateway::new(Device::Cpu, 0)
            .with_backend(ModelVariant::HighQuality, Arc::new(MockBackend::new(vec![1])))
            .with_backend(ModelVariant::Fast, Arc::new(MockBackend::new(vec![1])));
        assert_eq!(gateway.available_variants(), vec![ModelVariant::Fast, ModelVariant::HighQuality]);
        assert_eq!(gateway.max_concurrent(), 1, "zero slots is raised to one");
    }
}
