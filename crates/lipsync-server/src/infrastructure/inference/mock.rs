//! Scriptable in-process backend for tests.
//!
//! Lets tests drive the whole session pipeline without Python or a GPU:
//! fixed output bytes, injected failures, an artificial delay, plus counters
//! for how many calls ran and how many ran at the same time.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{InferenceBackend, InferenceError, InferenceRequest};
use crate::domain::Device;

/// A mock implementation of [`InferenceBackend`].
pub struct MockBackend {
    output: Vec<u8>,
    failure: Option<String>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    warmed_up_on: Mutex<Option<Device>>,
    torn_down: AtomicBool,
    requests: Mutex<Vec<InferenceRequest>>,
}

impl MockBackend {
    /// Creates a backend that returns `output` from every call.
    pub fn new(output: Vec<u8>) -> Self {
        Self {
            output,
            failure: None,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            warmed_up_on: Mutex::new(None),
            torn_down: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Makes every call fail with `message`.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    /// Makes every call block for `delay` before returning.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of `process` calls that started.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of `process` calls observed running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn warmed_up_on(&self) -> Option<Device> {
        *self.warmed_up_on.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    /// Every request seen so far, in call order.
    pub fn requests(&self) -> Vec<InferenceRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl InferenceBackend for MockBackend {
    fn warmup(&self, device: Device) -> Result<(), InferenceError> {
        *self.warmed_up_on.lock().unwrap_or_else(|e| e.into_inner()) = Some(device);
        Ok(())
    }

    fn process(&self, request: &InferenceRequest) -> Result<Vec<u8>, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        // Inputs must still be staged while the call runs.
        let staged = request.image_path.exists() && request.audio_path.exists();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(message) = &self.failure {
            return Err(InferenceError::Backend(message.clone()));
        }
        if !staged {
            return Err(InferenceError::Backend("input files were not staged".to_string()));
        }
        Ok(self.output.clone())
    }

    fn teardown(&self) {
        self.torn_down.store(true, Ordering::SeqCst);
    }
}
