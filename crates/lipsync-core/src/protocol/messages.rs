//! JSON envelopes exchanged over the lip-sync WebSocket.
//!
//! # Message flow
//!
//! ```text
//! Client → Server:  JSON text frame  →  ClientMessage
//! Server → Client:  ServerMessage    →  JSON text frame
//! ```
//!
//! # JSON discriminant
//!
//! Every envelope is a JSON object with a `"type"` field naming the variant;
//! the remaining fields sit in the same object:
//!
//! ```json
//! {"type":"progress","job_id":1,"progress":40,"message":"Running lip-sync inference","timestamp":1718000000.5}
//! ```
//!
//! The two directions use distinct enums so a server-only envelope can never
//! be sent by the client and vice versa.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::domain::error::{ErrorKind, JobFailure};
use crate::domain::job::JobId;
use crate::domain::options::{sanitize_extension, FacePadding, JobOptions, ModelVariant};
use crate::domain::SessionId;

/// Input format advertised in the `connection` acknowledgment.
pub const INPUT_FORMAT: &str = "base64_audio_image";
/// Output format advertised in the `connection` acknowledgment.
pub const OUTPUT_FORMAT: &str = "base64_video";
/// Client message kinds the server understands, in advertisement order.
pub const CAPABILITIES: [&str; 3] = ["process", "ping", "cancel"];

/// Current wall-clock time as float seconds since the Unix epoch.
pub fn now_timestamp() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

// ── Client → Server messages ──────────────────────────────────────────────────

/// All envelopes a client can send.
///
/// # Serde representation
///
/// ```json
/// {"type":"process","audio_base64":"...","image_base64":"...","options":{"model_type":"fast"}}
/// {"type":"ping"}
/// {"type":"cancel"}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Submit one image + audio pair for lip-sync.
    Process(ProcessRequest),
    /// Liveness probe; answered with `pong` even while a job runs.
    Ping,
    /// Request cancellation of the session's in-flight job.
    Cancel,
}

impl ClientMessage {
    /// Wire names of every client message kind.
    pub const KINDS: [&'static str; 3] = CAPABILITIES;
}

/// Body of a `process` envelope.
///
/// Both payload fields default to the empty string so a missing field is
/// reported the same way as an empty one (a `ValidationError`), not as a
/// malformed envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessRequest {
    #[serde(default)]
    pub audio_base64: String,
    #[serde(default)]
    pub image_base64: String,
    #[serde(default)]
    pub options: WireOptions,
}

/// The `options` object exactly as it appears on the wire.
///
/// Every field is optional; unknown fields are ignored.  Turn it into
/// validated [`JobOptions`] with [`WireOptions::into_job_options`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_format: Option<String>,
    /// `[top, bottom, left, right]` in pixels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pads: Option<[u32; 4]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resize_factor: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nosmooth: Option<bool>,
}

impl WireOptions {
    /// Applies defaults and range checks.
    ///
    /// # Errors
    ///
    /// A `ValidationError` failure for an unknown model name or a zero
    /// `resize_factor`.
    pub fn into_job_options(self) -> Result<JobOptions, JobFailure> {
        let defaults = JobOptions::default();

        let model_variant = match self.model_type.as_deref() {
            None => defaults.model_variant,
            Some(name) => name
                .parse::<ModelVariant>()
                .map_err(|e| JobFailure::validation(format!("Invalid options: {e}")))?,
        };

        let resize_factor = self.resize_factor.unwrap_or(defaults.resize_factor);
        if resize_factor == 0 {
            return Err(JobFailure::validation(
                "Invalid options: resize_factor must be at least 1",
            ));
        }

        Ok(JobOptions {
            model_variant,
            audio_format: self
                .audio_format
                .map(|f| sanitize_extension(&f, &defaults.audio_format))
                .unwrap_or(defaults.audio_format),
            image_format: self
                .image_format
                .map(|f| sanitize_extension(&f, &defaults.image_format))
                .unwrap_or(defaults.image_format),
            face_padding: self
                .pads
                .map(FacePadding::from_array)
                .unwrap_or(defaults.face_padding),
            resize_factor,
            disable_temporal_smoothing: self.nosmooth.unwrap_or(false),
        })
    }
}

// ── Server → Client messages ──────────────────────────────────────────────────

/// `supported_formats` object of the `connection` acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportedFormats {
    pub input: String,
    pub output: String,
}

impl Default for SupportedFormats {
    fn default() -> Self {
        Self {
            input: INPUT_FORMAT.to_string(),
            output: OUTPUT_FORMAT.to_string(),
        }
    }
}

/// All envelopes the server can send.
///
/// # Serde representation
///
/// ```json
/// {"type":"connection","client_id":"…","message":"…","supported_formats":{"input":"base64_audio_image","output":"base64_video"},"capabilities":["process","ping","cancel"],"models":["fast","high_quality"]}
/// {"type":"error","error_type":"AlreadyProcessing","message":"…","timestamp":1718000000.0}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Sent once, immediately after the handshake.
    Connection {
        client_id: SessionId,
        message: String,
        supported_formats: SupportedFormats,
        capabilities: Vec<String>,
        models: Vec<ModelVariant>,
    },

    /// Phase update for the in-flight job.  `progress` never decreases.
    Progress {
        job_id: JobId,
        progress: u8,
        message: String,
        timestamp: f64,
    },

    /// Terminal event of a successful job.
    Result {
        job_id: JobId,
        video_base64: String,
        video_size_bytes: u64,
        /// Wall-clock seconds from job start to result.
        processing_time: f64,
        model_used: ModelVariant,
        timestamp: f64,
    },

    /// Either a synchronous rejection (no `job_id`) or the terminal event of
    /// a failed job.
    Error {
        error_type: ErrorKind,
        message: String,
        timestamp: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<JobId>,
    },

    /// Terminal event of a cancelled job.
    Cancelled {
        job_id: JobId,
        message: String,
        timestamp: f64,
    },

    Pong {
        timestamp: f64,
    },

    /// Informational reply that changes nothing, e.g. cancel while idle.
    Info {
        message: String,
        timestamp: f64,
    },

    /// Service snapshot sent on the health side channel.
    Health {
        active_connections: usize,
        active_jobs: usize,
        gateway_ready: bool,
        timestamp: f64,
    },
}

impl ServerMessage {
    pub fn connection(client_id: SessionId, models: Vec<ModelVariant>) -> Self {
        ServerMessage::Connection {
            client_id,
            message: "Connected to lip-sync service".to_string(),
            supported_formats: SupportedFormats::default(),
            capabilities: CAPABILITIES.iter().map(|c| c.to_string()).collect(),
            models,
        }
    }

    pub fn progress(job_id: JobId, progress: u8, message: impl Into<String>) -> Self {
        ServerMessage::Progress {
            job_id,
            progress,
            message: message.into(),
            timestamp: now_timestamp(),
        }
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>, job_id: Option<JobId>) -> Self {
        ServerMessage::Error {
            error_type: kind,
            message: message.into(),
            timestamp: now_timestamp(),
            job_id,
        }
    }

    /// Converts a classified failure into an `error` envelope.
    pub fn from_failure(failure: &JobFailure, job_id: Option<JobId>) -> Self {
        Self::error(failure.kind, failure.message.clone(), job_id)
    }

    pub fn cancelled(job_id: JobId) -> Self {
        ServerMessage::Cancelled {
            job_id,
            message: "Processing cancelled".to_string(),
            timestamp: now_timestamp(),
        }
    }

    pub fn pong() -> Self {
        ServerMessage::Pong {
            timestamp: now_timestamp(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        ServerMessage::Info {
            message: message.into(),
            timestamp: now_timestamp(),
        }
    }

    /// Wire name of this envelope's `type`.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Connection { .. } => "connection",
            ServerMessage::Progress { .. } => "progress",
            ServerMessage::Result { .. } => "result",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Cancelled { .. } => "cancelled",
            ServerMessage::Pong { .. } => "pong",
            ServerMessage::Info { .. } => "info",
            ServerMessage::Health { .. } => "health",
        }
    }

    /// The job this envelope refers to, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            ServerMessage::Progress { job_id, .. }
            | ServerMessage::Result { job_id, .. }
            | ServerMessage::Cancelled { job_id, .. } => Some(*job_id),
            ServerMessage::Error { job_id, .. } => *job_id,
            _ => None,
        }
    }

    /// `true` for the `result`, `error`, and `cancelled` events that end a
    /// job.  A job-less `error` (a synchronous rejection) is not terminal.
    pub fn is_job_terminal(&self) -> bool {
        match self {
            ServerMessage::Result { .. } | ServerMessage::Cancelled { .. } => true,
            ServerMessage::Error { job_id, .. } => job_id.is_some(),
            _ => false,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
