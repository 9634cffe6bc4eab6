//! Machine-readable error kinds sent to clients.
//!
//! Every `error` envelope carries exactly one [`ErrorKind`].  Clients branch on
//! the kind, never on the human-readable message, so the set is closed: adding
//! a variant is a protocol change.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The closed set of error kinds that can appear in an `error` envelope.
///
/// # Serde representation
///
/// Variants serialize as their exact names, e.g. `"ValidationError"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The envelope was missing a field, a field was empty or oversized, or an
    /// option value was out of range.
    ValidationError,
    /// A `process` request arrived while the session already had a job in flight.
    AlreadyProcessing,
    /// The envelope parsed but its `type` is not one the server understands.
    UnknownMessageType,
    /// The frame was not a well-formed envelope at all.
    ProtocolError,
    /// Any unexpected failure while staging, detecting, inferring, or muxing.
    InternalError,
    /// Inference completed but produced a zero-byte video.
    EmptyOutput,
}

impl ErrorKind {
    /// Returns the wire name of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::AlreadyProcessing => "AlreadyProcessing",
            ErrorKind::UnknownMessageType => "UnknownMessageType",
            ErrorKind::ProtocolError => "ProtocolError",
            ErrorKind::InternalError => "InternalError",
            ErrorKind::EmptyOutput => "EmptyOutput",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure, ready to be turned into an `error` envelope.
///
/// Produced at the job executor boundary (for failures after a job started)
/// and by payload validation (for failures that never create a job).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct JobFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationError, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_serializes_as_variant_name() {
        let json = serde_json::to_string(&ErrorKind::AlreadyProcessing).unwrap();
        assert_eq!(json, r#""AlreadyProcessing""#);
    }

    #[test]
    fn test_error_kind_as_str_matches_serde_name() {
        for kind in [
            ErrorKind::ValidationError,
            ErrorKind::AlreadyProcessing,
            ErrorKind::UnknownMessageType,
            ErrorKind::ProtocolError,
            ErrorKind::InternalError,
            ErrorKind::EmptyOutput,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn test_job_failure_display_includes_kind_and_message() {
        let failure = JobFailure::validation("Audio file too large");
        assert_eq!(failure.to_string(), "ValidationError: Audio file too large");
    }
}
