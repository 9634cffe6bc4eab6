//! Text-frame codec and payload validation.
//!
//! Decoding happens in two stages:
//!
//! 1. [`decode_client_message`] turns one text frame into a typed
//!    [`ClientMessage`], classifying failures as `ProtocolError` (not an
//!    envelope at all) or `UnknownMessageType` (an envelope of a kind we do
//!    not speak).
//! 2. [`validate_process`] turns a [`ProcessRequest`] into decoded bytes plus
//!    validated [`JobOptions`], enforcing the size ceilings.  Every failure at
//!    this stage is a `ValidationError`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::Value;
use thiserror::Error;

use crate::domain::error::{ErrorKind, JobFailure};
use crate::domain::options::JobOptions;
use crate::protocol::messages::{ClientMessage, ProcessRequest, ServerMessage};

/// Default ceiling on the decoded image size: 10 MiB.
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;
/// Default ceiling on the decoded audio size: 50 MiB.
pub const DEFAULT_MAX_AUDIO_BYTES: usize = 50 * 1024 * 1024;

/// Errors produced while turning a text frame into a [`ClientMessage`], or a
/// [`ServerMessage`] into a text frame.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The frame is not a JSON object with a string `type`, or a known kind
    /// carries fields of the wrong shape.
    #[error("malformed message: {0}")]
    Protocol(String),

    /// The envelope is well formed but its `type` is not a client kind.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl CodecError {
    /// The error kind reported to the client.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CodecError::Protocol(_) => ErrorKind::ProtocolError,
            CodecError::UnknownMessageType(_) => ErrorKind::UnknownMessageType,
            CodecError::Encode(_) => ErrorKind::InternalError,
        }
    }
}

// ── Envelope codec ────────────────────────────────────────────────────────────

/// Parses one text frame into a [`ClientMessage`].
///
/// # Errors
///
/// - [`CodecError::Protocol`] if the text is not JSON, not an object, has no
///   string `type`, or a known kind has fields of the wrong type.
/// - [`CodecError::UnknownMessageType`] if `type` names no client kind.
///
/// # Examples
///
/// ```rust
/// use lipsync_core::{decode_client_message, ClientMessage, CodecError};
///
/// assert_eq!(decode_client_message(r#"{"type":"ping"}"#).unwrap(), ClientMessage::Ping);
/// assert!(matches!(
///     decode_client_message(r#"{"type":"frobnicate"}"#),
///     Err(CodecError::UnknownMessageType(_))
/// ));
/// ```
pub fn decode_client_message(text: &str) -> Result<ClientMessage, CodecError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| CodecError::Protocol(format!("invalid JSON: {e}")))?;

    let kind = match value.as_object().map(|obj| obj.get("type")) {
        None => return Err(CodecError::Protocol("expected a JSON object".to_string())),
        Some(None) => return Err(CodecError::Protocol("missing 'type' field".to_string())),
        Some(Some(Value::String(kind))) => kind.clone(),
        Some(Some(_)) => {
            return Err(CodecError::Protocol("'type' must be a string".to_string()))
        }
    };

    if !ClientMessage::KINDS.contains(&kind.as_str()) {
        return Err(CodecError::UnknownMessageType(kind));
    }

    serde_json::from_value(value).map_err(|e| CodecError::Protocol(format!("invalid '{kind}' message: {e}")))
}

/// Serializes a [`ServerMessage`] into the text of one frame.
///
/// # Errors
///
/// [`CodecError::Encode`] if serialization fails, which cannot happen for
/// the variants defined in this crate but is surfaced rather than hidden.
pub fn encode_server_message(msg: &ServerMessage) -> Result<String, CodecError> {
    Ok(serde_json::to_string(msg)?)
}

/// Parses one text frame from the server.  Used by clients.
pub fn decode_server_message(text: &str) -> Result<ServerMessage, CodecError> {
    serde_json::from_str(text).map_err(|e| CodecError::Protocol(e.to_string()))
}

/// Serializes a [`ClientMessage`] into the text of one frame.  Used by clients.
pub fn encode_client_message(msg: &ClientMessage) -> Result<String, CodecError> {
    Ok(serde_json::to_string(msg)?)
}

// ── Payload validation ────────────────────────────────────────────────────────

/// Ceilings on decoded payload sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadLimits {
    pub max_image_bytes: usize,
    pub max_audio_bytes: usize,
}

impl Default for PayloadLimits {
    fn default() -> Self {
        Self {
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
            max_audio_bytes: DEFAULT_MAX_AUDIO_BYTES,
        }
    }
}

/// Which payload a validation message is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Image,
    Audio,
}

impl PayloadKind {
    fn label(self) -> &'static str {
        match self {
            PayloadKind::Image => "Image",
            PayloadKind::Audio => "Audio",
        }
    }

    fn field(self) -> &'static str {
        match self {
            PayloadKind::Image => "image_base64",
            PayloadKind::Audio => "audio_base64",
        }
    }
}

/// Decoded, validated inputs of one `process` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInput {
    pub image: Vec<u8>,
    pub audio: Vec<u8>,
    pub options: JobOptions,
}

/// Decoded length implied by a standard-alphabet base64 string.
///
/// Exact for well-formed input; used to reject oversized payloads before
/// allocating the decode buffer.
pub fn decoded_len(encoded: &str) -> usize {
    let significant = encoded.trim_end_matches('=').len();
    significant / 4 * 3 + (significant % 4) * 3 / 4
}

/// Decodes one base64 payload and enforces `limit` on its decoded size.
///
/// # Errors
///
/// A `ValidationError` failure if the field is empty, too large (checked on
/// the encoded length first, then on the decoded bytes), or not valid base64.
pub fn decode_payload(kind: PayloadKind, encoded: &str, limit: usize) -> Result<Vec<u8>, JobFailure> {
    if encoded.is_empty() {
        return Err(JobFailure::validation(format!(
            "{} data is required ({} is empty)",
            kind.label(),
            kind.field()
        )));
    }

    let too_large = |size: usize| {
        JobFailure::validation(format!(
            "{} file too large ({size} bytes, max {limit} bytes)",
            kind.label()
        ))
    };

    let estimated = decoded_len(encoded);
    if estimated > limit {
        return Err(too_large(estimated));
    }

    let bytes = STANDARD.decode(encoded).map_err(|e| {
        JobFailure::validation(format!("Invalid base64 in {}: {e}", kind.field()))
    })?;

    if bytes.len() > limit {
        return Err(too_large(bytes.len()));
    }
    if bytes.is_empty() {
        return Err(JobFailure::validation(format!("{} data decoded to zero bytes", kind.label())));
    }
    Ok(bytes)
}

/// Validates a `process` request and decodes its payloads.
///
/// Options are checked first so a bad option is reported without paying for a
/// large decode.
pub fn validate_process(request: ProcessRequest, limits: &PayloadLimits) -> Result<DecodedInput, JobFailure> {
    let options = request.options.into_job_options()?;
    let image = decode_payload(PayloadKind::Image, &request.image_base64, limits.max_image_bytes)?;
    let audio = decode_payload(PayloadKind::Audio, &request.audio_base64, limits.max_audio_bytes)?;
    Ok(DecodedInput {
        image,
        audio,
        options,
    })
}

/// Encodes output video bytes for the `result` envelope.
pub fn encode_video(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
