//! # lipsync-core
//!
//! Shared library for the lip-sync session service containing the WebSocket
//! wire protocol, payload validation, and the job domain model.
//!
//! This crate is used by both the server and the command-line client.
//! It has zero dependencies on sockets, async runtimes, or the file system.
//!
//! # Architecture overview
//!
//! A client opens one WebSocket connection, submits a still image plus an
//! audio clip, and receives back a video in which the face's lips follow the
//! audio.  The heavy lifting (face detection, the neural forward pass, muxing)
//! happens in an external inference service; this crate only describes *what*
//! travels over the wire and *how* a job moves through its lifecycle.
//!
//! - **`protocol`** – JSON envelopes exchanged over the connection, the codec
//!   that turns a text frame into a typed [`ClientMessage`], and the payload
//!   decoder that enforces the image/audio size ceilings.
//!
//! - **`domain`** – Pure business types: processing options with their
//!   defaults, the job state machine, progress tracking, and the closed
//!   error-kind taxonomy clients branch on.

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `lipsync_core::JobState` instead of `lipsync_core::domain::job::JobState`.
pub use domain::error::{ErrorKind, JobFailure};
pub use domain::job::{JobEvent, JobId, JobState, ProgressTracker, TransitionError};
pub use domain::options::{FacePadding, JobOptions, ModelVariant};
pub use domain::SessionId;
pub use protocol::codec::{decode_client_message, encode_server_message, CodecError};
pub use protocol::messages::{ClientMessage, ServerMessage};
