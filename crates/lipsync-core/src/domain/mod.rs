//! Domain layer for the lip-sync service.
//!
//! Pure types with no I/O: what a job is, which states it may pass through,
//! what options a client may request, and which error kinds exist.
//!
//! # Sub-modules
//!
//! - **`error`**   – The closed [`error::ErrorKind`] taxonomy and [`error::JobFailure`].
//! - **`job`**     – Job identifiers, the state machine, and progress tracking.
//! - **`options`** – Processing options and their documented defaults.

pub mod error;
pub mod job;
pub mod options;

/// Opaque unique identifier of one client session (one WebSocket connection).
///
/// Generated by the server when the connection is accepted and echoed to the
/// client in the `connection` acknowledgment.
pub type SessionId = uuid::Uuid;
