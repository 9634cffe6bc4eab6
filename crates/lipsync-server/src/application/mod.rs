//! Application layer for lipsync-server.
//!
//! Knows *what* happens to a connection and a job, and delegates sockets and
//! model calls to the infrastructure layer.
//!
//! # Responsibilities
//!
//! - Tracking live sessions and in-flight jobs (`registry`)
//! - Dispatching client envelopes and enforcing one job per session (`session`)
//! - Running jobs with progress, cancellation, and scratch cleanup (`executor`)
//!
//! # What does NOT belong here?
//!
//! - Opening sockets or performing the WebSocket handshake
//! - Serializing frames to text (the connection writer task does that)
//! - Starting external processes (that is the inference backend's job)

pub mod executor;
pub mod registry;
pub mod session;

pub use executor::{JobControl, JobExecutor, JobHandle};
pub use registry::{ActiveJobSlot, RegistryError, RegistryStats, SessionInfo, SessionRegistry};
pub use session::{Outbox, OutboxClosed, Session};
