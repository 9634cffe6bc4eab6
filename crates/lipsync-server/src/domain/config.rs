//! Server configuration types.
//!
//! [`ServerConfig`] is the single source of truth for runtime settings.  It is
//! built once in `main.rs` from defaults, the optional TOML file, and the
//! command line, then shared by `Arc` across every session task.

use std::net::SocketAddr;
use std::path::PathBuf;

use lipsync_core::protocol::PayloadLimits;

use super::device::Device;

/// Default listen address.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";
/// Default bound on queued outbound frames per session.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 64;
/// Default ceiling on one inbound WebSocket message.
///
/// Base64 inflates payloads by 4/3, so the largest legal `process` frame
/// (10 MiB image + 50 MiB audio) is roughly 80 MiB of text.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 128 * 1024 * 1024;

/// All runtime configuration for the lip-sync server.
///
/// # Example
///
/// ```rust
/// use lipsync_server::domain::ServerConfig;
///
/// let cfg = ServerConfig::default();
/// assert_eq!(cfg.bind_addr.port(), 8000);
/// assert_eq!(cfg.max_concurrent_inferences, 1);
/// ```
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to.
    pub bind_addr: SocketAddr,

    /// Parent directory for job-scoped scratch directories.
    ///
    /// Created at startup if missing.  Each job gets its own unique
    /// subdirectory which is removed when the job ends.
    pub work_dir: PathBuf,

    /// Decoded size ceilings for image and audio payloads.
    pub limits: PayloadLimits,

    /// Maximum outbound frames queued per session before senders wait.
    pub outbox_capacity: usize,

    /// Largest inbound WebSocket message or frame accepted, in bytes.
    pub max_message_bytes: usize,

    /// Device handed to the inference backends at warmup.
    pub device: Device,

    /// Number of inference calls allowed to run at the same time.
    pub max_concurrent_inferences: usize,
}

impl Default for ServerConfig {
    /// | Field                      | Default                          |
    /// |----------------------------|----------------------------------|
    /// | bind_addr                  | `0.0.0.0:8000`                   |
    /// | work_dir                   | `<system temp>/lipsync-websocket`|
    /// | limits                     | 10 MiB image, 50 MiB audio       |
    /// | outbox_capacity            | 64                               |
    /// | max_message_bytes          | 128 MiB                          |
    /// | device                     | `auto`                           |
    /// | max_concurrent_inferences  | 1                                |
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            work_dir: std::env::temp_dir().join("lipsync-websocket"),
            limits: PayloadLimits::default(),
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            device: Device::Auto,
            max_concurrent_inferences: 1,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
