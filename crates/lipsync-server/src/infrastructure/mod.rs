//! Infrastructure layer for lipsync-server.
//!
//! The infrastructure layer handles all I/O: accepting WebSocket connections,
//! reading the configuration file, and driving the external inference
//! program.
//!
//! # Responsibilities
//!
//! - Binding the TCP listener and performing the WebSocket upgrade handshake
//! - Routing handshakes by request path (session protocol, health, 404)
//! - Spawning the per-connection receive loop and writer task
//! - Parsing the TOML configuration file
//! - Running inference backends on the blocking pool behind a semaphore
//!
//! # What does NOT belong here?
//!
//! - Envelope dispatch and the one-job-per-session rule (application layer)
//! - Wire message definitions (that is `lipsync-core`)

pub mod config_file;
pub mod inference;
pub mod ws_server;

pub use config_file::{load_config, ConfigError, FileConfig};
pub use inference::{InferenceGateway, MockBackend};
pub use ws_server::{run_server, Server};
