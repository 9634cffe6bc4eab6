//! Domain layer for lipsync-server.
//!
//! # What belongs in the domain layer?
//!
//! - Runtime configuration structures
//! - The compute device selection
//!
//! # What does NOT belong here?
//!
//! - Any `tokio`, socket, or WebSocket types
//! - File I/O or environment variable reading
//! - Anything that could block or fail due to external state

pub mod config;
pub mod device;

pub use config::ServerConfig;
pub use device::Device;
