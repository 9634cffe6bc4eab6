//! lipsync-server library crate.
//!
//! Session orchestration for the lip-sync service: clients connect over a
//! WebSocket, submit an image plus an audio clip, and receive a lip-synced
//! video back along with progress events.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! Client (JSON over WebSocket)
//!         ↕
//! [lipsync-server]
//!   ├── domain/           Pure types: ServerConfig, Device
//!   ├── application/      Session registry, session dispatch, job executor
//!   └── infrastructure/
//!         ├── ws_server/   Accept loop, handshake routing, per-connection tasks
//!         ├── config_file/ TOML configuration file
//!         └── inference/   Inference gateway and backends
//! ```
//!
//! # Layer rules
//!
//! - `domain` has no I/O and no async.
//! - `application` depends on `domain`, `lipsync-core`, and the inference
//!   gateway handle; it never touches sockets.
//! - `infrastructure` owns every socket, process, and file-system concern.

/// Domain layer: configuration and device selection.
pub mod domain;

/// Application layer: registry, sessions, and job execution.
pub mod application;

/// Infrastructure layer: WebSocket server, config file, inference backends.
pub mod infrastructure;
