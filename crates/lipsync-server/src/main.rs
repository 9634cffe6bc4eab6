//! Lip-sync session server: entry point.
//!
//! Accepts WebSocket connections, validates `process` requests, and drives an
//! external lip-sync inference program for each admitted job, streaming
//! progress and the finished video back to the client.
//!
//! # Usage
//!
//! ```text
//! lipsync-server [OPTIONS]
//!
//! Options:
//!   --bind <ADDR>             Listen address [default: 0.0.0.0:8000]
//!   --config <PATH>           TOML configuration file
//!   --work-dir <PATH>         Parent directory for job scratch directories
//!   --device <DEVICE>         auto | cpu | cuda | cuda:N
//!   --max-concurrent <N>      Concurrent inference calls [default: 1]
//! ```
//!
//! # Environment variable overrides
//!
//! | Variable                 | Flag               |
//! |--------------------------|--------------------|
//! | `LIPSYNC_BIND`           | `--bind`           |
//! | `LIPSYNC_CONFIG`         | `--config`         |
//! | `LIPSYNC_WORK_DIR`       | `--work-dir`       |
//! | `LIPSYNC_DEVICE`         | `--device`         |
//! | `LIPSYNC_MAX_CONCURRENT` | `--max-concurrent` |
//!
//! Precedence: command line / environment, then the config file, then the
//! built-in defaults.  `RUST_LOG` overrides the file's `log_level`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lipsync_server::domain::ServerConfig;
use lipsync_server::infrastructure::config_file::parse_device_or_cpu;
use lipsync_server::infrastructure::inference::CommandBackend;
use lipsync_server::infrastructure::{load_config, run_server, FileConfig, InferenceGateway};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Real-time lip-sync WebSocket server.
#[derive(Debug, Parser)]
#[command(
    name = "lipsync-server",
    about = "WebSocket session server for lip-sync video generation",
    version
)]
struct Cli {
    /// Address to listen on, e.g. `0.0.0.0:8000`.
    #[arg(long, env = "LIPSYNC_BIND")]
    bind: Option<SocketAddr>,

    /// Path to a TOML configuration file.
    #[arg(long, env = "LIPSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Parent directory for per-job scratch directories.
    #[arg(long, env = "LIPSYNC_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Inference device: `auto`, `cpu`, `cuda` or `cuda:N`.
    ///
    /// Unknown values fall back to `cpu` with a warning.
    #[arg(long, env = "LIPSYNC_DEVICE")]
    device: Option<String>,

    /// Number of inference calls allowed to run at the same time.
    #[arg(long, env = "LIPSYNC_MAX_CONCURRENT")]
    max_concurrent: Option<usize>,
}

impl Cli {
    /// Loads the config file named by `--config`, or the defaults.
    fn file_config(&self) -> anyhow::Result<FileConfig> {
        match &self.config {
            Some(path) => load_config(path)
                .with_context(|| format!("failed to load config file {}", path.display())),
            None => Ok(FileConfig::default()),
        }
    }

    /// Layers defaults, then `file`, then the command line.
    fn into_server_config(self, file: &FileConfig) -> anyhow::Result<ServerConfig> {
        let mut config = ServerConfig::default();
        file.apply_to(&mut config)
            .context("invalid configuration file")?;

        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(dir) = self.work_dir {
            config.work_dir = dir;
        }
        if let Some(device) = self.device.as_deref() {
            config.device = parse_device_or_cpu(device);
        }
        if let Some(n) = self.max_concurrent {
            config.max_concurrent_inferences = n.max(1);
        }
        Ok(config)
    }
}

/// Builds the gateway with one command backend per configured variant.
fn build_gateway(config: &ServerConfig, file: &FileConfig) -> anyhow::Result<InferenceGateway> {
    let templates = file
        .backend_templates()
        .context("invalid [backends] section")?;
    let gateway = templates.into_iter().fold(
        InferenceGateway::new(config.device, config.max_concurrent_inferences),
        |gateway, (variant, template)| {
            gateway.with_backend(variant, Arc::new(CommandBackend::new(variant, template)))
        },
    );
    Ok(gateway)
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let file = cli.file_config()?;

    // `RUST_LOG` wins; otherwise the file's `log_level`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&file.log_level)),
        )
        .init();

    let config = cli.into_server_config(&file)?;
    info!(
        "lip-sync server starting: bind={}, work_dir={}, device={}, max_concurrent={}",
        config.bind_addr,
        config.work_dir.display(),
        config.device,
        config.max_concurrent_inferences
    );

    let gateway = Arc::new(build_gateway(&config, &file)?);
    gateway
        .warmup()
        .await
        .context("inference backend warmup failed")?;

    // ── Graceful shutdown flag ─────────────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C, shutting down");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::error!("failed to listen for Ctrl+C signal: {e}");
            }
        }
    });

    let served = run_server(config, Arc::clone(&gateway), running).await;
    gateway.shutdown().await;
    served?;

    info!("lip-sync server stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
