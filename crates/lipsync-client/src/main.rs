//! Lip-sync command-line client.
//!
//! Connects to a running `lipsync-server`, submits an image and an audio
//! clip, prints progress as it arrives, and writes the returned video to
//! disk.  Pressing Ctrl+C while a job runs sends `cancel` and waits for the
//! server to confirm.
//!
//! # Usage
//!
//! ```text
//! lipsync-client --audio speech.wav --image face.jpg [OPTIONS]
//! lipsync-client --ping
//!
//! Options:
//!   --url <URL>                 Server endpoint [default: ws://localhost:8000/ws/lip-sync]
//!   --model <MODEL>             fast | high_quality
//!   --pads <T> <B> <L> <R>      Face padding in pixels
//!   --resize-factor <N>         Downscale factor for the input frame
//!   --nosmooth                  Disable temporal smoothing of face boxes
//!   --output <PATH>             Where to write the video [default: result_<job>.mp4]
//! ```
//!
//! Exits non-zero when the server reports an error or the job is cancelled.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use lipsync_core::protocol::{decode_server_message, encode_client_message, ProcessRequest, WireOptions};
use lipsync_core::{ClientMessage, JobId, ModelVariant, ServerMessage};

type Connection = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Command-line client for the lip-sync WebSocket service.
#[derive(Debug, Parser)]
#[command(
    name = "lipsync-client",
    about = "Submit an image and audio clip to a lip-sync server",
    version
)]
struct Cli {
    /// WebSocket endpoint of the server.
    #[arg(long, default_value = "ws://localhost:8000/ws/lip-sync", env = "LIPSYNC_URL")]
    url: String,

    /// Audio clip to lip-sync to.
    #[arg(long, requires = "image")]
    audio: Option<PathBuf>,

    /// Still image containing one face.
    #[arg(long, requires = "audio")]
    image: Option<PathBuf>,

    /// Model variant (`fast`, `high_quality`, or a legacy alias).
    #[arg(long)]
    model: Option<ModelVariant>,

    /// Face padding in pixels: top bottom left right.
    #[arg(long, num_args = 4, value_names = ["TOP", "BOTTOM", "LEFT", "RIGHT"])]
    pads: Option<Vec<u32>>,

    /// Downscale factor applied to the input frame.
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    resize_factor: Option<u32>,

    /// Disable temporal smoothing of face detections.
    #[arg(long)]
    nosmooth: bool,

    /// Output video path.  Defaults to `result_<job_id>.mp4`.
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// Send a ping and wait for the pong before anything else.
    #[arg(long)]
    ping: bool,
}

impl Cli {
    fn wire_options(&self) -> WireOptions {
        WireOptions {
            model_type: self.model.map(|m| m.as_str().to_string()),
            audio_format: self.audio.as_deref().and_then(extension_of),
            image_format: self.image.as_deref().and_then(extension_of),
            pads: self
                .pads
                .as_deref()
                .and_then(|p| <[u32; 4]>::try_from(p).ok()),
            resize_factor: self.resize_factor,
            nosmooth: self.nosmooth.then_some(true),
        }
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}

fn default_output(job_id: JobId) -> PathBuf {
    PathBuf::from(format!("result_{job_id}.mp4"))
}

fn format_size(bytes: u64) -> String {
    let mut size = bytes as f64;
    for unit in ["B", "KB", "MB", "GB"] {
        if size < 1024.0 {
            return format!("{size:.1}{unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1}TB")
}

// ── Connection helpers ────────────────────────────────────────────────────────

async fn send(ws: &mut Connection, msg: &ClientMessage) -> anyhow::Result<()> {
    let text = encode_client_message(msg).context("failed to encode request")?;
    ws.send(Message::Text(text))
        .await
        .context("failed to send request")
}

/// Next server envelope, or `None` once the server closes the connection.
async fn recv(ws: &mut Connection) -> anyhow::Result<Option<ServerMessage>> {
    while let Some(frame) = ws.next().await {
        match frame.context("WebSocket receive failed")? {
            Message::Text(text) => {
                let msg = decode_server_message(&text)
                    .with_context(|| format!("unrecognised server frame: {text}"))?;
                return Ok(Some(msg));
            }
            Message::Close(_) => return Ok(None),
            other => debug!("ignoring non-text frame: {other:?}"),
        }
    }
    Ok(None)
}

async fn expect_connection(ws: &mut Connection) -> anyhow::Result<()> {
    match recv(ws).await? {
        Some(ServerMessage::Connection {
            client_id,
            message,
            models,
            ..
        }) => {
            println!("{message}");
            println!("Client ID: {client_id}");
            let models: Vec<&str> = models.iter().map(|m| m.as_str()).collect();
            println!("Models: {}", models.join(", "));
            Ok(())
        }
        Some(other) => bail!("expected a connection frame, got '{}'", other.kind()),
        None => bail!("server closed the connection before acknowledging it"),
    }
}

async fn ping(ws: &mut Connection) -> anyhow::Result<()> {
    send(ws, &ClientMessage::Ping).await?;
    loop {
        match recv(ws).await? {
            Some(ServerMessage::Pong { .. }) => {
                println!("Pong received");
                return Ok(());
            }
            Some(other) => debug!("skipping '{}' while waiting for pong", other.kind()),
            None => bail!("connection closed while waiting for pong"),
        }
    }
}

/// Submits the job and follows it to its terminal event.
async fn process(ws: &mut Connection, cli: &Cli, audio: &Path, image: &Path) -> anyhow::Result<()> {
    let audio_bytes = tokio::fs::read(audio)
        .await
        .with_context(|| format!("failed to read audio file {}", audio.display()))?;
    let image_bytes = tokio::fs::read(image)
        .await
        .with_context(|| format!("failed to read image file {}", image.display()))?;
    println!("Audio size: {}", format_size(audio_bytes.len() as u64));
    println!("Image size: {}", format_size(image_bytes.len() as u64));

    let request = ClientMessage::Process(ProcessRequest {
        audio_base64: STANDARD.encode(&audio_bytes),
        image_base64: STANDARD.encode(&image_bytes),
        options: cli.wire_options(),
    });
    send(ws, &request).await?;
    println!("Processing request sent");

    let mut cancel_sent = false;
    loop {
        let msg = tokio::select! {
            msg = recv(ws) => msg?,
            _ = tokio::signal::ctrl_c(), if !cancel_sent => {
                println!("Cancelling...");
                send(ws, &ClientMessage::Cancel).await?;
                cancel_sent = true;
                continue;
            }
        };

        match msg {
            Some(ServerMessage::Progress { progress, message, .. }) => {
                println!("Progress: {progress:>3}% - {message}");
            }
            Some(ServerMessage::Result {
                job_id,
                video_base64,
                video_size_bytes,
                processing_time,
                model_used,
                ..
            }) => {
                println!("Processing complete");
                println!("Job ID: {job_id}");
                println!("Processing time: {processing_time:.2}s");
                println!("Model used: {model_used}");
                println!("Video size: {}", format_size(video_size_bytes));

                let video = STANDARD
                    .decode(video_base64.as_bytes())
                    .context("server returned invalid base64 video")?;
                let path = cli.output.clone().unwrap_or_else(|| default_output(job_id));
                tokio::fs::write(&path, &video)
                    .await
                    .with_context(|| format!("failed to write {}", path.display()))?;
                println!("Result saved: {}", path.display());
                return Ok(());
            }
            Some(ServerMessage::Error { error_type, message, .. }) => {
                bail!("server error ({error_type}): {message}");
            }
            Some(ServerMessage::Cancelled { job_id, .. }) => {
                bail!("job {job_id} was cancelled");
            }
            Some(ServerMessage::Info { message, .. }) => println!("Info: {message}"),
            Some(ServerMessage::Pong { .. }) => println!("Pong received"),
            Some(other) => debug!("ignoring '{}' frame", other.kind()),
            None => bail!("connection closed before the job finished"),
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    if cli.audio.is_none() && !cli.ping {
        bail!("nothing to do: pass --audio and --image, or --ping");
    }

    println!("Connecting to {}...", cli.url);
    let (mut ws, _) = connect_async(cli.url.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", cli.url))?;
    expect_connection(&mut ws).await?;

    if cli.ping {
        ping(&mut ws).await?;
    }

    let outcome = match (cli.audio.as_deref(), cli.image.as_deref()) {
        (Some(audio), Some(image)) => process(&mut ws, &cli, audio, image).await,
        _ => Ok(()),
    };

    let _ = ws.close(None).await;
    outcome
}

// ── Tests ─────────────────────────────────────────────────────────────────────
