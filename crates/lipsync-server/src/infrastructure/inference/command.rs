//! Backend that drives an external inference program.
//!
//! The lip-sync model itself runs in a separate process (typically the Python
//! Wav2Lip runner).  Each call expands an argument template with the staged
//! file paths and options, runs the program to completion, and reads the
//! video it wrote to `{output}`.
//!
//! # Placeholders
//!
//! | Placeholder       | Expands to                                        |
//! |-------------------|---------------------------------------------------|
//! | `{image}`         | staged image path                                 |
//! | `{audio}`         | staged audio path                                 |
//! | `{output}`        | path the program must write the video to          |
//! | `{model}`         | `fast` or `high_quality`                          |
//! | `{device}`        | `cpu`, `cuda`, or `cuda:N`                        |
//! | `{resize_factor}` | integer resize factor                             |
//! | `{pads}`          | four arguments `top bottom left right` when it is the whole argument, otherwise the four numbers joined by spaces |
//! | `{nosmooth}`      | `--nosmooth` when smoothing is disabled, otherwise the argument is dropped (whole-argument only) |

use std::path::PathBuf;
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use lipsync_core::ModelVariant;

use super::{InferenceBackend, InferenceError, InferenceRequest};
use crate::domain::Device;

/// Bytes of stderr kept in a [`InferenceError::ProcessFailed`] message.
const STDERR_TAIL_BYTES: usize = 2000;

/// How to invoke the external program for one model variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplate {
    /// Program name (looked up on `PATH`) or path.
    pub program: String,
    /// Argument template for one inference call.
    #[serde(default)]
    pub args: Vec<String>,
    /// Optional arguments for a one-off warmup run.  Only `{model}` and
    /// `{device}` are expanded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warmup_args: Option<Vec<String>>,
    /// Working directory for the program; inherits the server's when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

impl CommandTemplate {
    /// The stock Wav2Lip `inference.py` invocation for `variant`.
    pub fn wav2lip(variant: ModelVariant) -> Self {
        let checkpoint = match variant {
            ModelVariant::Fast => "data/checkpoints/wav2lip/lrs3-nota-wav2lip.pth",
            ModelVariant::HighQuality => "data/checkpoints/wav2lip/lrs3-wav2lip.pth",
        };
        let args = [
            "inference.py",
            "--checkpoint_path",
            checkpoint,
            "--face",
            "{image}",
            "--audio",
            "{audio}",
            "--outfile",
            "{output}",
            "--device",
            "{device}",
            "--pads",
            "{pads}",
            "--resize_factor",
            "{resize_factor}",
            "{nosmooth}",
        ];
        Self {
            program: "python".to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            warmup_args: None,
            working_dir: None,
        }
    }
}

/// An [`InferenceBackend`] that shells out to a [`CommandTemplate`].
#[derive(Debug, Clone)]
pub struct CommandBackend {
    template: CommandTemplate,
    variant: ModelVariant,
}

impl CommandBackend {
    pub fn new(variant: ModelVariant, template: CommandTemplate) -> Self {
        Self { template, variant }
    }

    pub fn template(&self) -> &CommandTemplate {
        &self.template
    }

    /// Expands the call template for `request`.
    pub fn expand_args(&self, request: &InferenceRequest) -> Vec<String> {
        let opts = &request.options;
        let pads = opts.face_padding.to_array().map(|p| p.to_string());
        let mut out = Vec::with_capacity(self.template.args.len() + 3);

        for arg in &self.template.args {
            match arg.as_str() {
                "{pads}" => out.extend(pads.iter().cloned()),
                "{nosmooth}" => {
                    if opts.disable_temporal_smoothing {
                        out.push("--nosmooth".to_string());
                    }
                }
                _ => out.push(
                    arg.replace("{image}", &request.image_path.to_string_lossy())
                        .replace("{audio}", &request.audio_path.to_string_lossy())
                        .replace("{output}", &request.output_path.to_string_lossy())
                        .replace("{model}", self.variant.as_str())
                        .replace("{device}", &request.device.to_string())
                        .replace("{resize_factor}", &opts.resize_factor.to_string())
                        .replace("{pads}", &pads.join(" ")),
                ),
            }
        }
        out
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.template.program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.template.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn run_to_completion(&self, args: &[String]) -> Result<(), InferenceError> {
        let output = self
            .command(args)
            .output()
            .map_err(|source| InferenceError::Spawn {
                program: self.template.program.clone(),
                source,
            })?;
        if output.status.success() {
            return Ok(());
        }
        Err(InferenceError::ProcessFailed {
            status: output.status.to_string(),
            stderr: stderr_tail(&output.stderr),
        })
    }
}

impl InferenceBackend for CommandBackend {
    fn warmup(&self, device: Device) -> Result<(), InferenceError> {
        let resolved = which::which(&self.template.program)
            .map_err(|_| InferenceError::ProgramNotFound(self.template.program.clone()))?;
        info!("'{}' backend uses {}", self.variant, resolved.display());

        if let Some(warmup_args) = &self.template.warmup_args {
            let args: Vec<String> = warmup_args
                .iter()
                .map(|a| {
                    a.replace("{model}", self.variant.as_str())
                        .replace("{device}", &device.to_string())
                })
                .collect();
            self.run_to_completion(&args)?;
        }
        Ok(())
    }

    fn process(&self, request: &InferenceRequest) -> Result<Vec<u8>, InferenceError> {
        let args = self.expand_args(request);
        debug!("running {} {}", self.template.program, args.join(" "));
        self.run_to_completion(&args)?;

        match std::fs::read(&request.output_path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(InferenceError::MissingOutput(request.output_path.clone()))
            }
            Err(e) => Err(InferenceError::Io(e)),
        }
    }

    fn teardown(&self) {}
}

/// Last [`STDERR_TAIL_BYTES`] of `stderr`, trimmed, lossily decoded.
fn stderr_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
