//! TOML configuration file for the server.
//!
//! Every field is optional; an absent field keeps the built-in default, and
//! command-line flags override whatever the file says.
//!
//! ```toml
//! log_level = "info"
//!
//! [server]
//! bind = "0.0.0.0:8000"
//! work_dir = "/var/tmp/lipsync"
//! outbox_capacity = 64
//!
//! [limits]
//! max_image_mb = 10
//! max_audio_mb = 50
//!
//! [inference]
//! device = "cuda:0"
//! max_concurrent = 1
//!
//! [backends.fast]
//! program = "python"
//! args = ["inference.py", "--face", "{image}", "--audio", "{audio}", "--outfile", "{output}"]
//! working_dir = "/opt/wav2lip"
//! ```
//!
//! When `[backends]` is empty, both model variants use the stock Wav2Lip
//! `inference.py` invocation.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use lipsync_core::ModelVariant;

use crate::domain::{Device, ServerConfig};
use crate::infrastructure::inference::CommandTemplate;

const MIB: usize = 1024 * 1024;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid bind address '{0}'")]
    InvalidBind(String),

    /// A `[backends.<name>]` table names no model variant.
    #[error("unknown backend '{0}' (expected fast or high_quality)")]
    UnknownBackend(String),
}

// ── Config schema types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileConfig {
    /// `tracing` filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub inference: InferenceSection,
    /// Keyed by model variant name (`fast`, `high_quality`, or an alias).
    #[serde(default)]
    pub backends: BTreeMap<String, CommandTemplate>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbox_capacity: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_message_mb: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LimitsSection {
    #[serde(default = "default_max_image_mb")]
    pub max_image_mb: usize,
    #[serde(default = "default_max_audio_mb")]
    pub max_audio_mb: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InferenceSection {
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_image_mb() -> usize {
    10
}
fn default_max_audio_mb() -> usize {
    50
}
fn default_device() -> String {
    "auto".to_string()
}
fn default_max_concurrent() -> usize {
    1
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            server: ServerSection::default(),
            limits: LimitsSection::default(),
            inference: InferenceSection::default(),
            backends: BTreeMap::new(),
        }
    }
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_image_mb: default_max_image_mb(),
            max_audio_mb: default_max_audio_mb(),
        }
    }
}

impl Default for InferenceSection {
    fn default() -> Self {
        Self {
            device: default_device(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

// ── Loading and applying ──────────────────────────────────────────────────────

/// Reads and parses the config file at `path`.
///
/// # Errors
///
/// [`ConfigError::Io`] if the file cannot be read (including when it does not
/// exist: an explicitly named file is required), [`ConfigError::Parse`] if
/// the TOML is malformed.
pub fn load_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&content)?)
}

impl FileConfig {
    /// Overlays the file's settings onto `config`.
    ///
    /// An unrecognised device string falls back to `cpu` with a warning.
    pub fn apply_to(&self, config: &mut ServerConfig) -> Result<(), ConfigError> {
        if let Some(bind) = &self.server.bind {
            config.bind_addr = bind
                .parse::<SocketAddr>()
                .map_err(|_| ConfigError::InvalidBind(bind.clone()))?;
        }
        if let Some(dir) = &self.server.work_dir {
            config.work_dir = dir.clone();
        }
        if let Some(capacity) = self.server.outbox_capacity {
            config.outbox_capacity = capacity.max(1);
        }
        if let Some(mb) = self.server.max_message_mb {
            config.max_message_bytes = mb.saturating_mul(MIB);
        }
        config.limits.max_image_bytes = self.limits.max_image_mb.saturating_mul(MIB);
        config.limits.max_audio_bytes = self.limits.max_audio_mb.saturating_mul(MIB);
        config.device = parse_device_or_cpu(&self.inference.device);
        config.max_concurrent_inferences = self.inference.max_concurrent.max(1);
        Ok(())
    }

    /// Command templates per variant, falling back to the stock Wav2Lip
    /// invocation when none are configured.
    pub fn backend_templates(&self) -> Result<Vec<(ModelVariant, CommandTemplate)>, ConfigError> {
        if self.backends.is_empty() {
            return Ok(ModelVariant::ALL
                .into_iter()
                .map(|v| (v, CommandTemplate::wav2lip(v)))
                .collect());
        }
        self.backends
            .iter()
            .map(|(name, template)| {
                name.parse::<ModelVariant>()
                    .map(|variant| (variant, template.clone()))
                    .map_err(|_| ConfigError::UnknownBackend(name.clone()))
            })
            .collect()
    }
}

/// Parses a device string, warning and falling back to `cpu` when unknown.
pub fn parse_device_or_cpu(raw: &str) -> Device {
    let (device, err) = Device::parse_lenient(raw);
    if let Some(e) = err {
        warn!("{e}; falling back to cpu");
    }
    device
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_file_yields_defaults() {
        let cfg: FileConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, FileConfig::default());
    }

    #[test]
    fn test_apply_overlays_every_section() {
        // Arrange
        let cfg: FileConfig = toml::from_str(
            r#"
            log_level = "debug"
            [server]
            bind = "127.0.0.1:9100"
            work_dir = "/tmp/lipsync-test"
            outbox_capacity = 8
            [limits]
            max_image_mb = 2
            [inference]
            device = "cuda:1"
            max_concurrent = 3
            "#,
        )
        .unwrap();
        let mut config = ServerConfig::default();

        // Act
        cfg.apply_to(&mut config).unwrap();

        // Assert
        assert_eq!(config.bind_addr.port(), 9100);
        assert_eq!(config.work_dir, PathBuf::from("/tmp/lipsync-test"));
        assert_eq!(config.outbox_capacity, 8);
        assert_eq!(config.limits.max_image_bytes, 2 * MIB);
        assert_eq!(config.limits.max_audio_bytes, 50 * MIB);
        assert_eq!(config.device, Device::Cuda(Some(1)));
        assert_eq!(config.max_concurrent_inferences, 3);
        assert_eq!(cfg.log_level, "debug");
    }

    #[test]
    fn test_invalid_bind_is_rejected() {
        let cfg: FileConfig = toml::from_str("[server]\nbind = \"nowhere\"").unwrap();
        let err = cfg.apply_to(&mut ServerConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBind(_)));
    }

    #[test]
    fn test_unknown_device_falls_back_to_cpu() {
        let cfg: FileConfig = toml::from_str("[inference]\ndevice = \"tpu\"").unwrap();
        let mut config = ServerConfig::default();
        cfg.apply_to(&mut config).unwrap();
        assert_eq!(config.device, Device::Cpu);
    }

    #[test]
    fn test_no_backends_uses_wav2lip_for_both_variants() {
        let templates = FileConfig::default().backend_templates().unwrap();
        let variants: Vec<ModelVariant> = templates.iter().map(|(v, _)| *v).collect();
        assert_eq!(variants, ModelVariant::ALL);
        assert!(templates.iter().all(|(_, t)| t.program == "python"));
    }

    #[test]
    fn test_backend_tables_accept_aliases() {
        let cfg: FileConfig = toml::from_str(
            r#"
            [backends.nota_wav2lip]
            program = "runner"
            args = ["{image}", "{audio}", "{output}"]
            "#,
        )
        .unwrap();

        let templates = cfg.backend_templates().unwrap();

        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].0, ModelVariant::Fast);
        assert_eq!(templates[0].1.args.len(), 3);
    }

    #[test]
    fn test_unknown_backend_name_is_an_error() {
        let cfg: FileConfig = toml::from_str("[backends.turbo]\nprogram = \"x\"").unwrap();
        assert!(matches!(cfg.backend_templates(), Err(ConfigError::UnknownBackend(_))));
    }

    #[test]
    fn test_load_config_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[inference]\nmax_concurrent = 2").unwrap();

        let cfg = load_config(file.path()).unwrap();

        assert_eq!(cfg.inference.max_concurrent, 2);
    }

    #[test]
    fn test_load_config_missing_file_is_io_error() {
        let err = load_config(Path::new("/nonexistent/lipsync.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
