//! Compute device selection for inference.
//!
//! Accepted spellings are `auto`, `cpu`, `cuda`, and `cuda:N`.  Anything
//! else falls back to [`Device::Cpu`]; the caller decides whether to warn.

use std::str::FromStr;

/// Where the inference backend should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
    /// Let the gateway pick: CUDA when a GPU is visible, otherwise CPU.
    #[default]
    Auto,
    Cpu,
    /// A CUDA device, optionally pinned to one ordinal.
    Cuda(Option<u32>),
}

/// A device string that is none of the accepted spellings.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown device '{0}' (expected auto, cpu, cuda or cuda:N)")]
pub struct UnknownDevice(pub String);

impl FromStr for Device {
    type Err = UnknownDevice;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        match lowered.as_str() {
            "auto" => Ok(Device::Auto),
            "cpu" => Ok(Device::Cpu),
            "cuda" | "gpu" => Ok(Device::Cuda(None)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|n| n.parse::<u32>().ok())
                .map(|n| Device::Cuda(Some(n)))
                .ok_or_else(|| UnknownDevice(s.to_string())),
        }
    }
}

impl Device {
    /// Parses `s`, returning `Cpu` together with the parse error when the
    /// spelling is not recognised.
    pub fn parse_lenient(s: &str) -> (Device, Option<UnknownDevice>) {
        match s.parse() {
            Ok(device) => (device, None),
            Err(e) => (Device::Cpu, Some(e)),
        }
    }

    pub fn is_cuda(self) -> bool {
        matches!(self, Device::Cuda(_))
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Auto => f.write_str("auto"),
            Device::Cpu => f.write_str("cpu"),
            Device::Cuda(None) => f.write_str("cuda"),
            Device::Cuda(Some(n)) => write!(f, "cuda:{n}"),
        }
    }
}
