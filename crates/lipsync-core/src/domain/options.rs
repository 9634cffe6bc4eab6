//! Processing options for a lip-sync job.
//!
//! [`JobOptions`] is the validated, fully-defaulted form of the `options`
//! object a client sends with `process`.  Unknown wire fields are ignored and
//! missing fields take the defaults documented on each field.
//!
//! | Field                        | Default        |
//! |------------------------------|----------------|
//! | model_variant                | `fast`         |
//! | audio_format                 | `wav`          |
//! | image_format                 | `jpg`          |
//! | face_padding                 | `(0, 10, 0, 0)`|
//! | resize_factor                | `1`            |
//! | disable_temporal_smoothing   | `false`        |

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Longest file extension accepted from `audio_format` / `image_format`.
const MAX_EXTENSION_LEN: usize = 8;

/// Which inference backend handles the job.
///
/// # Serde representation
///
/// `"fast"` and `"high_quality"`.  The legacy model names are accepted as
/// aliases: `"nota_wav2lip"` for `fast`, `"wav2lip"` for `high_quality`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelVariant {
    /// Compressed model; lower latency.
    #[serde(alias = "nota_wav2lip")]
    Fast,
    /// Full-size model; better quality, slower.
    #[serde(alias = "wav2lip")]
    HighQuality,
}

impl ModelVariant {
    /// All variants, in a stable order.
    pub const ALL: [ModelVariant; 2] = [ModelVariant::Fast, ModelVariant::HighQuality];

    /// Returns the canonical wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            ModelVariant::Fast => "fast",
            ModelVariant::HighQuality => "high_quality",
        }
    }
}

impl Default for ModelVariant {
    fn default() -> Self {
        ModelVariant::Fast
    }
}

impl std::fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fast" | "nota_wav2lip" => Ok(ModelVariant::Fast),
            "high_quality" | "wav2lip" => Ok(ModelVariant::HighQuality),
            other => Err(format!("unknown model type '{other}'")),
        }
    }
}

/// Extra pixels added around the detected face box before cropping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacePadding {
    pub top: u32,
    pub bottom: u32,
    pub left: u32,
    pub right: u32,
}

impl FacePadding {
    pub fn from_array([top, bottom, left, right]: [u32; 4]) -> Self {
        Self {
            top,
            bottom,
            left,
            right,
        }
    }

    pub fn to_array(self) -> [u32; 4] {
        [self.top, self.bottom, self.left, self.right]
    }
}

impl Default for FacePadding {
    /// Ten pixels below the face so the chin is included.
    fn default() -> Self {
        Self::from_array([0, 10, 0, 0])
    }
}

/// Validated options for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOptions {
    pub model_variant: ModelVariant,
    /// File extension for the staged audio file.  Advisory only.
    pub audio_format: String,
    /// File extension for the staged image file.  Advisory only.
    pub image_format: String,
    pub face_padding: FacePadding,
    /// Downscale factor applied to the input frame; always >= 1.
    pub resize_factor: u32,
    pub disable_temporal_smoothing: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            model_variant: ModelVariant::Fast,
            audio_format: "wav".to_string(),
            image_format: "jpg".to_string(),
            face_padding: FacePadding::default(),
            resize_factor: 1,
            disable_temporal_smoothing: false,
        }
    }
}

/// Reduces a client-supplied format hint to a safe file extension.
///
/// Only ASCII alphanumerics survive, lowercased and truncated.  An empty
/// result falls back to `default`, so a hint like `"../../etc"` can never
/// escape the scratch directory.
pub fn sanitize_extension(hint: &str, default: &str) -> String {
    let cleaned: String = hint
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(MAX_EXTENSION_LEN)
        .collect::<String>()
        .to_ascii_lowercase();
    if cleaned.is_empty() {
        default.to_string()
    } else {
        cleaned
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
