//! Resolution tags and model configuration files.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Target output size. Every keyframe is resized and center-cropped to exactly this.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub height: usize,
    pub width: usize,
}

impl Resolution {
    pub fn new(height: usize, width: usize) -> Result<Self> {
        if height == 0 || width == 0 || height % 8 != 0 || width % 8 != 0 {
            return Err(Error::Config(format!(
                "resolution {height}x{width} must be non-zero multiples of 8"
            )));
        }
        Ok(Self { height, width })
    }

    pub fn shorter_side(&self) -> usize {
        self.height.min(self.width)
    }

    /// Spatial size of a latent frame.
    pub fn latent_size(&self) -> (usize, usize) {
        (self.height / 8, self.width / 8)
    }
}

impl FromStr for Resolution {
    type Err = Error;

    fn from_str(tag: &str) -> Result<Self> {
        let (height, width) = tag
            .split_once('_')
            .ok_or_else(|| Error::Config(format!("resolution tag `{tag}` is not HEIGHT_WIDTH")))?;
        let parse = |s: &str| {
            s.trim()
                .parse::<usize>()
                .map_err(|e| Error::Config(format!("resolution tag `{tag}`: {e}")))
        };
        Self::new(parse(height)?, parse(width)?)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.height, self.width)
    }
}

/// On-disk locations of the weights and config for one resolution.
#[derive(Clone, Debug)]
pub struct CheckpointLayout {
    pub checkpoints_root: PathBuf,
    pub configs_root: PathBuf,
    pub resolution: Resolution,
}

impl CheckpointLayout {
    pub const PICKLE_WEIGHTS: &'static str = "model.ckpt";
    pub const SAFETENSORS_WEIGHTS: &'static str = "model.safetensors";

    pub fn new(
        checkpoints_root: impl Into<PathBuf>,
        configs_root: impl Into<PathBuf>,
        resolution: Resolution,
    ) -> Self {
        Self {
            checkpoints_root: checkpoints_root.into(),
            configs_root: configs_root.into(),
            resolution,
        }
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.checkpoints_root
            .join(format!("tooncrafter_{}_interp_v1", self.resolution.width))
    }

    pub fn config_file(&self) -> PathBuf {
        self.configs_root
            .join(format!("inference_{}_v1.0.json", self.resolution.width))
    }

    /// Converted safetensors weights win over the original pickle when both exist.
    pub fn weights_file(&self) -> PathBuf {
        let dir = self.checkpoint_dir();
        let safetensors = dir.join(Self::SAFETENSORS_WEIGHTS);
        if safetensors.exists() {
            safetensors
        } else {
            dir.join(Self::PICKLE_WEIGHTS)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parameterization {
    Eps,
    V,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    /// Squared linspace between the square roots of the endpoints.
    Linear,
    /// Plain linspace between the endpoints.
    SqrtLinear,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UncondType {
    /// Unconditional text context is the embedding of an empty prompt.
    EmptySeq,
    /// Unconditional text context is all zeros.
    ZeroEmbed,
}

serde_plain::derive_display_from_serialize!(Parameterization);
serde_plain::derive_fromstr_from_deserialize!(Parameterization);
serde_plain::derive_display_from_serialize!(BetaSchedule);
serde_plain::derive_fromstr_from_deserialize!(BetaSchedule);
serde_plain::derive_display_from_serialize!(UncondType);
serde_plain::derive_fromstr_from_deserialize!(UncondType);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffusionConfig {
    pub timesteps: usize,
    pub linear_start: f64,
    pub linear_end: f64,
    pub beta_schedule: BetaSchedule,
    pub parameterization: Parameterization,
    pub rescale_betas_zero_snr: bool,
    pub guidance_rescale: f64,
    pub uncond_type: UncondType,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            timesteps: 1000,
            linear_start: 0.00085,
            linear_end: 0.012,
            beta_schedule: BetaSchedule::Linear,
            parameterization: Parameterization::V,
            rescale_betas_zero_snr: true,
            guidance_rescale: 0.0,
            uncond_type: UncondType::EmptySeq,
        }
    }
}

fn default_temporal_length() -> usize {
    16
}

fn default_latent_channels() -> usize {
    4
}

fn default_scale_factor() -> f64 {
    0.18215
}

/// Contents of `configs/inference_*_v1.0.json`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Architecture name, resolved through the loader registry.
    pub target: String,
    #[serde(default = "default_temporal_length")]
    pub temporal_length: usize,
    #[serde(default = "default_latent_channels")]
    pub latent_channels: usize,
    #[serde(default = "default_scale_factor")]
    pub scale_factor: f64,
    #[serde(default)]
    pub diffusion: DiffusionConfig,
    /// Architecture-specific parameters, handed to the loader untouched.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl ModelConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&config_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.temporal_length < 2 {
            return Err(Error::Config(format!(
                "temporal_length must be at least 2, got {}",
                self.temporal_length
            )));
        }
        if self.latent_channels == 0 {
            return Err(Error::Config("latent_channels must be non-zero".into()));
        }
        if self.scale_factor <= 0.0 {
            return Err(Error::Config("scale_factor must be positive".into()));
        }
        let d = &self.diffusion;
        let betas_in_range =
            0.0 < d.linear_start && d.linear_start < d.linear_end && d.linear_end < 1.0;
        if d.timesteps == 0 || !betas_in_range {
            return Err(Error::Config(format!(
                "invalid beta range {}..{} over {} timesteps",
                d.linear_start, d.linear_end, d.timesteps
            )));
        }
        Ok(())
    }
}
