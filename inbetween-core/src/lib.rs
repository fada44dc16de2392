//! Keyframe interpolation with latent video diffusion.
//!
//! [`GenerationPipeline`] turns one or two keyframes and a prompt into a short
//! video. The diffusion model is injected as a [`VideoModel`]; results leave
//! through a [`VideoSink`].

pub mod config;
pub mod ddim;
pub mod device_map;
pub mod latent_diffusion;
pub mod loader;
mod loader_factory;
pub mod scaffold;
mod util;

mod clip;
mod conditioning;
mod error;
mod keyframe;
mod model;
mod noise;
mod output;
mod pipeline;
mod replica;

pub use clip::ClipTextEmbedder;
pub use conditioning::ConditioningBundle;
pub use config::{CheckpointLayout, ModelConfig, Resolution};
pub use device_map::*;
pub use error::{Error, ErrorKind, Result};
pub use keyframe::Keyframe;
pub use loader::*;
pub use loader_factory::*;
pub use model::{EncodedFrames, SampleRequest, VideoModel};
pub use noise::SeededNoise;
pub use output::{encode_gif, prompt_slug, DiscardSink, GifSink, VideoSink};
pub use pipeline::{
    GenerationPipeline, GenerationResult, RenderedVideo, DEFAULT_SAVE_FPS, MAX_STEPS,
};
pub use replica::WorkerRank;
pub use util::{select_best_device, video_to_frames};

/// One generation job.
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationRequest {
    pub image: Keyframe,
    /// When present the video interpolates from `image` to this keyframe.
    pub second_image: Option<Keyframe>,
    pub prompt: String,
    pub steps: usize,
    pub cfg_scale: f64,
    pub eta: f64,
    pub frame_stride: i64,
    pub seed: u64,
}

impl GenerationRequest {
    pub const DEFAULT_STEPS: usize = 50;
    pub const DEFAULT_CFG_SCALE: f64 = 7.5;
    pub const DEFAULT_ETA: f64 = 1.0;
    pub const DEFAULT_FRAME_STRIDE: i64 = 3;
    pub const DEFAULT_SEED: u64 = 123;

    pub fn new(image: Keyframe, prompt: impl Into<String>) -> Self {
        Self {
            image,
            second_image: None,
            prompt: prompt.into(),
            steps: Self::DEFAULT_STEPS,
            cfg_scale: Self::DEFAULT_CFG_SCALE,
            eta: Self::DEFAULT_ETA,
            frame_stride: Self::DEFAULT_FRAME_STRIDE,
            seed: Self::DEFAULT_SEED,
        }
    }

    pub fn with_second_image(mut self, image: Keyframe) -> Self {
        self.second_image = Some(image);
        self
    }

    pub fn clamped_steps(&self) -> usize {
        self.steps.min(MAX_STEPS)
    }
}
