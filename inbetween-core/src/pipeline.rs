use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use candle_core::Tensor;
use tracing::{debug, info};

use crate::scaffold::{boundary_latents, encode_video, temporal_scaffold};
use crate::{
    prompt_slug, ConditioningBundle, Error, GenerationRequest, Resolution, Result, SampleRequest,
    SeededNoise, VideoModel, VideoSink,
};

/// Upper bound on sampling steps; larger requests are clamped silently.
pub const MAX_STEPS: usize = 60;

pub const DEFAULT_SAVE_FPS: u32 = 8;

/// A generated video and where it was stored.
#[derive(Clone, Debug)]
pub struct GenerationResult {
    /// (1, 3, frames, height, width) in [-1, 1].
    pub video: Tensor,
    pub slug: String,
    pub path: PathBuf,
}

/// Video before it has been handed to a sink.
#[derive(Clone, Debug)]
pub struct RenderedVideo {
    pub video: Tensor,
    pub slug: String,
}

/// Turns keyframes and a prompt into a video with a loaded model.
///
/// Holds nothing but the model and the target resolution, so one pipeline can
/// serve any number of requests.
#[derive(Clone)]
pub struct GenerationPipeline {
    model: Arc<dyn VideoModel>,
    resolution: Resolution,
    save_fps: u32,
}

impl GenerationPipeline {
    pub fn new(model: Arc<dyn VideoModel>, resolution: Resolution) -> Self {
        Self {
            model,
            resolution,
            save_fps: DEFAULT_SAVE_FPS,
        }
    }

    pub fn with_save_fps(mut self, fps: u32) -> Self {
        self.save_fps = fps;
        self
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn save_fps(&self) -> u32 {
        self.save_fps
    }

    /// Renders the request and hands the video to `sink`. Nothing is written
    /// unless rendering succeeds.
    pub fn generate(
        &self,
        request: &GenerationRequest,
        sink: &dyn VideoSink,
    ) -> Result<GenerationResult> {
        let start = Instant::now();
        let RenderedVideo { video, slug } = self.render(request)?;
        let path = sink.save(&video, &slug, self.save_fps)?;
        info!(
            slug = %slug,
            elapsed_secs = start.elapsed().as_secs_f64(),
            "generation finished"
        );
        Ok(GenerationResult { video, slug, path })
    }

    pub fn render(&self, request: &GenerationRequest) -> Result<RenderedVideo> {
        let model = self.model.as_ref();
        let device = model.device();
        let frames = model.temporal_length();
        let steps = request.clamped_steps();
        if steps == 0 {
            return Err(Error::MalformedInput("step count must be at least 1".into()));
        }
        let (latent_h, latent_w) = self.resolution.latent_size();
        info!(
            prompt = %request.prompt,
            steps,
            keyframes = 1 + request.second_image.is_some() as usize,
            seed = request.seed,
            "generation started"
        );

        let mut noise = SeededNoise::new(request.seed);

        let first = request.image.fit_to(self.resolution, device)?;
        let second = request
            .second_image
            .as_ref()
            .map(|image| image.fit_to(self.resolution, device))
            .transpose()?;
        let clip = temporal_scaffold(&first, second.as_ref(), frames)?;
        let encoded = encode_video(model, &clip, &mut noise)?;
        let scaffold = boundary_latents(&encoded.latents)?;

        let text_emb = model.embed_text(&request.prompt)?;
        let image_emb = model.embed_image(&request.image.to_tensor(device)?.unsqueeze(0)?)?;
        let conditioning =
            ConditioningBundle::new(&text_emb, &image_emb, request.frame_stride, scaffold, device)?;
        debug!(cross_attn = ?conditioning.cross_attn.dims(), "conditioning ready");

        let sample_request = SampleRequest {
            shape: (1, model.latent_channels(), frames, latent_h, latent_w),
            conditioning: &conditioning,
            steps,
            cfg_scale: request.cfg_scale,
            eta: request.eta,
            batch_size: 1,
            n_samples: 1,
        };
        let latents = model.sample(&sample_request, &mut noise)?;
        let mut video = model.decode(&latents, &encoded.hidden_states)?;

        // a lone keyframe is repeated at both ends, so the last frame duplicates the first
        if request.second_image.is_none() {
            let t = video.dim(2)?;
            video = video.narrow(2, 0, t - 1)?;
        }

        Ok(RenderedVideo {
            video,
            slug: prompt_slug(&request.prompt),
        })
    }
}
