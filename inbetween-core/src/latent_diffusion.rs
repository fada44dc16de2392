//! A [`VideoModel`] assembled from the usual latent-diffusion parts.
//!
//! The networks stay opaque: the encoder/decoder, denoiser and embedders are
//! plugged in through small traits, while this module owns the glue between
//! them (posterior sampling, latent scaling, hybrid conditioning and guided
//! DDIM sampling).

use candle_core::{DType, Device, Tensor};
use tracing::debug;

use crate::config::{ModelConfig, UncondType};
use crate::ddim::{guide, DdimSchedule};
use crate::{EncodedFrames, Error, Result, SampleRequest, SeededNoise, VideoModel};

/// Diagonal Gaussian posterior over latents plus the encoder's intermediate activations.
#[derive(Clone, Debug)]
pub struct Posterior {
    pub mean: Tensor,
    pub logvar: Tensor,
    pub hidden_states: Vec<Tensor>,
}

/// Frame autoencoder.
pub trait FirstStage: Send + Sync {
    /// (N, 3, H, W) frames in [-1, 1] to a posterior over (N, C, h, w) latents.
    fn encode(&self, frames: &Tensor) -> Result<Posterior>;

    /// (N, C, h, w) unscaled latents back to (N, 3, H, W) frames. `hidden_states`
    /// hold the encoder activations of the first and last frame of each clip.
    fn decode(&self, latents: &Tensor, hidden_states: &[Tensor], frames: usize) -> Result<Tensor>;
}

/// Noise (or velocity) prediction network.
pub trait Denoiser: Send + Sync {
    /// `xc` is the noisy latent concatenated with the scaffold on the channel axis.
    fn forward(
        &self,
        xc: &Tensor,
        timesteps: &Tensor,
        context: &Tensor,
        frame_stride: &Tensor,
    ) -> Result<Tensor>;
}

pub trait TextEmbedder: Send + Sync {
    /// (prompts, tokens, dim)
    fn embed(&self, prompts: &[&str]) -> Result<Tensor>;
}

/// Image encoder followed by its projection into the text context space.
pub trait ImageEmbedder: Send + Sync {
    fn embed(&self, images: &Tensor) -> Result<Tensor>;
}

pub struct LatentDiffusion<F, D, T, I> {
    first_stage: F,
    denoiser: D,
    text_embedder: T,
    image_embedder: I,
    schedule: DdimSchedule,
    config: ModelConfig,
    device: Device,
}

impl<F, D, T, I> LatentDiffusion<F, D, T, I>
where
    F: FirstStage,
    D: Denoiser,
    T: TextEmbedder,
    I: ImageEmbedder,
{
    pub fn new(
        config: ModelConfig,
        first_stage: F,
        denoiser: D,
        text_embedder: T,
        image_embedder: I,
        device: Device,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            schedule: DdimSchedule::new(&config.diffusion),
            first_stage,
            denoiser,
            text_embedder,
            image_embedder,
            config,
            device,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Context used for the unconditional branch of classifier-free guidance.
    fn unconditional_context(&self, request: &SampleRequest<'_>) -> Result<Tensor> {
        let cond = &request.conditioning.cross_attn;
        let (_, _, _, h, w) = request.shape;
        let text = match self.config.diffusion.uncond_type {
            UncondType::EmptySeq => self.text_embedder.embed(&[""])?,
            UncondType::ZeroEmbed => {
                let text = self.text_embedder.embed(&[""])?;
                text.zeros_like()?
            }
        };
        let blank = Tensor::zeros((1, 3, h * 8, w * 8), DType::F32, &self.device)?;
        let image = self.image_embedder.embed(&blank)?;
        let uc = Tensor::cat(&[&text.to_dtype(cond.dtype())?, &image.to_dtype(cond.dtype())?], 1)?;
        if uc.dims() != cond.dims() {
            return Err(Error::MalformedInput(format!(
                "unconditional context {:?} does not match conditional context {:?}",
                uc.dims(),
                cond.dims()
            )));
        }
        Ok(uc)
    }
}

impl<F, D, T, I> VideoModel for LatentDiffusion<F, D, T, I>
where
    F: FirstStage,
    D: Denoiser,
    T: TextEmbedder,
    I: ImageEmbedder,
{
    fn temporal_length(&self) -> usize {
        self.config.temporal_length
    }

    fn latent_channels(&self) -> usize {
        self.config.latent_channels
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn encode_frames(&self, frames: &Tensor, noise: &mut SeededNoise) -> Result<EncodedFrames> {
        let posterior = self.first_stage.encode(frames)?;
        let std = (posterior.logvar.clamp(-30f32, 20f32)? * 0.5)?.exp()?;
        let eps = noise.randn_like(&posterior.mean)?;
        let latents = ((posterior.mean + (std * eps)?)? * self.config.scale_factor)?;
        Ok(EncodedFrames {
            latents,
            hidden_states: posterior.hidden_states,
        })
    }

    fn embed_text(&self, prompt: &str) -> Result<Tensor> {
        self.text_embedder.embed(&[prompt])
    }

    fn embed_image(&self, image: &Tensor) -> Result<Tensor> {
        self.image_embedder.embed(image)
    }

    fn sample(&self, request: &SampleRequest<'_>, noise: &mut SeededNoise) -> Result<Tensor> {
        let (_, c, t, h, w) = request.shape;
        let batch = request.total_batch()?;
        let cond = request.conditioning;
        let guided = request.cfg_scale != 1.0;
        let uc = if guided {
            Some(self.unconditional_context(request)?)
        } else {
            None
        };
        let rescale = self.config.diffusion.guidance_rescale;
        let dtype = cond.concat.dtype();

        let x_t = noise.randn((batch, c, t, h, w), &self.device)?.to_dtype(dtype)?;
        debug!(shape = ?x_t.dims(), steps = request.steps, guided, "ddim sampling");
        self.schedule
            .sample(x_t, request.steps, request.eta, noise, |x, step| {
                let timesteps = Tensor::full(step.timestep as f32, batch, &self.device)?;
                let xc = Tensor::cat(&[x, &cond.concat], 1)?;
                let e_cond =
                    self.denoiser
                        .forward(&xc, &timesteps, &cond.cross_attn, &cond.frame_stride)?;
                match &uc {
                    Some(uc) => {
                        let e_uncond =
                            self.denoiser
                                .forward(&xc, &timesteps, uc, &cond.frame_stride)?;
                        guide(&e_cond, &e_uncond, request.cfg_scale, rescale)
                    }
                    None => Ok(e_cond),
                }
            })
    }

    fn decode(&self, latents: &Tensor, hidden_states: &[Tensor]) -> Result<Tensor> {
        let (b, c, t, h, w) = latents.dims5()?;
        let z = (latents / self.config.scale_factor)?
            .permute((0, 2, 1, 3, 4))?
            .reshape((b * t, c, h, w))?;
        let frames = self.first_stage.decode(&z, hidden_states, t)?;
        let (_, channels, height, width) = frames.dims4()?;
        Ok(frames
            .reshape((b, t, channels, height, width))?
            .permute((0, 2, 1, 3, 4))?
            .contiguous()?)
    }
}
