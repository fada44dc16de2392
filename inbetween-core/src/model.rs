use candle_core::{Device, Tensor};

use crate::{ConditioningBundle, Error, Result, SeededNoise};

/// Per-frame encoder output.
#[derive(Clone, Debug)]
pub struct EncodedFrames {
    /// (N, C, h, w) latents, already scaled for the denoiser.
    pub latents: Tensor,
    /// Intermediate encoder activations, one (N, c, h_l, w_l) tensor per layer.
    pub hidden_states: Vec<Tensor>,
}

/// Everything the guided sampler needs for one request.
///
/// The encoder's hidden states are not part of sampling; they reach the
/// decoder through [`VideoModel::decode`].
#[derive(Debug)]
pub struct SampleRequest<'a> {
    /// (batch_size, channels, frames, h, w) of one sample's latents.
    pub shape: (usize, usize, usize, usize, usize),
    pub conditioning: &'a ConditioningBundle,
    pub steps: usize,
    pub cfg_scale: f64,
    pub eta: f64,
    pub batch_size: usize,
    /// Samples drawn per batch entry.
    pub n_samples: usize,
}

impl SampleRequest<'_> {
    /// Rows of the latent tensor the sampler produces.
    pub fn total_batch(&self) -> Result<usize> {
        if self.shape.0 != self.batch_size {
            return Err(Error::MalformedInput(format!(
                "latent shape has batch {} but batch_size is {}",
                self.shape.0, self.batch_size
            )));
        }
        if self.batch_size == 0 || self.n_samples == 0 {
            return Err(Error::MalformedInput(
                "batch_size and n_samples must be at least 1".into(),
            ));
        }
        Ok(self.batch_size * self.n_samples)
    }
}

/// A loaded latent video-diffusion model.
///
/// Weights are read-only for the lifetime of the model, so one instance can
/// serve any number of independent requests.
pub trait VideoModel: Send + Sync {
    /// Number of frames the model generates at once.
    fn temporal_length(&self) -> usize;

    fn latent_channels(&self) -> usize;

    fn device(&self) -> &Device;

    /// Encodes (N, 3, H, W) frames in [-1, 1].
    fn encode_frames(&self, frames: &Tensor, noise: &mut SeededNoise) -> Result<EncodedFrames>;

    /// (1, tokens, dim) context for a prompt.
    fn embed_text(&self, prompt: &str) -> Result<Tensor>;

    /// (1, tokens, dim) context for a (1, 3, H, W) image in [-1, 1], at any size.
    fn embed_image(&self, image: &Tensor) -> Result<Tensor>;

    /// Runs guided diffusion sampling and returns latents of `request.shape`.
    fn sample(&self, request: &SampleRequest<'_>, noise: &mut SeededNoise) -> Result<Tensor>;

    /// Decodes (1, C, T, h, w) latents into a (1, 3, T, H, W) video in [-1, 1].
    fn decode(&self, latents: &Tensor, hidden_states: &[Tensor]) -> Result<Tensor>;
}
