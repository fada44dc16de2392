//! Deterministic stand-in for a diffusion model.
#![allow(dead_code)]

use std::sync::Mutex;

use candle_core::{DType, Device, Tensor};
use inbetween_core::{EncodedFrames, Keyframe, Result, SampleRequest, SeededNoise, VideoModel};

pub const LATENT_CHANNELS: usize = 4;

/// What the pipeline handed to `sample`.
#[derive(Clone, Debug)]
pub struct SampleCall {
    pub shape: (usize, usize, usize, usize, usize),
    pub steps: usize,
    pub cfg_scale: f64,
    pub eta: f64,
    pub batch_size: usize,
    pub n_samples: usize,
    pub concat: Tensor,
    pub cross_attn_dims: Vec<usize>,
    pub frame_stride: Vec<i64>,
}

pub struct StubModel {
    frames: usize,
    device: Device,
    pub samples: Mutex<Vec<SampleCall>>,
    pub embedded_images: Mutex<Vec<Vec<usize>>>,
    /// Hidden state shapes handed to each `decode` call.
    pub decoded_hidden_states: Mutex<Vec<Vec<Vec<usize>>>>,
}

impl StubModel {
    pub fn new(frames: usize) -> Self {
        Self {
            frames,
            device: Device::Cpu,
            samples: Mutex::new(Vec::new()),
            embedded_images: Mutex::new(Vec::new()),
            decoded_hidden_states: Mutex::new(Vec::new()),
        }
    }

    pub fn last_sample(&self) -> SampleCall {
        self.samples.lock().unwrap().last().cloned().expect("sample was called")
    }

    /// Latents: 8x8 patch means of the RGB channels plus a constant channel.
    pub fn encode(frames: &Tensor) -> Result<Tensor> {
        let pooled = frames.avg_pool2d(8)?;
        let (n, _, h, w) = pooled.dims4()?;
        let ones = Tensor::ones((n, 1, h, w), pooled.dtype(), pooled.device())?;
        Ok(Tensor::cat(&[&pooled, &ones], 1)?)
    }
}

impl VideoModel for StubModel {
    fn temporal_length(&self) -> usize {
        self.frames
    }

    fn latent_channels(&self) -> usize {
        LATENT_CHANNELS
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn encode_frames(&self, frames: &Tensor, _noise: &mut SeededNoise) -> Result<EncodedFrames> {
        Ok(EncodedFrames {
            latents: Self::encode(frames)?,
            hidden_states: vec![frames.avg_pool2d(4)?, frames.avg_pool2d(2)?],
        })
    }

    fn embed_text(&self, prompt: &str) -> Result<Tensor> {
        Ok(Tensor::full(prompt.len() as f32, (1, 6, 8), &self.device)?)
    }

    fn embed_image(&self, image: &Tensor) -> Result<Tensor> {
        self.embedded_images.lock().unwrap().push(image.dims().to_vec());
        let mean = image.mean_all()?.to_scalar::<f32>()?;
        Ok(Tensor::full(mean, (1, 2, 8), &self.device)?)
    }

    fn sample(&self, request: &SampleRequest<'_>, noise: &mut SeededNoise) -> Result<Tensor> {
        let cond = request.conditioning;
        self.samples.lock().unwrap().push(SampleCall {
            shape: request.shape,
            steps: request.steps,
            cfg_scale: request.cfg_scale,
            eta: request.eta,
            batch_size: request.batch_size,
            n_samples: request.n_samples,
            concat: cond.concat.clone(),
            cross_attn_dims: cond.cross_attn.dims().to_vec(),
            frame_stride: cond.frame_stride.to_vec1::<i64>()?,
        });
        let (_, c, t, h, w) = request.shape;
        let b = request.total_batch()?;
        let x = (noise.randn((b, c, t, h, w), &self.device)? * 0.1)?;
        Ok((x + &cond.concat)?)
    }

    fn decode(&self, latents: &Tensor, hidden_states: &[Tensor]) -> Result<Tensor> {
        self.decoded_hidden_states
            .lock()
            .unwrap()
            .push(hidden_states.iter().map(|h| h.dims().to_vec()).collect());
        let (b, _, t, h, w) = latents.dims5()?;
        let rgb = latents
            .narrow(1, 0, 3)?
            .permute((0, 2, 1, 3, 4))?
            .reshape((b * t, 3, h, w))?
            .upsample_nearest2d(h * 8, w * 8)?;
        Ok(rgb
            .reshape((b, t, 3, h * 8, w * 8))?
            .permute((0, 2, 1, 3, 4))?
            .contiguous()?)
    }
}

/// Horizontal gradient whose brightness is shifted by `offset`.
pub fn gradient(height: usize, width: usize, offset: u8) -> Keyframe {
    let pixels = (0..height)
        .flat_map(|_| (0..width).flat_map(move |x| {
            let v = ((x * 255 / width.max(1)) as u8).saturating_add(offset);
            [v, v / 2, 255 - v]
        }))
        .collect();
    Keyframe::from_raw(height, width, pixels).expect("valid keyframe")
}

pub fn values(t: &Tensor) -> Vec<f32> {
    t.to_dtype(DType::F32)
        .and_then(|t| t.flatten_all())
        .and_then(|t| t.to_vec1::<f32>())
        .expect("readable tensor")
}
