//! Seeded noise for reproducible sampling.
//!
//! Every random draw made while serving a request goes through one
//! [`SeededNoise`], so identical inputs and seed give identical videos on any
//! backend.

use candle_core::{Device, Shape, Tensor};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::Result;

pub struct SeededNoise {
    rng: ChaCha8Rng,
}

impl SeededNoise {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Two independent standard normal samples via Box-Muller.
    fn next_gaussian(&mut self) -> (f32, f32) {
        let u1 = loop {
            let x: f32 = self.rng.gen();
            if x > 1e-7 {
                break x;
            }
        };
        let u2: f32 = self.rng.gen();

        let mag = (-2.0 * u1.ln()).sqrt();
        let angle = 2.0 * std::f32::consts::PI * u2;
        (mag * angle.cos(), mag * angle.sin())
    }

    /// Standard normal tensor of the given shape, f32.
    pub fn randn(&mut self, shape: impl Into<Shape>, device: &Device) -> Result<Tensor> {
        let shape = shape.into();
        let elem_count = shape.elem_count();
        let mut data = Vec::with_capacity(elem_count + 1);
        while data.len() < elem_count {
            let (z0, z1) = self.next_gaussian();
            data.push(z0);
            data.push(z1);
        }
        data.truncate(elem_count);
        Ok(Tensor::from_vec(data, shape, device)?)
    }

    pub fn randn_like(&mut self, tensor: &Tensor) -> Result<Tensor> {
        self.randn(tensor.shape().clone(), tensor.device())?
            .to_dtype(tensor.dtype())
            .map_err(Into::into)
    }
}
