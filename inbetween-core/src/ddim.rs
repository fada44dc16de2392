//! DDIM sampling schedule and update rule.

use candle_core::Tensor;

use crate::config::{BetaSchedule, DiffusionConfig, Parameterization};
use crate::{Error, Result, SeededNoise};

/// One denoising step from `timestep` to the previous selected timestep.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DdimStep {
    pub timestep: usize,
    pub alpha: f64,
    pub alpha_prev: f64,
    pub sigma: f64,
}

impl DdimStep {
    /// Moves `x` one step towards the data distribution given the network output.
    pub fn apply(
        &self,
        x: &Tensor,
        model_output: &Tensor,
        parameterization: Parameterization,
        noise: &mut SeededNoise,
    ) -> Result<Tensor> {
        let sqrt_a = self.alpha.sqrt();
        let sqrt_one_minus_a = (1.0 - self.alpha).sqrt();
        let (pred_x0, e_t) = match parameterization {
            Parameterization::Eps => {
                let pred_x0 = ((x - (model_output * sqrt_one_minus_a)?)? / sqrt_a)?;
                (pred_x0, model_output.clone())
            }
            Parameterization::V => {
                let pred_x0 = ((x * sqrt_a)? - (model_output * sqrt_one_minus_a)?)?;
                let e_t = ((model_output * sqrt_a)? + (x * sqrt_one_minus_a)?)?;
                (pred_x0, e_t)
            }
        };
        let dir_coeff = (1.0 - self.alpha_prev - self.sigma * self.sigma).max(0.0).sqrt();
        let x_prev = ((pred_x0 * self.alpha_prev.sqrt())? + (e_t * dir_coeff)?)?;
        if self.sigma > 0.0 {
            let z = noise.randn_like(x)?;
            Ok((x_prev + (z * self.sigma)?)?)
        } else {
            Ok(x_prev)
        }
    }
}

#[derive(Clone, Debug)]
pub struct DdimSchedule {
    alphas_cumprod: Vec<f64>,
    parameterization: Parameterization,
}

impl DdimSchedule {
    pub fn new(config: &DiffusionConfig) -> Self {
        let n = config.timesteps;
        let betas: Vec<f64> = match config.beta_schedule {
            BetaSchedule::Linear => {
                let (start, end) = (config.linear_start.sqrt(), config.linear_end.sqrt());
                linspace(start, end, n).into_iter().map(|b| b * b).collect()
            }
            BetaSchedule::SqrtLinear => linspace(config.linear_start, config.linear_end, n),
        };

        let mut cumprod = 1.0;
        let mut alphas_cumprod: Vec<f64> = betas
            .iter()
            .map(|b| {
                cumprod *= 1.0 - b;
                cumprod
            })
            .collect();

        if config.rescale_betas_zero_snr {
            // shift the schedule so the last timestep has zero signal, keeping the first
            let sqrt: Vec<f64> = alphas_cumprod.iter().map(|a| a.sqrt()).collect();
            let (first, last) = (sqrt[0], sqrt[n - 1]);
            alphas_cumprod = sqrt
                .iter()
                .map(|s| {
                    let s = (s - last) * first / (first - last);
                    s * s
                })
                .collect();
        }

        Self {
            alphas_cumprod,
            parameterization: config.parameterization,
        }
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    /// Uniformly spaced training timesteps, ascending.
    pub fn timesteps(&self, steps: usize) -> Result<Vec<usize>> {
        let n = self.alphas_cumprod.len();
        if steps == 0 || steps > n {
            return Err(Error::MalformedInput(format!(
                "step count must be within 1..={n}, got {steps}"
            )));
        }
        let stride = n / steps;
        Ok((0..n).step_by(stride).map(|t| (t + 1).min(n - 1)).collect())
    }

    /// Steps in sampling order (descending timesteps).
    pub fn plan(&self, steps: usize, eta: f64) -> Result<Vec<DdimStep>> {
        let timesteps = self.timesteps(steps)?;
        let mut plan: Vec<DdimStep> = timesteps
            .iter()
            .enumerate()
            .map(|(i, &t)| {
                let alpha = self.alphas_cumprod[t];
                // the final step lands on the cleanest training timestep
                let alpha_prev = if i == 0 {
                    self.alphas_cumprod[0]
                } else {
                    self.alphas_cumprod[timesteps[i - 1]]
                };
                let sigma = if alpha < 1.0 && alpha_prev > 0.0 {
                    eta * ((1.0 - alpha_prev) / (1.0 - alpha) * (1.0 - alpha / alpha_prev))
                        .max(0.0)
                        .sqrt()
                } else {
                    0.0
                };
                DdimStep {
                    timestep: t,
                    alpha,
                    alpha_prev,
                    sigma,
                }
            })
            .collect();
        plan.reverse();
        Ok(plan)
    }

    /// Runs the full reverse process from `x_t`; `predict` returns the network
    /// output for the current latents and timestep.
    pub fn sample<F>(
        &self,
        x_t: Tensor,
        steps: usize,
        eta: f64,
        noise: &mut SeededNoise,
        mut predict: F,
    ) -> Result<Tensor>
    where
        F: FnMut(&Tensor, &DdimStep) -> Result<Tensor>,
    {
        let mut x = x_t;
        for step in self.plan(steps, eta)? {
            let model_output = predict(&x, &step)?;
            x = step.apply(&x, &model_output, self.parameterization, noise)?;
        }
        Ok(x)
    }
}

fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![start];
    }
    (0..n)
        .map(|i| start + (end - start) * i as f64 / (n - 1) as f64)
        .collect()
}

/// Classifier-free guidance: `uncond + scale * (cond - uncond)`, optionally
/// rescaled towards the standard deviation of the conditional prediction.
pub fn guide(cond: &Tensor, uncond: &Tensor, scale: f64, rescale: f64) -> Result<Tensor> {
    let guided = (uncond + ((cond - uncond)? * scale)?)?;
    if rescale <= 0.0 {
        return Ok(guided);
    }
    let std_cond = per_sample_std(cond)?;
    let std_guided = per_sample_std(&guided)?;
    let rescaled = guided.broadcast_mul(&(std_cond / std_guided)?)?;
    Ok(((rescaled * rescale)? + (guided * (1.0 - rescale))?)?)
}

fn per_sample_std(t: &Tensor) -> Result<Tensor> {
    let batch = t.dim(0)?;
    let mut dims = vec![1; t.rank()];
    dims[0] = batch;
    Ok(t.flatten_from(1)?.var_keepdim(1)?.sqrt()?.reshape(dims)?)
}
