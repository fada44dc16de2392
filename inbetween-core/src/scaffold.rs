//! Temporal scaffolding around the keyframes.
//!
//! The sampler only knows the true content of the first and last frames. The
//! scaffold video repeats the keyframes over time so the encoder sees a full
//! clip; afterwards everything between the two ends is thrown away.

use candle_core::Tensor;
use tracing::debug;

use crate::{Error, Result, SeededNoise, VideoModel};

/// Encoded scaffold: latents for every position, hidden states for the ends only.
#[derive(Clone, Debug)]
pub struct EncodedVideo {
    /// (1, C, frames, h, w)
    pub latents: Tensor,
    /// One (1, c, 2, h_l, w_l) tensor per encoder layer: first and last position.
    pub hidden_states: Vec<Tensor>,
}

/// Builds a (1, 3, frames, H, W) clip from fitted (3, H, W) keyframes.
///
/// The first keyframe fills the first `frames / 2` positions and the second the
/// rest. Without a second keyframe the first one fills every position.
pub fn temporal_scaffold(first: &Tensor, second: Option<&Tensor>, frames: usize) -> Result<Tensor> {
    if frames < 2 {
        return Err(Error::Config(format!("need at least 2 frames, got {frames}")));
    }
    let repeat = |frame: &Tensor, times: usize| -> Result<Tensor> {
        Ok(frame.unsqueeze(0)?.unsqueeze(2)?.repeat((1, 1, times, 1, 1))?)
    };
    match second {
        Some(second) => {
            if first.dims() != second.dims() {
                return Err(Error::MalformedInput(format!(
                    "keyframes differ in shape: {:?} vs {:?}",
                    first.dims(),
                    second.dims()
                )));
            }
            let head = frames / 2;
            let front = repeat(first, head)?;
            let back = repeat(second, frames - head)?;
            Ok(Tensor::cat(&[&front, &back], 2)?)
        }
        None => repeat(first, frames),
    }
}

/// Encodes every frame of a (1, 3, T, H, W) clip and keeps the hidden states of
/// positions 0 and T-1 only.
pub fn encode_video(
    model: &dyn VideoModel,
    video: &Tensor,
    noise: &mut SeededNoise,
) -> Result<EncodedVideo> {
    let (batch, channels, frames, height, width) = video.dims5()?;
    let flat = video
        .permute((0, 2, 1, 3, 4))?
        .reshape((batch * frames, channels, height, width))?;
    let encoded = model.encode_frames(&flat, noise)?;

    let latents = unfold_time(&encoded.latents, batch, frames)?;
    let hidden_states = encoded
        .hidden_states
        .iter()
        .map(|hid| {
            let hid = unfold_time(hid, batch, frames)?;
            Ok(Tensor::cat(&[&hid.narrow(2, 0, 1)?, &hid.narrow(2, frames - 1, 1)?], 2)?)
        })
        .collect::<Result<Vec<_>>>()?;
    debug!(
        latents = ?latents.dims(),
        hidden_layers = hidden_states.len(),
        "encoded scaffold"
    );
    Ok(EncodedVideo {
        latents,
        hidden_states,
    })
}

/// (B*T, C, h, w) -> (B, C, T, h, w)
fn unfold_time(tensor: &Tensor, batch: usize, frames: usize) -> Result<Tensor> {
    let (n, c, h, w) = tensor.dims4()?;
    if n != batch * frames {
        return Err(Error::MalformedInput(format!(
            "encoder returned {n} frames, expected {}",
            batch * frames
        )));
    }
    Ok(tensor
        .reshape((batch, frames, c, h, w))?
        .permute((0, 2, 1, 3, 4))?
        .contiguous()?)
}

/// Zeros shaped like `latents` except at the first and last temporal position,
/// which are copied from `latents`.
pub fn boundary_latents(latents: &Tensor) -> Result<Tensor> {
    let (batch, channels, frames, h, w) = latents.dims5()?;
    let first = latents.narrow(2, 0, 1)?;
    let last = latents.narrow(2, frames - 1, 1)?;
    if frames == 2 {
        return Ok(Tensor::cat(&[&first, &last], 2)?);
    }
    let middle = Tensor::zeros(
        (batch, channels, frames - 2, h, w),
        latents.dtype(),
        latents.device(),
    )?;
    Ok(Tensor::cat(&[&first, &middle, &last], 2)?)
}
