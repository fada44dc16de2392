use candle_core::{Device, Tensor};

use crate::Result;

/// Conditioning handed to the sampler.
#[derive(Clone, Debug)]
pub struct ConditioningBundle {
    /// Text and image context joined along the token axis, (1, text + image tokens, dim).
    pub cross_attn: Tensor,
    /// Single-element i64 tensor steering motion speed.
    pub frame_stride: Tensor,
    /// Latent scaffold concatenated to the noisy latents on the channel axis.
    pub concat: Tensor,
}

impl ConditioningBundle {
    pub fn new(
        text_emb: &Tensor,
        image_emb: &Tensor,
        frame_stride: i64,
        concat: Tensor,
        device: &Device,
    ) -> Result<Self> {
        let cross_attn = Tensor::cat(&[text_emb, &image_emb.to_dtype(text_emb.dtype())?], 1)?;
        let frame_stride = Tensor::new(&[frame_stride], device)?;
        Ok(Self {
            cross_attn,
            frame_stride,
            concat,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn text_precedes_image_tokens() -> Result<()> {
        let device = Device::Cpu;
        let text = Tensor::ones((1, 77, 8), DType::F32, &device)?;
        let image = Tensor::zeros((1, 16, 8), DType::F32, &device)?;
        let concat = Tensor::zeros((1, 4, 16, 2, 2), DType::F32, &device)?;
        let bundle = ConditioningBundle::new(&text, &image, 3, concat, &device)?;
        assert_eq!(bundle.cross_attn.dims(), &[1, 93, 8]);
        let firsts = bundle.cross_attn.narrow(1, 76, 2)?.narrow(2, 0, 1)?.flatten_all()?;
        assert_eq!(firsts.to_vec1::<f32>()?, vec![1.0, 0.0]);
        assert_eq!(bundle.frame_stride.to_vec1::<i64>()?, vec![3]);
        Ok(())
    }

    #[test]
    fn mismatched_feature_dims_fail() -> Result<()> {
        let device = Device::Cpu;
        let text = Tensor::ones((1, 77, 8), DType::F32, &device)?;
        let image = Tensor::zeros((1, 16, 4), DType::F32, &device)?;
        let concat = Tensor::zeros((1, 4, 16, 2, 2), DType::F32, &device)?;
        assert!(ConditioningBundle::new(&text, &image, 3, concat, &device).is_err());
        Ok(())
    }
}
