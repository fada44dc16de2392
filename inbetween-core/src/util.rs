use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, IndexOp, Tensor};
use image::RgbImage;
use tracing::warn;

use crate::{DeviceMap, Error, Result};

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            {
                warn!("Running on CPU, to run on GPU(metal), build with `--features metal`");
            }
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            {
                warn!("Running on CPU, to run on GPU, build with `--features cuda`");
            }
            Ok(Device::Cpu)
        }
    }
}

/// Converts a tensor with shape (3, height, width) and u8 values into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<RgbImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        return Err(Error::MalformedInput(format!(
            "tensor_to_image expects an image with 3 channels, got {channels}"
        )));
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    RgbImage::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| Error::MalformedInput("error converting tensor to image buffer".into()))
}

/// Splits a decoded video of shape (1, 3, frames, height, width) with values in
/// [-1, 1] into one RGB image per frame.
pub fn video_to_frames(video: &Tensor) -> Result<Vec<RgbImage>> {
    let (batch, _channels, frames, _height, _width) = video.dims5()?;
    if batch != 1 {
        return Err(Error::MalformedInput(format!(
            "expected a single video, got a batch of {batch}"
        )));
    }
    let pixels = ((video.to_dtype(DType::F32)?.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?
        .round()?
        .to_dtype(DType::U8)?;
    (0..frames)
        .map(|f| tensor_to_image(&pixels.i((0, .., f))?))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_frames_map_range_to_bytes() -> Result<()> {
        let device = Device::Cpu;
        // frame 0 all -1, frame 1 all +1
        let low = Tensor::full(-1f32, (1, 3, 1, 2, 4), &device)?;
        let high = Tensor::full(1f32, (1, 3, 1, 2, 4), &device)?;
        let video = Tensor::cat(&[&low, &high], 2)?;
        let frames = video_to_frames(&video)?;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].dimensions(), (4, 2));
        assert!(frames[0].pixels().all(|p| p.0 == [0, 0, 0]));
        assert!(frames[1].pixels().all(|p| p.0 == [255, 255, 255]));
        Ok(())
    }

    #[test]
    fn out_of_range_values_are_clamped() -> Result<()> {
        let video = Tensor::full(7f32, (1, 3, 1, 1, 1), &Device::Cpu)?;
        let frames = video_to_frames(&video)?;
        assert_eq!(frames[0].get_pixel(0, 0).0, [255, 255, 255]);
        Ok(())
    }

    #[test]
    fn rejects_non_rgb_tensors() -> Result<()> {
        let img = Tensor::zeros((1, 2, 2), DType::U8, &Device::Cpu)?;
        assert!(matches!(tensor_to_image(&img), Err(Error::MalformedInput(_))));
        Ok(())
    }
}
