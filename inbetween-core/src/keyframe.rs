//! Keyframe images and their conversion into model-ready tensors.

use std::path::Path;

use candle_core::{Device, Tensor};
use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgb32FImage, RgbImage};

use crate::{Error, Resolution, Result};

/// A caller-supplied RGB keyframe, 8 bits per channel.
#[derive(Clone, Debug, PartialEq)]
pub struct Keyframe {
    pixels: RgbImage,
}

impl Keyframe {
    /// Wraps a row-major `height x width x 3` pixel buffer.
    pub fn from_raw(height: usize, width: usize, pixels: Vec<u8>) -> Result<Self> {
        if height == 0 || width == 0 {
            return Err(Error::MalformedInput(format!(
                "keyframe must be non-empty, got {height}x{width}"
            )));
        }
        let expected = height * width * 3;
        if pixels.len() != expected {
            return Err(Error::MalformedInput(format!(
                "expected {height}x{width}x3 = {expected} bytes, got {}",
                pixels.len()
            )));
        }
        let pixels = RgbImage::from_raw(width as u32, height as u32, pixels)
            .ok_or_else(|| Error::MalformedInput("pixel buffer does not fit dimensions".into()))?;
        Ok(Self { pixels })
    }

    pub fn from_image(image: DynamicImage) -> Result<Self> {
        if image.width() == 0 || image.height() == 0 {
            return Err(Error::MalformedInput("keyframe must be non-empty".into()));
        }
        Ok(Self {
            pixels: image.into_rgb8(),
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let image = image::open(path).map_err(|e| {
            Error::MalformedInput(format!("failed to decode {}: {e}", path.display()))
        })?;
        Self::from_image(image)
    }

    pub fn height(&self) -> usize {
        self.pixels.height() as usize
    }

    pub fn width(&self) -> usize {
        self.pixels.width() as usize
    }

    pub fn as_rgb(&self) -> &RgbImage {
        &self.pixels
    }

    /// Full-size tensor of shape (3, height, width) with values in [-1, 1].
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        let data: Vec<f32> = self
            .pixels
            .as_raw()
            .iter()
            .map(|&p| (p as f32 / 255.0 - 0.5) * 2.0)
            .collect();
        hwc_to_chw(data, self.height(), self.width(), device)
    }

    /// Resizes the shorter side to the resolution's shorter side, then center-crops
    /// to exactly `resolution`. Returns (3, height, width) with values in [-1, 1].
    pub fn fit_to(&self, resolution: Resolution, device: &Device) -> Result<Tensor> {
        let (height, width) = scale_shorter_side(
            self.height(),
            self.width(),
            resolution.shorter_side(),
        );
        let unit = DynamicImage::ImageRgb8(self.pixels.clone()).into_rgb32f();
        let resized: Rgb32FImage = if (height, width) == (self.height(), self.width()) {
            unit
        } else {
            imageops::resize(&unit, width as u32, height as u32, FilterType::Triangle)
        };
        let data: Vec<f32> = resized
            .into_raw()
            .into_iter()
            .map(|p| (p - 0.5) * 2.0)
            .collect();
        let tensor = hwc_to_chw(data, height, width, device)?;
        center_crop(&tensor, resolution.height, resolution.width)
    }
}

fn hwc_to_chw(data: Vec<f32>, height: usize, width: usize, device: &Device) -> Result<Tensor> {
    Ok(Tensor::from_vec(data, (height, width, 3), device)?
        .permute((2, 0, 1))?
        .contiguous()?)
}

/// Output size when scaling the shorter side to `target`, truncating the longer one.
fn scale_shorter_side(height: usize, width: usize, target: usize) -> (usize, usize) {
    if height <= width {
        (target, (target * width / height).max(1))
    } else {
        ((target * height / width).max(1), target)
    }
}

/// Half of `excess`, rounding ties to even.
fn centered_offset(excess: usize) -> usize {
    let half = excess / 2;
    if excess % 2 == 1 && half % 2 == 1 {
        half + 1
    } else {
        half
    }
}

/// Crops a (C, H, W) tensor around its center, zero-padding any axis that is too small.
fn center_crop(tensor: &Tensor, height: usize, width: usize) -> Result<Tensor> {
    let (_, h, w) = tensor.dims3()?;
    let mut tensor = tensor.clone();
    if h < height {
        let missing = height - h;
        tensor = tensor.pad_with_zeros(1, missing / 2, missing - missing / 2)?;
    }
    if w < width {
        let missing = width - w;
        tensor = tensor.pad_with_zeros(2, missing / 2, missing - missing / 2)?;
    }
    let (_, h, w) = tensor.dims3()?;
    let top = centered_offset(h - height);
    let left = centered_offset(w - width);
    Ok(tensor.narrow(1, top, height)?.narrow(2, left, width)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(height: usize, width: usize, value: u8) -> Keyframe {
        Keyframe::from_raw(height, width, vec![value; height * width * 3]).unwrap()
    }

    #[test]
    fn rejects_mismatched_buffers() {
        assert!(matches!(
            Keyframe::from_raw(4, 4, vec![0; 4 * 4]),
            Err(Error::MalformedInput(_))
        ));
        assert!(matches!(
            Keyframe::from_raw(0, 4, vec![]),
            Err(Error::MalformedInput(_))
        ));
    }

    #[test]
    fn normalizes_to_unit_range() -> Result<()> {
        let black = solid(2, 2, 0).to_tensor(&Device::Cpu)?;
        let white = solid(2, 2, 255).to_tensor(&Device::Cpu)?;
        assert_eq!(black.dims(), &[3, 2, 2]);
        assert!(black.flatten_all()?.to_vec1::<f32>()?.iter().all(|&v| v == -1.0));
        assert!(white.flatten_all()?.to_vec1::<f32>()?.iter().all(|&v| v == 1.0));
        Ok(())
    }

    #[test]
    fn channel_order_is_preserved() -> Result<()> {
        let kf = Keyframe::from_raw(1, 1, vec![255, 0, 255])?;
        let t = kf.to_tensor(&Device::Cpu)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(t, vec![1.0, -1.0, 1.0]);
        Ok(())
    }

    #[test]
    fn shorter_side_scaling() {
        assert_eq!(scale_shorter_side(480, 640, 256), (256, 341));
        assert_eq!(scale_shorter_side(640, 480, 256), (341, 256));
        assert_eq!(scale_shorter_side(100, 100, 320), (320, 320));
    }

    #[test]
    fn crop_offsets_round_half_to_even() {
        assert_eq!(centered_offset(0), 0);
        assert_eq!(centered_offset(1), 0);
        assert_eq!(centered_offset(3), 2);
        assert_eq!(centered_offset(5), 2);
        assert_eq!(centered_offset(85), 42);
        assert_eq!(centered_offset(4), 2);
    }

    #[test]
    fn fits_landscape_input_to_square() -> Result<()> {
        let res = Resolution::new(256, 256)?;
        let fitted = solid(480, 640, 128).fit_to(res, &Device::Cpu)?;
        assert_eq!(fitted.dims(), &[3, 256, 256]);
        Ok(())
    }

    #[test]
    fn pads_when_aspect_cannot_cover_target() -> Result<()> {
        // portrait input into a landscape target: width ends up 320 < 512
        let res = Resolution::new(320, 512)?;
        let fitted = solid(640, 400, 255).fit_to(res, &Device::Cpu)?;
        assert_eq!(fitted.dims(), &[3, 320, 512]);
        let row = fitted.narrow(1, 0, 1)?.narrow(0, 0, 1)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(row[0], 0.0);
        assert_eq!(row[511], 0.0);
        assert!((row[256] - 1.0).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn center_crop_takes_the_middle() -> Result<()> {
        let t = Tensor::arange(0f32, 5.0, &Device::Cpu)?.reshape((1, 1, 5))?;
        let cropped = center_crop(&t, 1, 3)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(cropped, vec![1.0, 2.0, 3.0]);
        Ok(())
    }
}
