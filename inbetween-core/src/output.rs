//! Where generated videos end up.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use candle_core::Tensor;
use image::codecs::gif::{GifEncoder, Repeat};
use image::{Delay, DynamicImage, Frame};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::util::video_to_frames;
use crate::Result;

const MAX_SLUG_CHARS: usize = 40;
const EMPTY_PROMPT_SLUG: &str = "empty_prompt";

/// Turns a prompt into a file name stem.
pub fn prompt_slug(prompt: &str) -> String {
    let slug: String = prompt
        .replace('/', "_slash_")
        .replace(' ', "_")
        .chars()
        .take(MAX_SLUG_CHARS)
        .collect();
    if slug.is_empty() {
        EMPTY_PROMPT_SLUG.to_string()
    } else {
        slug
    }
}

/// Persists a decoded (1, 3, T, H, W) video in [-1, 1].
pub trait VideoSink: Send + Sync {
    fn output_path(&self, slug: &str) -> PathBuf;

    /// Stores an already encoded GIF under `slug`.
    fn save_encoded(&self, gif: &[u8], slug: &str) -> Result<PathBuf>;

    fn save(&self, video: &Tensor, slug: &str, fps: u32) -> Result<PathBuf> {
        self.save_encoded(&encode_gif(video, fps)?, slug)
    }
}

/// Encodes a decoded video as a looping GIF, `1000 / fps` ms per frame.
pub fn encode_gif(video: &Tensor, fps: u32) -> Result<Vec<u8>> {
    let frames = video_to_frames(video)?;
    let delay = Delay::from_numer_denom_ms(1000, fps.max(1));
    let mut bytes = Vec::new();
    {
        let mut encoder = GifEncoder::new(&mut bytes);
        encoder.set_repeat(Repeat::Infinite)?;
        encoder.encode_frames(frames.into_iter().map(|rgb| {
            Frame::from_parts(DynamicImage::ImageRgb8(rgb).into_rgba8(), 0, 0, delay)
        }))?;
    }
    Ok(bytes)
}

/// Writes looping animated GIFs into a result directory.
#[derive(Clone, Debug)]
pub struct GifSink {
    result_dir: PathBuf,
}

impl GifSink {
    pub fn new(result_dir: impl Into<PathBuf>) -> Self {
        Self {
            result_dir: result_dir.into(),
        }
    }
}

impl VideoSink for GifSink {
    fn output_path(&self, slug: &str) -> PathBuf {
        self.result_dir.join(format!("{slug}.gif"))
    }

    /// Each call writes its own temporary file and moves it into place, so
    /// concurrent saves under one slug never interleave; the last one wins.
    fn save_encoded(&self, gif: &[u8], slug: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.result_dir)?;
        let path = self.output_path(slug);
        let mut file = NamedTempFile::new_in(&self.result_dir)?;
        file.write_all(gif)?;
        file.persist(&path).map_err(|e| e.error)?;
        info!(path = %path.display(), bytes = gif.len(), "saved video");
        Ok(path)
    }
}

/// Sink for replicas that compute but must not write: reports the path the
/// coordinating replica will use.
#[derive(Clone, Debug)]
pub struct DiscardSink {
    result_dir: PathBuf,
}

impl DiscardSink {
    pub fn new(result_dir: impl Into<PathBuf>) -> Self {
        Self {
            result_dir: result_dir.into(),
        }
    }
}

impl VideoSink for DiscardSink {
    fn output_path(&self, slug: &str) -> PathBuf {
        self.result_dir.join(format!("{slug}.gif"))
    }

    fn save_encoded(&self, gif: &[u8], slug: &str) -> Result<PathBuf> {
        debug!(bytes = gif.len(), slug, "discarding video on non-coordinating replica");
        Ok(self.output_path(slug))
    }

    fn save(&self, video: &Tensor, slug: &str, _fps: u32) -> Result<PathBuf> {
        debug!(shape = ?video.dims(), slug, "discarding video on non-coordinating replica");
        Ok(self.output_path(slug))
    }
}
