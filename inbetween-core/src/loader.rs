use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use hf_hub::api::tokio::Api;
use tracing::{info, warn};

use crate::config::{CheckpointLayout, ModelConfig};
use crate::{Error, Result, VideoModel};

/// Hugging Face repository holding the released interpolation checkpoints.
pub const CHECKPOINT_REPO: &str = "Doubiiu/ToonCrafter";

/// Builds one model architecture from its config and weights.
pub trait Loader: Send + Sync {
    /// Name matched against the config's `target`.
    fn architecture(&self) -> &str;

    fn load(
        &self,
        config: &ModelConfig,
        vb: VarBuilder,
        device: &Device,
    ) -> Result<Arc<dyn VideoModel>>;
}

/// Returns the local weights file, downloading the checkpoint first when it is
/// missing and an API handle is available. One attempt, no mirrors.
pub async fn ensure_checkpoint(layout: &CheckpointLayout, api: Option<&Api>) -> Result<PathBuf> {
    let weights = layout.weights_file();
    if weights.exists() {
        return Ok(weights);
    }

    if let Some(api) = api {
        let dir = layout.checkpoint_dir();
        tokio::fs::create_dir_all(&dir).await?;
        info!(repo = CHECKPOINT_REPO, dir = %dir.display(), "downloading checkpoint");
        let cached = api
            .model(CHECKPOINT_REPO.to_string())
            .get(CheckpointLayout::PICKLE_WEIGHTS)
            .await?;
        // hub cache entries are symlinks into the blob store
        let cached = tokio::fs::canonicalize(&cached).await?;
        let target = dir.join(CheckpointLayout::PICKLE_WEIGHTS);
        if tokio::fs::hard_link(&cached, &target).await.is_err() {
            tokio::fs::copy(&cached, &target).await?;
        }
    } else {
        warn!(path = %weights.display(), "checkpoint missing and downloads are disabled");
    }

    let weights = layout.weights_file();
    if weights.exists() {
        Ok(weights)
    } else {
        Err(Error::MissingCheckpoint(weights))
    }
}

/// Maps safetensors directly; anything else is read as a torch pickle whose
/// tensors live under `state_dict`.
pub fn open_weights(path: &Path, dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("safetensors") => Ok(unsafe {
            VarBuilder::from_mmaped_safetensors(&[path], dtype, device)?
        }),
        _ => {
            let tensors = candle_core::pickle::PthTensors::new(path, Some("state_dict"))?;
            Ok(VarBuilder::from_backend(Box::new(tensors), dtype, device.clone()))
        }
    }
}
