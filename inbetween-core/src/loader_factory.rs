use hf_hub::api::tokio::Api;
use tracing::info;

use crate::config::{CheckpointLayout, ModelConfig};
use crate::{
    ensure_checkpoint, open_weights, select_best_device, DeviceMap, Error, Loader, Result,
    VideoModel,
};
use std::sync::Arc;

/// Architectures this build knows how to construct, keyed by config `target`.
#[derive(Default)]
pub struct LoaderRegistry {
    loaders: Vec<Box<dyn Loader>>,
}

impl LoaderRegistry {
    pub fn register(&mut self, loader: impl Loader + 'static) -> &mut Self {
        self.loaders.push(Box::new(loader));
        self
    }

    pub fn get(&self, architecture: &str) -> Option<&dyn Loader> {
        self.loaders
            .iter()
            .find(|l| l.architecture() == architecture)
            .map(|l| l.as_ref())
    }

    pub fn architectures(&self) -> Vec<&str> {
        self.loaders.iter().map(|l| l.architecture()).collect()
    }
}

/// Load the model for `layout`, downloading the checkpoint through `api` if needed.
pub async fn load_model(
    layout: &CheckpointLayout,
    api: Option<Api>,
    device_map: DeviceMap,
    registry: &LoaderRegistry,
) -> Result<Arc<dyn VideoModel>> {
    let config = ModelConfig::from_file(&layout.config_file())?;
    let loader = registry
        .get(&config.target)
        .ok_or_else(|| Error::UnknownArchitecture(config.target.clone()))?;

    let weights = ensure_checkpoint(layout, api.as_ref()).await?;

    let device = select_best_device(device_map)?;
    let dtype = device.bf16_default_to_f32();
    info!(
        architecture = %config.target,
        weights = %weights.display(),
        resolution = %layout.resolution,
        ?dtype,
        "loading model"
    );

    let vb = open_weights(&weights, dtype, &device)?;
    let model = loader.load(&config, vb, &device)?;
    if model.temporal_length() != config.temporal_length {
        return Err(Error::Config(format!(
            "{} built a model with {} frames, config says {}",
            config.target,
            model.temporal_length(),
            config.temporal_length
        )));
    }
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EncodedFrames, SampleRequest, SeededNoise};
    use candle_core::{Device, Tensor};
    use candle_nn::VarBuilder;
    use std::collections::HashMap;
    use std::path::Path;

    struct Frozen {
        frames: usize,
        device: Device,
    }

    impl VideoModel for Frozen {
        fn temporal_length(&self) -> usize {
            self.frames
        }
        fn latent_channels(&self) -> usize {
            4
        }
        fn device(&self) -> &Device {
            &self.device
        }
        fn encode_frames(&self, _: &Tensor, _: &mut SeededNoise) -> Result<EncodedFrames> {
            Err(Error::Config("frozen".into()))
        }
        fn embed_text(&self, _: &str) -> Result<Tensor> {
            Err(Error::Config("frozen".into()))
        }
        fn embed_image(&self, _: &Tensor) -> Result<Tensor> {
            Err(Error::Config("frozen".into()))
        }
        fn sample(&self, _: &SampleRequest<'_>, _: &mut SeededNoise) -> Result<Tensor> {
            Err(Error::Config("frozen".into()))
        }
        fn decode(&self, _: &Tensor, _: &[Tensor]) -> Result<Tensor> {
            Err(Error::Config("frozen".into()))
        }
    }

    /// Reads one weight to prove the var builder points at the checkpoint.
    struct FrozenLoader;

    impl Loader for FrozenLoader {
        fn architecture(&self) -> &str {
            "frozen"
        }

        fn load(
            &self,
            config: &ModelConfig,
            vb: VarBuilder,
            device: &Device,
        ) -> Result<Arc<dyn VideoModel>> {
            let frames = vb.get(1, "frames")?.to_vec1::<f32>()?[0] as usize;
            assert_eq!(frames, config.temporal_length);
            Ok(Arc::new(Frozen {
                frames,
                device: device.clone(),
            }))
        }
    }

    fn write_config(root: &Path, target: &str) -> CheckpointLayout {
        let layout = CheckpointLayout::new(
            root.join("checkpoints"),
            root.join("configs"),
            "256_256".parse().unwrap(),
        );
        std::fs::create_dir_all(&layout.configs_root).unwrap();
        std::fs::write(
            layout.config_file(),
            format!(r#"{{"target": "{target}", "temporal_length": 16}}"#),
        )
        .unwrap();
        layout
    }

    fn registry() -> LoaderRegistry {
        let mut registry = LoaderRegistry::default();
        registry.register(FrozenLoader);
        registry
    }

    #[tokio::test]
    async fn missing_checkpoint_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let layout = write_config(dir.path(), "frozen");
        let err = load_model(&layout, None, DeviceMap::ForceCpu, &registry())
            .await
            .err()
            .unwrap();
        match err {
            Error::MissingCheckpoint(path) => {
                assert!(path.ends_with("tooncrafter_256_interp_v1/model.ckpt"))
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_architecture_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let layout = write_config(dir.path(), "mystery_unet");
        let err = load_model(&layout, None, DeviceMap::ForceCpu, &registry())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::UnknownArchitecture(name) if name == "mystery_unet"));
    }

    #[tokio::test]
    async fn loads_registered_architecture_from_safetensors() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let layout = write_config(dir.path(), "frozen");
        std::fs::create_dir_all(layout.checkpoint_dir())?;
        let weights = HashMap::from([(
            "frames".to_string(),
            Tensor::new(&[16f32], &Device::Cpu)?,
        )]);
        candle_core::safetensors::save(
            &weights,
            layout.checkpoint_dir().join(CheckpointLayout::SAFETENSORS_WEIGHTS),
        )?;

        let model = load_model(&layout, None, DeviceMap::ForceCpu, &registry()).await?;
        assert_eq!(model.temporal_length(), 16);
        Ok(())
    }

    #[test]
    fn registry_lists_architectures() {
        assert_eq!(registry().architectures(), vec!["frozen"]);
        assert!(registry().get("frozen").is_some());
        assert!(LoaderRegistry::default().get("frozen").is_none());
    }
}
