//! OpenCLIP ViT-H text tower used for prompt conditioning.

use candle_core::{DType, Device, Tensor};
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::clip::{ClipTextTransformer, Config};
use hf_hub::api::tokio::Api;
use tokenizers::Tokenizer;

use crate::latent_diffusion::TextEmbedder;
use crate::{Error, Result};

const TEXT_ENCODER_REPO: &str = "stabilityai/stable-diffusion-2-1";
const TOKENIZER_REPO: &str = "openai/clip-vit-large-patch14";

pub struct ClipTextEmbedder {
    model: ClipTextTransformer,
    tokenizer: Tokenizer,
    max_len: usize,
    pad_id: u32,
    device: Device,
}

impl ClipTextEmbedder {
    pub async fn load(api: &Api, device: &Device, dtype: DType) -> Result<Self> {
        let config = Config::v2_1();

        let model_file = api
            .model(TEXT_ENCODER_REPO.to_string())
            .get("text_encoder/model.safetensors")
            .await?;
        let vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[model_file], dtype, device)?
        };
        let model = ClipTextTransformer::new(vb, &config)?;

        let tokenizer_file = api
            .model(TOKENIZER_REPO.to_string())
            .get("tokenizer.json")
            .await?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)?;

        Self::from_parts(model, tokenizer, &config, device)
    }

    pub fn from_parts(
        model: ClipTextTransformer,
        tokenizer: Tokenizer,
        config: &Config,
        device: &Device,
    ) -> Result<Self> {
        let pad_token = config.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = *tokenizer
            .get_vocab(true)
            .get(pad_token)
            .ok_or_else(|| Error::Tokenizer(format!("pad token `{pad_token}` not in vocabulary")))?;
        Ok(Self {
            model,
            tokenizer,
            max_len: config.max_position_embeddings,
            pad_id,
            device: device.clone(),
        })
    }

    fn token_ids(&self, prompt: &str) -> Result<Vec<u32>> {
        let tokens = self.tokenizer.encode(prompt, true)?.get_ids().to_vec();
        Ok(pad_tokens(tokens, self.max_len, self.pad_id))
    }
}

impl TextEmbedder for ClipTextEmbedder {
    fn embed(&self, prompts: &[&str]) -> Result<Tensor> {
        let rows = prompts
            .iter()
            .map(|prompt| Ok(Tensor::new(self.token_ids(prompt)?.as_slice(), &self.device)?))
            .collect::<Result<Vec<_>>>()?;
        let input_ids = Tensor::stack(&rows, 0)?;
        Ok(self.model.forward(&input_ids)?)
    }
}

/// Fits a token sequence to exactly `max_len`: long prompts keep their final
/// (end-of-text) token, short ones are padded.
fn pad_tokens(mut tokens: Vec<u32>, max_len: usize, pad_id: u32) -> Vec<u32> {
    if tokens.len() > max_len {
        let last = tokens[tokens.len() - 1];
        tokens.truncate(max_len - 1);
        tokens.push(last);
    }
    tokens.resize(max_len, pad_id);
    tokens
}
