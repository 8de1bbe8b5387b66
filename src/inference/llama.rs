//! Llama-family causal LM on candle.
//!
//! The model weights are immutable after construction; every generation call
//! starts from its own clone of an empty KV cache, so concurrent calls share
//! nothing mutable and the rotary tables are computed once per model.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::llama::{Cache, Config, Llama, LlamaConfig, LlamaEosToks};
use tokenizers::Tokenizer;
use tracing::debug;

use crate::device::dtype_for;
use crate::inference::engine::{
    CancelFlag, GenerationError, PromptTokenizer, SamplingSettings, TextGenerator, TokenId,
};
use crate::inference::model_loader::{LoadedModel, ModelLoadError};

/// `tokenizers` adapter.
pub struct HfTokenizer {
    inner: Tokenizer,
}

impl HfTokenizer {
    pub fn from_file(path: &Path) -> Result<Self, ModelLoadError> {
        let inner =
            Tokenizer::from_file(path).map_err(|e| ModelLoadError::Tokenizer(e.to_string()))?;
        Ok(Self { inner })
    }
}

impl PromptTokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>, GenerationError> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| GenerationError::Tokenize(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, tokens: &[TokenId]) -> Result<String, GenerationError> {
        self.inner
            .decode(tokens, true)
            .map_err(|e| GenerationError::Decode(e.to_string()))
    }
}

/// Sampling generator over a loaded Llama model.
pub struct LlamaGenerator {
    model: Llama,
    config: Config,
    device: Device,
    /// Empty KV cache with the rotary tables precomputed; cloned per call.
    fresh_cache: Cache,
}

impl LlamaGenerator {
    pub fn new(
        model: Llama,
        config: Config,
        device: Device,
        dtype: DType,
    ) -> Result<Self, candle_core::Error> {
        let fresh_cache = Cache::new(true, dtype, &config, &device)?;
        Ok(Self {
            model,
            config,
            device,
            fresh_cache,
        })
    }

    fn is_eos(&self, token: TokenId) -> bool {
        match &self.config.eos_token_id {
            Some(LlamaEosToks::Single(id)) => *id == token,
            Some(LlamaEosToks::Multiple(ids)) => ids.contains(&token),
            None => false,
        }
    }
}

impl TextGenerator for LlamaGenerator {
    /// Returns the prompt followed by the sampled continuation.
    fn generate(
        &self,
        prompt: &[TokenId],
        settings: &SamplingSettings,
        cancel: &CancelFlag,
    ) -> Result<Vec<TokenId>, GenerationError> {
        let mut cache = self.fresh_cache.clone();
        let mut sampler = LogitsProcessor::new(rand::random(), Some(settings.temperature), None);

        let mut tokens = prompt.to_vec();
        let mut index_pos = 0;
        for step in 0..settings.max_new_tokens {
            cancel.check()?;

            // First step feeds the whole prompt; later steps only the new token.
            let context_size = if step > 0 { 1 } else { tokens.len() };
            let context = &tokens[tokens.len().saturating_sub(context_size)..];
            let input = Tensor::new(context, &self.device)?.unsqueeze(0)?;
            let logits = self.model.forward(&input, index_pos, &mut cache)?;
            let logits = logits.squeeze(0)?;
            index_pos += context.len();

            let next = sampler.sample(&logits)?;
            if self.is_eos(next) {
                debug!(step, "End of sequence sampled");
                break;
            }
            tokens.push(next);
        }

        Ok(tokens)
    }
}

/// Build a tokenizer + Llama generator from downloaded artifacts.
///
/// Blocking: reads and memory-maps the weight files.
pub fn build(
    config_path: &Path,
    tokenizer_path: &Path,
    weights: &[PathBuf],
    device: Device,
) -> Result<LoadedModel, ModelLoadError> {
    let raw = std::fs::read(config_path)?;
    let llama_config: LlamaConfig = serde_json::from_slice(&raw)?;
    let config = llama_config.into_config(false);

    let tokenizer = HfTokenizer::from_file(tokenizer_path)?;

    let dtype = dtype_for(&device);
    // SAFETY: the hub cache files are not modified while mapped.
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(weights, dtype, &device)? };
    let model = Llama::load(vb, &config)?;

    Ok(LoadedModel {
        tokenizer: Arc::new(tokenizer),
        generator: Arc::new(LlamaGenerator::new(model, config, device, dtype)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One-layer model with all-zero weights: uniform logits, no EOS.
    fn tiny_generator() -> LlamaGenerator {
        let llama_config: LlamaConfig = serde_json::from_str(
            r#"{
                "hidden_size": 16,
                "intermediate_size": 32,
                "vocab_size": 32,
                "num_hidden_layers": 1,
                "num_attention_heads": 2,
                "num_key_value_heads": 2,
                "rms_norm_eps": 1e-5,
                "max_position_embeddings": 64
            }"#,
        )
        .unwrap();
        let config = llama_config.into_config(false);
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let model = Llama::load(vb, &config).unwrap();
        LlamaGenerator::new(model, config, device, DType::F32).unwrap()
    }

    #[test]
    fn test_each_call_starts_from_an_empty_cache() {
        let generator = tiny_generator();
        let settings = SamplingSettings {
            temperature: 0.8,
            max_new_tokens: 5,
        };
        let prompt = [1, 2, 3];

        for _ in 0..3 {
            let out = generator
                .generate(&prompt, &settings, &CancelFlag::new())
                .unwrap();
            assert!(out.starts_with(&prompt));
            assert_eq!(out.len(), prompt.len() + 5);
        }
    }

    #[test]
    fn test_cancelled_before_first_step() {
        let generator = tiny_generator();
        let settings = SamplingSettings {
            temperature: 0.8,
            max_new_tokens: 5,
        };
        let cancel = CancelFlag::new();
        cancel.cancel();

        assert!(matches!(
            generator.generate(&[1, 2, 3], &settings, &cancel),
            Err(GenerationError::Cancelled)
        ));
    }
}
