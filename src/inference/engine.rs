//! Generation engine abstractions.
//!
//! An engine is a tokenizer plus a causal language model bound to a device.
//! Both halves sit behind narrow traits so the pipeline never sees the
//! concrete model library, and tests can swap in the stub engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Token ID type.
pub type TokenId = u32;

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("tokenization failed: {0}")]
    Tokenize(String),

    #[error("detokenization failed: {0}")]
    Decode(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("generation worker stopped unexpectedly: {0}")]
    Worker(String),

    #[error("generation did not finish within {0:?}")]
    TimedOut(Duration),

    #[error("generation was cancelled")]
    Cancelled,
}

impl From<candle_core::Error> for GenerationError {
    fn from(e: candle_core::Error) -> Self {
        GenerationError::Inference(e.to_string())
    }
}

/// Knobs handed to a single sampling pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingSettings {
    /// Softmax temperature; always > 0, so sampling is never greedy.
    pub temperature: f64,

    /// Maximum number of tokens to append after the prompt.
    pub max_new_tokens: usize,
}

/// Cooperative stop signal, checked by generators between sampling steps.
///
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Err(`Cancelled`) once the flag is raised.
    pub fn check(&self) -> Result<(), GenerationError> {
        if self.is_cancelled() {
            Err(GenerationError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Converts between text and token IDs.
pub trait PromptTokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>, GenerationError>;
    fn decode(&self, tokens: &[TokenId]) -> Result<String, GenerationError>;
}

/// Runs stochastic generation over a prompt.
///
/// Implementations may return either the continuation alone or the prompt
/// followed by the continuation; callers strip the echoed prefix.
/// `generate` blocks the calling thread for the whole pass and stops early
/// with `Cancelled` once `cancel` is raised.
pub trait TextGenerator: Send + Sync {
    fn generate(
        &self,
        prompt: &[TokenId],
        settings: &SamplingSettings,
        cancel: &CancelFlag,
    ) -> Result<Vec<TokenId>, GenerationError>;
}

/// A loaded tokenizer + model pair bound to a resolved device.
///
/// Created once by the engine loader and shared read-only afterwards.
pub struct EngineHandle {
    model_id: String,
    device: String,
    tokenizer: Arc<dyn PromptTokenizer>,
    generator: Arc<dyn TextGenerator>,
}

impl EngineHandle {
    pub fn new(
        model_id: impl Into<String>,
        device: impl Into<String>,
        tokenizer: Arc<dyn PromptTokenizer>,
        generator: Arc<dyn TextGenerator>,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            device: device.into(),
            tokenizer,
            generator,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Device label, e.g. "cpu" or "cuda:0".
    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn tokenizer(&self) -> &Arc<dyn PromptTokenizer> {
        &self.tokenizer
    }

    pub fn generator(&self) -> &Arc<dyn TextGenerator> {
        &self.generator
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("model_id", &self.model_id)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}
