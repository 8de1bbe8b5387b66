//! Completion pipeline: one prompt + knobs in, one completion (or a
//! structured error) out.
//!
//! Each call is a stateless transaction over the shared engine. Validation
//! happens before the engine is touched, knobs are clamped into range, and
//! the blocking sampling pass runs on a worker thread.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::inference::engine::{
    CancelFlag, EngineHandle, GenerationError, SamplingSettings, TokenId,
};
use crate::inference::loader::EngineLoader;
use crate::inference::model_loader::ModelLoadError;

pub const MAX_TEMPERATURE: f64 = 2.0;
/// Stand-in for non-positive temperatures; the valid range is open at zero.
pub const TEMPERATURE_FLOOR: f64 = 0.01;
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const MIN_MAX_LENGTH: usize = 50;
pub const MAX_MAX_LENGTH: usize = 1024;
pub const DEFAULT_MAX_LENGTH: usize = 512;

/// Sampling knobs, always within range.
///
/// `max_length` is the budget of newly generated tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GenerationParameters {
    temperature: f64,
    max_length: usize,
}

impl GenerationParameters {
    /// Clamp UI-originated values into range instead of rejecting them.
    pub fn new(temperature: f64, max_length: i64) -> Self {
        let temperature = if temperature.is_nan() {
            DEFAULT_TEMPERATURE
        } else if temperature <= 0.0 {
            TEMPERATURE_FLOOR
        } else {
            temperature.min(MAX_TEMPERATURE)
        };

        let max_length = if max_length <= 0 {
            MIN_MAX_LENGTH
        } else {
            usize::try_from(max_length)
                .unwrap_or(MAX_MAX_LENGTH)
                .clamp(MIN_MAX_LENGTH, MAX_MAX_LENGTH)
        };

        Self {
            temperature,
            max_length,
        }
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            max_length: DEFAULT_MAX_LENGTH,
        }
    }
}

/// Word statistics as shown in the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WordCounts {
    pub input: usize,
    pub generated: usize,
    pub total: usize,
}

/// A successful completion.
#[derive(Debug, Clone)]
pub struct Completion {
    request_id: Uuid,
    prompt: String,
    generated_text: String,
    input_length: usize,
    output_length: usize,
    parameters: GenerationParameters,
}

impl Completion {
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// The continuation only; never includes the prompt.
    pub fn generated_text(&self) -> &str {
        &self.generated_text
    }

    /// Prompt length in tokens.
    pub fn input_length(&self) -> usize {
        self.input_length
    }

    /// Generated length in tokens.
    pub fn output_length(&self) -> usize {
        self.output_length
    }

    pub fn parameters(&self) -> GenerationParameters {
        self.parameters
    }

    /// Prompt and continuation joined for display.
    pub fn full_text(&self) -> String {
        format!("{} {}", self.prompt, self.generated_text)
    }

    pub fn word_counts(&self) -> WordCounts {
        let input = self.prompt.split_whitespace().count();
        let generated = self.generated_text.split_whitespace().count();
        WordCounts {
            input,
            generated,
            total: self.full_text().split_whitespace().count(),
        }
    }
}

/// Stable identifiers for the failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    EmptyPrompt,
    ModelLoad,
    Generation,
}

#[derive(Error, Debug)]
pub enum CompletionError {
    #[error("Please enter some text before generating a completion.")]
    EmptyPrompt,

    #[error("Error loading model: {0}")]
    ModelLoad(#[from] ModelLoadError),

    #[error("Error generating completion: {0}. Try reducing the max length.")]
    Generation(#[from] GenerationError),
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::EmptyPrompt => "empty_prompt",
            ErrorKind::ModelLoad => "model_load",
            ErrorKind::Generation => "generation",
        }
    }
}

const MODEL_LOAD_HINTS: &[&str] = &[
    "Check your internet connection; the model is downloaded on first use.",
    "Make sure at least 5GB of disk space is free for the model files.",
    "Make sure at least 4GB of RAM is available.",
];

impl CompletionError {
    /// Troubleshooting steps shown alongside the message.
    pub fn hints(&self) -> &'static [&'static str] {
        match self {
            CompletionError::ModelLoad(_) => MODEL_LOAD_HINTS,
            _ => &[],
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CompletionError::EmptyPrompt => ErrorKind::EmptyPrompt,
            CompletionError::ModelLoad(_) => ErrorKind::ModelLoad,
            CompletionError::Generation(_) => ErrorKind::Generation,
        }
    }
}

/// Drop the prompt tokens from the front of `output` if the engine echoed them.
pub fn strip_echo<'a>(prompt: &[TokenId], output: &'a [TokenId]) -> &'a [TokenId] {
    output.strip_prefix(prompt).unwrap_or(output)
}

struct GenerationOutput {
    text: String,
    input_length: usize,
    output_length: usize,
}

fn run_generation(
    engine: &EngineHandle,
    prompt: &str,
    settings: &SamplingSettings,
    cancel: &CancelFlag,
) -> Result<GenerationOutput, GenerationError> {
    let prompt_ids = engine.tokenizer().encode(prompt)?;
    let output = engine.generator().generate(&prompt_ids, settings, cancel)?;
    let continuation = strip_echo(&prompt_ids, &output);
    let text = engine.tokenizer().decode(continuation)?;

    Ok(GenerationOutput {
        text: text.trim().to_string(),
        input_length: prompt_ids.len(),
        output_length: continuation.len(),
    })
}

/// Raises the flag when the request stops waiting for its worker.
struct CancelOnDrop(CancelFlag);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Turns prompts into completions over the memoized engine.
pub struct CompletionPipeline {
    loader: Arc<EngineLoader>,
    timeout: Option<Duration>,
    workers: Option<Arc<Semaphore>>,
}

impl CompletionPipeline {
    pub fn new(loader: Arc<EngineLoader>, timeout: Option<Duration>) -> Self {
        Self {
            loader,
            timeout,
            workers: None,
        }
    }

    /// Allow at most `limit` generation workers at once; further requests
    /// queue. A worker holds its slot until it has actually stopped, even
    /// after its request timed out.
    pub fn with_max_concurrent(mut self, limit: usize) -> Self {
        self.workers = Some(Arc::new(Semaphore::new(limit.max(1))));
        self
    }

    pub fn loader(&self) -> &Arc<EngineLoader> {
        &self.loader
    }

    /// The shared engine, loading it on first use.
    pub async fn engine(&self) -> Result<Arc<EngineHandle>, ModelLoadError> {
        self.loader.get_engine().await
    }

    /// Generate a continuation of `prompt`.
    ///
    /// Sampling is stochastic: identical inputs may produce different text.
    pub async fn complete(
        &self,
        prompt: &str,
        params: GenerationParameters,
    ) -> Result<Completion, CompletionError> {
        if prompt.trim().is_empty() {
            return Err(CompletionError::EmptyPrompt);
        }

        let request_id = Uuid::new_v4();
        let preview: String = prompt.chars().take(50).collect();
        info!(
            %request_id,
            prompt = %preview,
            temperature = params.temperature(),
            max_length = params.max_length(),
            "Generating completion"
        );

        let engine = self.engine().await?;
        let start = Instant::now();

        let settings = SamplingSettings {
            temperature: params.temperature(),
            max_new_tokens: params.max_length(),
        };
        let permit = match &self.workers {
            Some(workers) => Some(
                workers
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| GenerationError::Worker(e.to_string()))?,
            ),
            None => None,
        };

        let cancel = CancelFlag::new();
        let worker_cancel = cancel.clone();
        let _cancel_on_drop = CancelOnDrop(cancel);
        let worker_prompt = prompt.to_string();
        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            run_generation(&engine, &worker_prompt, &settings, &worker_cancel)
        });

        let joined = match self.timeout {
            // On timeout the worker is cancelled and stops at its next step.
            Some(limit) => match tokio::time::timeout(limit, task).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(%request_id, ?limit, "Generation timed out, cancelling worker");
                    return Err(GenerationError::TimedOut(limit).into());
                }
            },
            None => task.await,
        };

        let output = match joined.map_err(|e| GenerationError::Worker(e.to_string()))? {
            Ok(output) => output,
            Err(e) => {
                warn!(%request_id, "Generation failed: {e}");
                return Err(e.into());
            }
        };

        info!(
            %request_id,
            input_tokens = output.input_length,
            output_tokens = output.output_length,
            chars = output.text.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Completion generated"
        );

        Ok(Completion {
            request_id,
            prompt: prompt.to_string(),
            generated_text: output.text,
            input_length: output.input_length,
            output_length: output.output_length,
            parameters: params,
        })
    }
}
