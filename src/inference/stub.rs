//! Offline stub engine.
//!
//! Byte-level tokenizer plus a generator that appends random words, echoing
//! the prompt the way Hugging Face pipelines do. Used by the test suite and
//! by `--stub-engine` to run the UI without downloading a model. Faults and
//! delays can be injected to exercise the loader and pipeline error paths.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use candle_core::Device;
use rand::seq::SliceRandom;

use crate::inference::engine::{
    CancelFlag, GenerationError, PromptTokenizer, SamplingSettings, TextGenerator, TokenId,
};
use crate::inference::model_loader::{LoadedModel, ModelLoadError, ModelSource, ModelSpec};

const WORDS: &[&str] = &[
    "bright", "uncertain", "collaborative", "shaped", "by", "people", "and", "machines",
    "learning", "together", "with", "care", "the", "next", "decade", "will", "tell",
];

#[derive(Default)]
struct StubState {
    loads: AtomicUsize,
    fail_loads: AtomicBool,
    fail_generation: AtomicBool,
    load_delay: Mutex<Duration>,
    generation_delay: Mutex<Duration>,
    last_settings: Mutex<Option<SamplingSettings>>,
    active_generations: AtomicUsize,
    peak_generations: AtomicUsize,
}

/// Counts a generation as running until dropped.
struct ActiveGeneration<'a>(&'a StubState);

impl<'a> ActiveGeneration<'a> {
    fn enter(state: &'a StubState) -> Self {
        let now = state.active_generations.fetch_add(1, Ordering::SeqCst) + 1;
        state.peak_generations.fetch_max(now, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for ActiveGeneration<'_> {
    fn drop(&mut self) {
        self.0.active_generations.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Model source that never touches the network or disk.
#[derive(Clone, Default)]
pub struct StubModelSource {
    state: Arc<StubState>,
}

impl StubModelSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make each load take at least `delay`, widening first-call races.
    pub fn with_load_delay(self, delay: Duration) -> Self {
        if let Ok(mut d) = self.state.load_delay.lock() {
            *d = delay;
        }
        self
    }

    /// Make each generation block for `delay`.
    pub fn with_generation_delay(self, delay: Duration) -> Self {
        if let Ok(mut d) = self.state.generation_delay.lock() {
            *d = delay;
        }
        self
    }

    /// Simulate an unreachable artifact store.
    pub fn set_fail_loads(&self, fail: bool) {
        self.state.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// Simulate resource exhaustion during sampling.
    pub fn set_fail_generation(&self, fail: bool) {
        self.state.fail_generation.store(fail, Ordering::SeqCst);
    }

    /// Number of load attempts that reached this source.
    pub fn loads(&self) -> usize {
        self.state.loads.load(Ordering::SeqCst)
    }

    /// Generations running right now, on any thread.
    pub fn active_generations(&self) -> usize {
        self.state.active_generations.load(Ordering::SeqCst)
    }

    /// Most generations ever observed running at the same time.
    pub fn peak_generations(&self) -> usize {
        self.state.peak_generations.load(Ordering::SeqCst)
    }

    /// Settings received by the most recent generation call.
    pub fn last_settings(&self) -> Option<SamplingSettings> {
        self.state.last_settings.lock().ok().and_then(|s| *s)
    }
}

#[async_trait]
impl ModelSource for StubModelSource {
    async fn load_model(
        &self,
        spec: &ModelSpec,
        _device: &Device,
    ) -> Result<LoadedModel, ModelLoadError> {
        self.state.loads.fetch_add(1, Ordering::SeqCst);

        let delay = self.state.load_delay.lock().map(|d| *d).unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.state.fail_loads.load(Ordering::SeqCst) {
            return Err(ModelLoadError::Unavailable(format!(
                "network unreachable while fetching {}",
                spec.id
            )));
        }

        Ok(LoadedModel {
            tokenizer: Arc::new(ByteTokenizer),
            generator: Arc::new(StubGenerator {
                state: self.state.clone(),
            }),
        })
    }
}

/// One token per byte.
pub struct ByteTokenizer;

impl PromptTokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>, GenerationError> {
        Ok(text.bytes().map(TokenId::from).collect())
    }

    fn decode(&self, tokens: &[TokenId]) -> Result<String, GenerationError> {
        let bytes = tokens
            .iter()
            .map(|&t| {
                u8::try_from(t)
                    .map_err(|_| GenerationError::Decode(format!("token {t} is not a byte")))
            })
            .collect::<Result<Vec<u8>, _>>()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

struct StubGenerator {
    state: Arc<StubState>,
}

impl TextGenerator for StubGenerator {
    fn generate(
        &self,
        prompt: &[TokenId],
        settings: &SamplingSettings,
        cancel: &CancelFlag,
    ) -> Result<Vec<TokenId>, GenerationError> {
        let _active = ActiveGeneration::enter(&self.state);
        if let Ok(mut last) = self.state.last_settings.lock() {
            *last = Some(*settings);
        }

        // Sleep in slices so a cancelled request releases the worker promptly.
        let delay = self.state.generation_delay.lock().map(|d| *d).unwrap_or_default();
        let deadline = Instant::now() + delay;
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            if left.is_zero() {
                break;
            }
            cancel.check()?;
            std::thread::sleep(left.min(Duration::from_millis(5)));
        }
        cancel.check()?;

        if self.state.fail_generation.load(Ordering::SeqCst) {
            return Err(GenerationError::Inference(
                "out of memory allocating activations (simulated)".to_string(),
            ));
        }

        let mut rng = rand::thread_rng();
        let mut continuation: Vec<TokenId> = Vec::with_capacity(settings.max_new_tokens);
        while continuation.len() < settings.max_new_tokens {
            let word = WORDS.choose(&mut rng).copied().unwrap_or("and");
            continuation.push(TokenId::from(b' '));
            continuation.extend(word.bytes().map(TokenId::from));
        }
        continuation.truncate(settings.max_new_tokens);

        let mut out = prompt.to_vec();
        out.extend(continuation);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_tokenizer_round_trip() {
        let tok = ByteTokenizer;
        let ids = tok.encode("Once upon a time").unwrap();
        assert_eq!(ids.len(), 16);
        assert_eq!(tok.decode(&ids).unwrap(), "Once upon a time");
        assert!(tok.decode(&[300]).is_err());
    }

    #[test]
    fn test_generator_echoes_prompt_and_respects_budget() {
        let generator = StubGenerator {
            state: Arc::new(StubState::default()),
        };
        let prompt = ByteTokenizer.encode("Hello").unwrap();
        let settings = SamplingSettings {
            temperature: 0.8,
            max_new_tokens: 50,
        };

        let out = generator
            .generate(&prompt, &settings, &CancelFlag::new())
            .unwrap();
        assert!(out.starts_with(&prompt));
        assert_eq!(out.len(), prompt.len() + 50);
    }

    #[test]
    fn test_cancelled_generation_stops_early() {
        let state = Arc::new(StubState::default());
        if let Ok(mut d) = state.generation_delay.lock() {
            *d = Duration::from_secs(5);
        }
        let generator = StubGenerator {
            state: state.clone(),
        };
        let settings = SamplingSettings {
            temperature: 0.8,
            max_new_tokens: 50,
        };

        let cancel = CancelFlag::new();
        let remote = cancel.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.cancel();
        });

        let start = Instant::now();
        let result = generator.generate(&[1, 2, 3], &settings, &cancel);
        canceller.join().unwrap();

        assert!(matches!(result, Err(GenerationError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(state.active_generations.load(Ordering::SeqCst), 0);
        assert_eq!(state.peak_generations.load(Ordering::SeqCst), 1);
    }
}
