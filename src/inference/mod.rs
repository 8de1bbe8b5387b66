//! LLM inference engine.
//!
//! - [`engine`]: Tokenizer/generator traits and the shared engine handle
//! - [`loader`]: Memoized, once-per-process engine construction
//! - [`model_loader`]: Model sources (Hugging Face hub) and load errors
//! - [`llama`]: candle Llama generator and `tokenizers` adapter
//! - [`stub`]: Offline stub engine for tests and demos

pub mod engine;
pub mod llama;
pub mod loader;
pub mod model_loader;
pub mod stub;
