//! llm-completion: text completion over a pretrained causal language model.
//!
//! A single-page web UI sends a prompt plus sampling knobs; the completion
//! pipeline validates and clamps them, runs one stochastic generation pass on
//! a lazily loaded, process-wide engine and returns only the continuation.

pub mod config;
pub mod device;
pub mod inference;
pub mod metrics;
pub mod pipeline;
pub mod server;
