//! Prometheus metrics for completion traffic.
//!
//! Each app instance owns its own registry, so several routers can coexist
//! in one process (tests build many).

use std::time::Duration;

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

use crate::pipeline::{Completion, CompletionError};

pub struct Metrics {
    registry: Registry,
    requests: IntCounterVec,
    duration: Histogram,
    generated_tokens: IntCounter,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new("completion_requests_total", "Completion requests by outcome"),
            &["outcome"],
        )?;
        let duration = Histogram::with_opts(
            HistogramOpts::new(
                "completion_duration_seconds",
                "Wall time of completion requests, including any first-call model load",
            )
            .buckets(vec![0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
        )?;
        let generated_tokens = IntCounter::new(
            "completion_generated_tokens_total",
            "Tokens generated across all completions",
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(duration.clone()))?;
        registry.register(Box::new(generated_tokens.clone()))?;

        Ok(Self {
            registry,
            requests,
            duration,
            generated_tokens,
        })
    }

    /// Record the outcome of one `complete` call.
    pub fn observe(&self, result: &Result<Completion, CompletionError>, elapsed: Duration) {
        let outcome = match result {
            Ok(completion) => {
                self.generated_tokens.inc_by(completion.output_length() as u64);
                "ok"
            }
            Err(CompletionError::EmptyPrompt) => "empty_prompt",
            Err(CompletionError::ModelLoad(_)) => "model_load_error",
            Err(CompletionError::Generation(_)) => "generation_error",
        };
        self.requests.with_label_values(&[outcome]).inc();
        self.duration.observe(elapsed.as_secs_f64());
    }

    /// Text exposition format.
    pub fn render(&self) -> Result<(String, Vec<u8>), prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_counts_outcomes() {
        let metrics = Metrics::new().unwrap();
        metrics.observe(&Err(CompletionError::EmptyPrompt), Duration::from_millis(1));

        let (content_type, body) = metrics.render().unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(content_type.starts_with("text/plain"));
        assert!(text.contains(r#"completion_requests_total{outcome="empty_prompt"} 1"#));
    }
}
