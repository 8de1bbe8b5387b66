//! Benchmarks for the completion pipeline overhead (stub engine).

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use llm_completion::device::DevicePreference;
use llm_completion::inference::loader::EngineLoader;
use llm_completion::inference::model_loader::ModelSpec;
use llm_completion::inference::stub::StubModelSource;
use llm_completion::pipeline::{strip_echo, CompletionPipeline, GenerationParameters};

fn bench_complete(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let loader = EngineLoader::new(
        Arc::new(StubModelSource::new()),
        ModelSpec::new("stub/tiny-lm", "main"),
        DevicePreference::Cpu,
    );
    let pipeline = CompletionPipeline::new(Arc::new(loader), None);
    let params = GenerationParameters::new(0.7, 256);

    // Load once outside the measured loop.
    runtime.block_on(pipeline.engine()).unwrap();

    c.bench_function("stub_complete_256_tokens", |b| {
        b.iter(|| {
            let completion = runtime
                .block_on(pipeline.complete(
                    black_box("The future of artificial intelligence is"),
                    params,
                ))
                .unwrap();
            black_box(completion);
        })
    });
}

fn bench_clamp(c: &mut Criterion) {
    c.bench_function("clamp_parameters", |b| {
        b.iter(|| GenerationParameters::new(black_box(3.5), black_box(4096)))
    });
}

fn bench_strip_echo(c: &mut Criterion) {
    let prompt: Vec<u32> = (0..512).collect();
    let output: Vec<u32> = (0..1536).collect();

    c.bench_function("strip_echo_512_of_1536", |b| {
        b.iter(|| black_box(strip_echo(black_box(&prompt), black_box(&output)).len()))
    });
}

criterion_group!(benches, bench_complete, bench_clamp, bench_strip_echo);
criterion_main!(benches);
