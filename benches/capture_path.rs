//! Benchmarks for the per-exchange capture work on the proxied path
//!
//! Classification, body accumulation and the non-blocking hand-off all run
//! inline with forwarding, so their cost is added latency.

use criterion::{criterion_group, criterion_main, Criterion};
use http::{Method, Uri};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;
use tracerun::capture::body::{capture_request, BodyAccumulator, BodyKind};
use tracerun::capture::{CaptureBuffer, PendingCapture};
use tracerun::pipeline::{LoggingPipeline, PipelineOptions, TracingSink};
use tracerun::providers::{NormalizedRequest, ProviderConfigFile, ProviderRegistry};

fn bench_classification(c: &mut Criterion) {
    let mut group = c.benchmark_group("classification");
    let registry =
        ProviderRegistry::build(&ProviderConfigFile::default()).expect("builtins compile");

    for (label, uri) in [
        ("openai_chat", "https://api.openai.com/v1/chat/completions"),
        ("anthropic_messages", "https://api.anthropic.com/v1/messages"),
        ("unknown", "https://example.com/static/app.js"),
    ] {
        let uri: Uri = uri.parse().expect("valid uri");
        group.bench_function(label, |b| {
            b.iter(|| {
                let request = NormalizedRequest::new(&Method::POST, black_box(&uri));
                black_box(registry.classify(&request.as_meta(None)))
            });
        });
    }
    group.finish();
}

fn bench_body_capture(c: &mut Criterion) {
    let mut group = c.benchmark_group("body_capture");

    let request = format!(
        r#"{{"model":"gpt-4o-mini","messages":[{{"role":"user","content":"{}"}}]}}"#,
        "x".repeat(16 * 1024)
    );
    group.bench_function("request_json_16kb", |b| {
        b.iter(|| {
            black_box(capture_request(
                request.as_bytes(),
                Some("application/json"),
                None,
                4 * 1024 * 1024,
                true,
            ))
        });
    });

    let chunks: Vec<Vec<u8>> = (0..200)
        .map(|i| {
            format!("data: {{\"choices\":[{{\"delta\":{{\"content\":\"token{i} \"}}}}]}}\n\n")
                .into_bytes()
        })
        .collect();
    group.bench_function("event_stream_200_chunks", |b| {
        b.iter(|| {
            let mut accumulator = BodyAccumulator::new(BodyKind::EventStream, None, 4 * 1024 * 1024);
            for chunk in &chunks {
                accumulator.push(black_box(chunk));
            }
            black_box(accumulator.finish(true))
        });
    });
    group.finish();
}

fn bench_hand_off(c: &mut Criterion) {
    let mut group = c.benchmark_group("hand_off");
    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");

    let buffer = CaptureBuffer::new(200);
    group.bench_function("buffer_insert", |b| {
        b.iter(|| {
            let record = PendingCapture::new("openai", "POST", "/v1/chat/completions", "h", "u")
                .finish(None, None);
            buffer.insert(Arc::new(black_box(record)));
        });
    });

    let pipeline = runtime.block_on(async {
        LoggingPipeline::start(
            Arc::new(TracingSink),
            PipelineOptions {
                queue_capacity: 1024,
                ..PipelineOptions::default()
            },
        )
    });
    group.bench_function("pipeline_enqueue", |b| {
        b.iter(|| {
            let record = PendingCapture::new("openai", "POST", "/v1/chat/completions", "h", "u")
                .finish(None, None);
            black_box(pipeline.enqueue(Arc::new(record)))
        });
    });
    runtime.block_on(pipeline.shutdown(Duration::from_millis(100)));
    group.finish();
}

criterion_group!(benches, bench_classification, bench_body_capture, bench_hand_off);
criterion_main!(benches);
