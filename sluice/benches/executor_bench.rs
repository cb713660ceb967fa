//! Benchmarks for pipeline execution throughput.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use sluice::engine::{EngineConfig, EtlEngine};
use sluice::registry::PipelineSpec;
use sluice::stages::PipelineConfig;
use sluice::store::MemoryStore;
use sluice::testing::{IdentityTransformer, RecordingLoader, StaticExtractor};
use std::sync::Arc;

fn executor_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");

    let mut group = c.benchmark_group("execute_pipeline");
    for batch_size in [10usize, 100, 1000] {
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            &batch_size,
            |b, &batch_size| {
                let engine = EtlEngine::new(
                    Arc::new(MemoryStore::new()),
                    EngineConfig::default(),
                );
                let records: Vec<_> = (0..1000).map(|i| json!({"id": i})).collect();
                engine
                    .register_pipeline(
                        PipelineSpec::new("bench")
                            .with_extractor(Arc::new(StaticExtractor::new(records)))
                            .with_transformer(Arc::new(IdentityTransformer::new()))
                            .with_loader(Arc::new(RecordingLoader::new()))
                            .with_config(PipelineConfig::new().with_batch_size(batch_size)),
                    )
                    .expect("register");

                b.iter(|| {
                    runtime
                        .block_on(engine.execute_pipeline("bench"))
                        .expect("execute")
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, executor_benchmark);
criterion_main!(benches);
