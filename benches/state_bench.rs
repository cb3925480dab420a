//! Performance benchmarks for the metrics hot path

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use taskmon_exporter::metrics::{CounterKind, ExpositionEncoder, MetricsState, RunState};

fn mutation_benchmark(c: &mut Criterion) {
    let state = MetricsState::default();

    let mut group = c.benchmark_group("state");
    group.throughput(Throughput::Elements(1));

    group.bench_function("increment_counter", |b| {
        b.iter(|| {
            state.increment_counter(black_box(CounterKind::Received));
        })
    });

    group.bench_function("observe_runtime", |b| {
        b.iter(|| {
            let _ = state.observe_runtime(black_box("tasks.add"), RunState::Success, black_box(0.42));
        })
    });

    group.finish();
}

fn flush_benchmark(c: &mut Criterion) {
    let state = MetricsState::default();
    for i in 0..50 {
        let name = format!("tasks.job_{i}");
        for runtime in [0.003, 0.07, 0.6, 4.0] {
            let _ = state.observe_runtime(&name, RunState::Success, runtime);
            let _ = state.observe_runtime(&name, RunState::Failure, runtime);
        }
    }
    let encoder = ExpositionEncoder::default();

    let mut group = c.benchmark_group("flush");

    group.bench_function("snapshot", |b| {
        b.iter(|| {
            black_box(state.snapshot());
        })
    });

    group.bench_function("snapshot_encode_100_series", |b| {
        b.iter(|| {
            let snapshot = state.snapshot();
            black_box(encoder.encode(&snapshot));
        })
    });

    group.finish();
}

criterion_group!(benches, mutation_benchmark, flush_benchmark);
criterion_main!(benches);
