//! Time window benchmarks
//!
//! Ingestion cost (record into the current bucket, including opportunistic
//! pruning) and read cost (windowed fold with the percentile sort).
//!
//! Run with: `cargo bench --bench window_bench`

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use vigil_engine::{
    percentile, CategoryKey, ManualClock, Observation, SnapshotAggregator, TimeWindow, Timestamp,
    WindowSpec,
};

const T0: i64 = 1_700_000_000_000;

fn http_window(clock: Arc<ManualClock>, sample_cap: usize) -> TimeWindow<()> {
    let spec = WindowSpec::new(Duration::from_secs(10), Duration::from_secs(3_600), sample_cap)
        .unwrap();
    TimeWindow::new("bench", spec, clock)
}

fn observation(i: u64) -> Observation {
    Observation::single()
        .with_sample((i % 250) as f64 + 0.5)
        .with_error(i % 50 == 0)
        .with_category(CategoryKey::status(if i % 50 == 0 { 503 } else { 200 }))
        .with_category(CategoryKey::method("GET"))
        .with_category(CategoryKey::route(if i % 3 == 0 { "/api/setups" } else { "/api/tags" }))
}

// ============================================================================
// Ingestion Benchmarks
// ============================================================================

fn bench_record(c: &mut Criterion) {
    let mut group = c.benchmark_group("window_record");
    group.throughput(Throughput::Elements(1));

    group.bench_function("same_bucket", |b| {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(T0)));
        let window = http_window(Arc::clone(&clock), 2_000);
        let mut i = 0u64;
        b.iter(|| {
            window.record_at(black_box(Timestamp::from_millis(T0)), &observation(i));
            i = i.wrapping_add(1);
        });
    });

    group.bench_function("advancing_clock", |b| {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(T0)));
        let window = http_window(Arc::clone(&clock), 2_000);
        let mut i = 0u64;
        b.iter(|| {
            clock.advance(Duration::from_millis(7));
            window.record_at(black_box(window.now()), &observation(i));
            i = i.wrapping_add(1);
        });
    });

    group.finish();
}

// ============================================================================
// Read Benchmarks
// ============================================================================

fn bench_aggregate(c: &mut Criterion) {
    let mut group = c.benchmark_group("window_aggregate");

    for per_bucket in [10u64, 100, 1_000] {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(T0)));
        let window = http_window(Arc::clone(&clock), 2_000);
        // 30 buckets of history
        for bucket in 0..30i64 {
            let at = Timestamp::from_millis(T0 + bucket * 10_000);
            clock.set(at);
            for i in 0..per_bucket {
                window.record_at(at, &observation(i));
            }
        }
        clock.set(Timestamp::from_millis(T0 + 299_000));
        let aggregator = SnapshotAggregator::new(10);

        group.throughput(Throughput::Elements(per_bucket * 30));
        group.bench_with_input(BenchmarkId::new("five_minutes", per_bucket), &per_bucket, |b, _| {
            b.iter(|| black_box(window.aggregate(Duration::from_secs(300), &aggregator)));
        });
    }

    group.finish();
}

fn bench_percentile(c: &mut Criterion) {
    let mut group = c.benchmark_group("percentile");

    for size in [100usize, 2_000, 20_000] {
        let samples: Vec<f64> = (0..size).map(|i| ((i * 7919) % 1_000) as f64).collect();
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("p95", size), &samples, |b, samples| {
            b.iter(|| black_box(percentile(black_box(samples), 95.0)));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_record, bench_aggregate, bench_percentile);
criterion_main!(benches);
