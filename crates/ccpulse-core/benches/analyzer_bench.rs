//! Performance benchmarks for session windowing and P90 estimation
//!
//! Both run once per monitoring cycle over the full history, so they must
//! stay well under the default 10s update interval even for months of data.

use ccpulse_core::analyzer::SessionAnalyzer;
use ccpulse_core::p90::P90Estimator;
use ccpulse_core::P90Settings;
use ccpulse_types::UsageEntry;
use chrono::{Duration, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

/// Bursts of activity separated by idle stretches, so windows and gaps mix
fn generate_entries(count: usize) -> Vec<UsageEntry> {
    let start = Utc::now() - Duration::days(60);
    let mut ts = start;
    (0..count)
        .map(|i| {
            ts += if i % 50 == 0 {
                Duration::hours(7)
            } else {
                Duration::minutes(3)
            };
            let model = if i % 3 == 0 {
                "claude-opus-4-20250514"
            } else {
                "claude-sonnet-4-20250514"
            };
            UsageEntry::new(ts, 500 + (i as u64 % 700), 200 + (i as u64 % 300))
                .with_model(model)
                .with_cache(100, 2_000)
        })
        .collect()
}

fn transform_benchmark(c: &mut Criterion) {
    let analyzer = SessionAnalyzer::default();
    let mut group = c.benchmark_group("transform_to_blocks");

    for count in [100, 1_000, 10_000] {
        let entries = generate_entries(count);
        group.bench_with_input(BenchmarkId::new("entries", count), &entries, |b, entries| {
            b.iter(|| black_box(analyzer.transform_to_blocks(entries)));
        });
    }

    group.finish();
}

fn p90_benchmark(c: &mut Criterion) {
    let analyzer = SessionAnalyzer::default();
    let blocks = analyzer.transform_to_blocks(&generate_entries(10_000));
    let estimator = P90Estimator::new(P90Settings::default());

    let mut group = c.benchmark_group("p90_limit");
    group.bench_function("uncached", |b| {
        b.iter(|| black_box(estimator.calculate_p90_limit(&blocks, false)));
    });
    group.bench_function("cached", |b| {
        b.iter(|| black_box(estimator.calculate_p90_limit(&blocks, true)));
    });
    group.finish();
}

criterion_group!(benches, transform_benchmark, p90_benchmark);
criterion_main!(benches);
