//! Append and traversal throughput for the chunked registry
//!
//! # Run Instructions
//!
//! ```bash
//! cargo bench --bench registry_append
//! ```

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use std::sync::Arc;
use vaiven::registry::AppendOnlyRegistry;

fn bench_append(c: &mut Criterion) {
    c.bench_function("registry_append_1k", |b| {
        b.iter_batched(
            AppendOnlyRegistry::new,
            |registry| {
                for i in 0..1_000u64 {
                    registry.append(Arc::new(black_box(i)));
                }
                registry
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_traversal(c: &mut Criterion) {
    let registry = AppendOnlyRegistry::new();
    for i in 0..10_000u64 {
        registry.append(Arc::new(i));
    }
    c.bench_function("registry_for_each_10k", |b| {
        b.iter(|| {
            let mut sum = 0u64;
            registry.for_each(|item| sum = sum.wrapping_add(*item));
            black_box(sum)
        });
    });
}

criterion_group!(benches, bench_append, bench_traversal);
criterion_main!(benches);
