// Metadata arena benchmarks
//
// Measures the bump-pointer fast path, string copies of selector-sized
// names, and contended allocation from several threads.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use kernobjc_mem::MetadataArena;
use std::sync::Arc;
use std::thread;

fn bench_value_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("arena_alloc");

    group.bench_function("u64", |b| {
        let arena = MetadataArena::new(1024 * 1024);
        b.iter(|| {
            black_box(arena.alloc(black_box(7u64)));
        });
    });

    group.bench_function("method_sized", |b| {
        let arena = MetadataArena::new(1024 * 1024);
        b.iter(|| {
            black_box(arena.alloc(black_box([0usize; 4])));
        });
    });

    group.finish();
}

fn bench_string_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("arena_alloc_str");

    for name in ["init", "initWithObjects:count:", "forwardedMethodForSelector:"] {
        group.bench_with_input(BenchmarkId::from_parameter(name), name, |b, name| {
            let arena = MetadataArena::new(1024 * 1024);
            b.iter(|| {
                black_box(arena.alloc_str(black_box(name)));
            });
        });
    }

    group.finish();
}

fn bench_contended_allocation(c: &mut Criterion) {
    c.bench_function("arena_alloc_4_threads", |b| {
        b.iter(|| {
            let arena = Arc::new(MetadataArena::new(64 * 1024));
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let arena = Arc::clone(&arena);
                    thread::spawn(move || {
                        for i in 0..1000u64 {
                            black_box(arena.alloc(i));
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
        });
    });
}

criterion_group!(
    benches,
    bench_value_allocation,
    bench_string_allocation,
    bench_contended_allocation
);
criterion_main!(benches);
