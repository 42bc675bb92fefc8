// Selector interning benchmarks
//
// This benchmark suite measures:
// - Registration hit/miss performance
// - Hash function comparison (DefaultHasher, FxHash, AHash)
// - Lock contention under concurrency
// - Lock-free name lookup by id

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use kernobjc::{RuntimeConfig, SelectorTable};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::thread;

fn create_table() -> SelectorTable {
    SelectorTable::new(&RuntimeConfig::default()).unwrap()
}

/// Benchmark registration hit - repeatedly intern the same selector
fn bench_register_hit(c: &mut Criterion) {
    let table = create_table();
    table.register("initWithObject:", "@24@0:8@16").unwrap();

    c.bench_function("selector_register_hit", |b| {
        b.iter(|| black_box(table.register("initWithObject:", "@24@0:8@16").unwrap()))
    });
}

/// Benchmark registration miss - intern unique selectors
fn bench_register_miss(c: &mut Criterion) {
    c.bench_function("selector_register_miss", |b| {
        b.iter_batched(
            create_table,
            |table| {
                for i in 0..100 {
                    black_box(table.register(&format!("uniqueSelector{i}:"), "v24@0:8@16").unwrap());
                }
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

/// Benchmark hash computation for different selector lengths
fn bench_hash_computation(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_computation");

    let test_cases = [
        ("init", 4),
        ("initWithObject:", 15),
        ("performSelector:withObject:afterDelay:", 38),
        ("dictionaryWithObjectsAndKeys:count:", 35),
    ];

    for (name, length) in test_cases {
        group.bench_with_input(BenchmarkId::new("DefaultHasher", length), name, |b, s| {
            b.iter(|| {
                let mut hasher = std::collections::hash_map::DefaultHasher::new();
                s.hash(&mut hasher);
                black_box(hasher.finish())
            })
        });

        group.bench_with_input(BenchmarkId::new("FxHash", length), name, |b, s| {
            b.iter(|| {
                let mut hasher = fxhash::FxHasher::default();
                s.hash(&mut hasher);
                black_box(hasher.finish())
            })
        });

        group.bench_with_input(BenchmarkId::new("AHash", length), name, |b, s| {
            b.iter(|| {
                let mut hasher = ahash::AHasher::default();
                s.hash(&mut hasher);
                black_box(hasher.finish())
            })
        });
    }

    group.finish();
}

/// Benchmark name -> id maps built on each hasher
fn bench_map_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("map_lookup");
    let names: Vec<String> = (0..1000).map(|i| format!("selector{i}:")).collect();

    let mut fx: hashbrown::HashMap<&str, u16, fxhash::FxBuildHasher> = hashbrown::HashMap::default();
    let mut ahash: hashbrown::HashMap<&str, u16, ahash::RandomState> = hashbrown::HashMap::default();
    for (id, name) in names.iter().enumerate() {
        fx.insert(name, id as u16);
        ahash.insert(name, id as u16);
    }

    group.throughput(Throughput::Elements(names.len() as u64));
    group.bench_function("FxHash", |b| {
        b.iter(|| {
            for name in &names {
                black_box(fx.get(name.as_str()));
            }
        })
    });
    group.bench_function("AHash", |b| {
        b.iter(|| {
            for name in &names {
                black_box(ahash.get(name.as_str()));
            }
        })
    });

    group.finish();
}

/// Benchmark lock contention with multiple threads registering the same name
fn bench_lock_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("lock_contention");
    let table = Arc::new(create_table());

    for thread_count in [1, 2, 4, 8] {
        group.bench_with_input(
            BenchmarkId::from_parameter(thread_count),
            &thread_count,
            |b, &n| {
                b.iter(|| {
                    let handles: Vec<_> = (0..n)
                        .map(|_| {
                            let table = Arc::clone(&table);
                            thread::spawn(move || {
                                for _ in 0..1000 {
                                    black_box(table.register("initWithObject:", "@24@0:8@16").unwrap());
                                }
                            })
                        })
                        .collect();

                    for handle in handles {
                        handle.join().unwrap();
                    }
                })
            },
        );
    }

    group.finish();
}

/// Benchmark the lock-free id -> name path used by diagnostics
fn bench_name_of(c: &mut Criterion) {
    let table = create_table();
    let id = table.register("doSomething:", "v24@0:8@16").unwrap();

    c.bench_function("selector_name_of", |b| {
        b.iter(|| black_box(table.name_of(black_box(id))))
    });
}

criterion_group!(
    benches,
    bench_register_hit,
    bench_register_miss,
    bench_hash_computation,
    bench_map_lookup,
    bench_lock_contention,
    bench_name_of
);

criterion_main!(benches);
