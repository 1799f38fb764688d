//! Entity context benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use relgraph_store::Value;
use relgraph_testkit::TestStore;

/// Benchmark identity-map lookups by key.
fn bench_get_or_create(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_or_create");

    for count in [100, 1000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let store = TestStore::new();
            let mut context = store.context();
            b.iter(|| {
                for key in 0..count {
                    black_box(context.get_or_create("Customer", Value::Integer(key)).unwrap());
                }
            });
        });
    }
    group.finish();
}

/// Benchmark lazy fetching of seeded rows.
fn bench_fetch(c: &mut Criterion) {
    let mut group = c.benchmark_group("fetch");

    for count in [10, 100].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let store = TestStore::new();
            for key in 1..=count {
                store.seed_customer(key, "bench", 1);
            }
            b.iter(|| {
                let mut context = store.context();
                for key in 1..=count {
                    let id = context.get_or_create("Customer", Value::Integer(key)).unwrap();
                    black_box(context.get_value(id, "name").unwrap());
                }
            });
        });
    }
    group.finish();
}

/// Benchmark copying a loaded graph into another context.
fn bench_copy_into(c: &mut Criterion) {
    let mut group = c.benchmark_group("copy_into");

    for count in [10, 100].iter() {
        group.throughput(Throughput::Elements(*count as u64 * 4));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let store = TestStore::new();
            for key in 1..=count {
                store.seed_order(key, None, 1);
                store.seed_lines(key, key * 10, 3);
            }
            let mut source = store.context();
            for key in 1..=count {
                let order = source.get_or_create("Order", Value::Integer(key)).unwrap();
                source.collection_members(order, "lines").unwrap();
            }
            let ids = source.ids();

            b.iter(|| {
                let mut dest = source.fork();
                black_box(source.copy_into(&mut dest, &ids).unwrap());
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_get_or_create, bench_fetch, bench_copy_into);
criterion_main!(benches);
