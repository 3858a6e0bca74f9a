//! Micro-benchmarks for the `Engine` public API.
//!
//! Measures single-operation latency for the operations most likely to
//! dominate a workload: occurrence writes, point-in-time reads, and
//! full-text search.
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench engine
//! cargo bench --bench engine -- "add"
//! ```

use criterion::{BatchSize, BenchmarkId, Criterion, criterion_group, criterion_main};

use recordkernel::engine::{Engine, EngineConfig};
use recordkernel::token::Operator;
use recordkernel::value::Value;
use std::hint::black_box;
use tempfile::TempDir;

/// Number of records preloaded before a read/query benchmark runs.
const RECORD_COUNT: u64 = 5_000;

fn populated_engine(dir: &std::path::Path) -> Engine {
    let engine = Engine::open(dir, EngineConfig::default()).unwrap();
    for i in 0..RECORD_COUNT {
        engine
            .add("name", Value::String(format!("user{i:06}")), i)
            .unwrap();
        engine.add("age", Value::Integer((i % 90) as i32), i).unwrap();
        engine
            .add(
                "bio",
                Value::String(format!("a curious engineer number {i} who enjoys rust")),
                i,
            )
            .unwrap();
    }
    engine
}

fn bench_add(c: &mut Criterion) {
    let mut group = c.benchmark_group("add");
    group.bench_function("single_record", |b| {
        b.iter_batched(
            || {
                let dir = TempDir::new().unwrap();
                let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
                (dir, engine)
            },
            |(dir, engine)| {
                engine
                    .add("name", Value::String("Alice".into()), 1)
                    .unwrap();
                black_box(&engine);
                drop(dir);
            },
            BatchSize::SmallInput,
        );
    });
    group.finish();
}

fn bench_verify(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let engine = populated_engine(dir.path());

    let mut group = c.benchmark_group("verify");
    group.bench_function("present_value", |b| {
        b.iter(|| {
            black_box(
                engine
                    .verify(
                        "name",
                        &Value::String("user002500".into()),
                        2500,
                        engine.now(),
                    )
                    .unwrap(),
            )
        });
    });
    group.finish();
}

fn bench_find(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let engine = populated_engine(dir.path());

    let mut group = c.benchmark_group("find");
    for threshold in [10, 45, 80] {
        group.bench_with_input(
            BenchmarkId::from_parameter(threshold),
            &threshold,
            |b, &threshold| {
                b.iter(|| {
                    black_box(
                        engine
                            .find(
                                "age",
                                Operator::GreaterThan,
                                &[Value::Integer(threshold)],
                                engine.now(),
                            )
                            .unwrap(),
                    )
                });
            },
        );
    }
    group.finish();
}

fn bench_search(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let engine = populated_engine(dir.path());

    let mut group = c.benchmark_group("search");
    group.bench_function("ordered_phrase", |b| {
        b.iter(|| black_box(engine.search("bio", "curious engineer").unwrap()));
    });
    group.finish();
}

fn bench_atomic_operation(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let engine = populated_engine(dir.path());

    let mut group = c.benchmark_group("atomic_operation");
    group.bench_function("verify_then_add_commit", |b| {
        b.iter(|| {
            let mut op = engine.start_atomic_operation();
            op.verify("name", &Value::String("user000100".into()), 100)
                .unwrap();
            op.add("last_seen", Value::Long(42), 100).unwrap();
            black_box(op.commit().unwrap());
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_add,
    bench_verify,
    bench_find,
    bench_search,
    bench_atomic_operation
);
criterion_main!(benches);
