//! Performance benchmarks for shopsync-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use shopsync_engine::{
    Change, Engine, EngineConfig, EntityType, Fields, MemoryStorage, Mutation, PendingQueue,
    QueueSnapshot, OpSequence,
};

fn fields(value: serde_json::Value) -> Fields {
    value.as_object().cloned().unwrap()
}

fn seeded_engine(products: usize) -> Engine {
    let mut engine = Engine::open(EngineConfig::new("bench"), Box::new(MemoryStorage::new())).unwrap();
    let rows = (0..products)
        .map(|i| fields(json!({"id": format!("p-{i}"), "name": format!("Item {i}"), "currentStock": 100, "updatedAt": 1})))
        .collect();
    engine.refresh(EntityType::Product, rows, 1).unwrap();
    engine
}

fn bench_mutations(c: &mut Criterion) {
    let mut group = c.benchmark_group("mutations");

    group.bench_function("create", |b| {
        let mut engine = seeded_engine(0);
        let mut now = 1000u64;
        b.iter(|| {
            now += 1;
            engine.mutate(
                black_box(Mutation::create(EntityType::Product, fields(json!({"name": "Soap"})))),
                now,
            )
        })
    });

    // Every update lands on the same queued operation
    group.bench_function("coalesced_update", |b| {
        let mut engine = seeded_engine(1);
        let mut stock = 0i64;
        b.iter(|| {
            stock += 1;
            engine.mutate(
                black_box(Mutation::update(
                    EntityType::Product,
                    "p-0",
                    Change::set(fields(json!({"currentStock": stock}))),
                )),
                1000,
            )
        })
    });

    group.finish();
}

fn bench_drain_order(c: &mut Criterion) {
    let mut group = c.benchmark_group("drain_order");

    for size in [10, 100, 500].iter() {
        let mut engine = seeded_engine(*size);
        for i in 0..*size {
            let change = if i % 3 == 0 {
                Change::adjust("currentStock", -1.0)
            } else {
                Change::set(fields(json!({"name": format!("Renamed {i}")})))
            };
            engine
                .mutate(Mutation::update(EntityType::Product, format!("p-{i}"), change), 1000 + i as u64)
                .unwrap();
        }
        let queue: &PendingQueue = engine.queue();

        group.bench_with_input(BenchmarkId::new("ready", size), size, |b, &size| {
            b.iter(|| queue.ready(black_box(size)))
        });

        group.bench_with_input(BenchmarkId::new("sorted", size), size, |b, _| {
            b.iter(|| queue.drain_order().count())
        });
    }

    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_snapshot");

    for size in [100, 500].iter() {
        let mut engine = seeded_engine(*size);
        for i in 0..*size {
            engine
                .mutate(
                    Mutation::update(EntityType::Product, format!("p-{i}"), Change::adjust("currentStock", 1.0)),
                    1000,
                )
                .unwrap();
        }
        let snapshot = QueueSnapshot::new(OpSequence::new("bench"), engine.queue().to_vec());
        let json = snapshot.to_json().unwrap();

        group.bench_with_input(BenchmarkId::new("encode", size), size, |b, _| {
            b.iter(|| snapshot.to_json())
        });

        group.bench_with_input(BenchmarkId::new("decode", size), size, |b, _| {
            b.iter(|| QueueSnapshot::from_json(black_box(&json)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_mutations, bench_drain_order, bench_snapshot);
criterion_main!(benches);
