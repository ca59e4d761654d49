//! Benchmarks for waiter registration, dispatch and log appends.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use streampoll::mux::{dispatch, Waiter, WaiterId, WaiterRegistry};
use streampoll::{Cursor, Entry, EntryId, Fields, IdRequest, LogStore, ReadBatch, StreamLog, StreamName};
use tempfile::TempDir;
use tokio::sync::oneshot;

fn registry_with(waiters: u64, cursors: u64) -> (WaiterRegistry, Vec<oneshot::Receiver<Vec<Entry>>>) {
    let mut registry = WaiterRegistry::new();
    let mut receivers = Vec::with_capacity(waiters as usize);
    for i in 0..waiters {
        let (sender, receiver) = oneshot::channel();
        registry.register(
            StreamName::from("doc"),
            Cursor(i % cursors),
            Waiter::new(WaiterId(i), sender),
        );
        receivers.push(receiver);
    }
    (registry, receivers)
}

fn batch_of(entries: u64) -> ReadBatch {
    let entries = (0..entries)
        .map(|i| Entry {
            id: EntryId::new(1_000 + i, 0),
            fields: Fields::new().with("id", i.to_string()),
        })
        .collect();
    let mut batch = ReadBatch::new();
    batch.insert(StreamName::from("doc"), entries);
    batch
}

/// Dispatch one batch to a growing number of waiters
fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");

    for waiters in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("waiters", waiters), &waiters, |b, &n| {
            b.iter_batched(
                || (registry_with(n, 16), batch_of(8)),
                |((mut registry, receivers), batch)| {
                    black_box(dispatch(&mut registry, batch));
                    receivers
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

/// Registration cost with many distinct cursors on one stream
fn bench_register(c: &mut Criterion) {
    let mut group = c.benchmark_group("register");

    for cursors in [1, 64, 1024] {
        group.bench_with_input(BenchmarkId::new("cursors", cursors), &cursors, |b, &n| {
            b.iter(|| black_box(registry_with(256, n)));
        });
    }

    group.finish();
}

/// Appends to an in-memory and a journaled log
fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("append");
    let stream = StreamName::from("doc");

    group.bench_function("in_memory", |b| {
        let log = StreamLog::in_memory();
        b.iter(|| {
            black_box(
                log.append(&stream, IdRequest::Auto, Fields::new().with("k", "v"))
                    .unwrap(),
            )
        });
    });

    group.bench_function("journaled", |b| {
        let dir = TempDir::new().unwrap();
        let log = StreamLog::open(streampoll::LogConfig {
            path: dir.path().join("log"),
            create_if_missing: true,
            sync_interval: 1000,
        })
        .unwrap();
        b.iter(|| {
            black_box(
                log.append(&stream, IdRequest::Auto, Fields::new().with("k", "v"))
                    .unwrap(),
            )
        });
    });

    group.finish();
}

criterion_group!(benches, bench_dispatch, bench_register, bench_append);
criterion_main!(benches);
