//! Throughput Benchmark for EmberKV
//!
//! Measures the storage engine under basic workloads: sets across size
//! classes, hits and misses, counters, and overwrites that stay in or
//! leave their size class.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use emberkv::storage::{Store, StoreOptions};
use std::sync::Arc;
use tempfile::TempDir;

fn disk_store(dir: &TempDir) -> Arc<Store> {
    let mut opts = StoreOptions::new(dir.path());
    opts.shard_count = 64;
    opts.collision_shards = 4;
    Arc::new(Store::open(opts).expect("bench store"))
}

/// Benchmark SET operations
fn bench_set(c: &mut Criterion) {
    let dir = TempDir::new().expect("temp dir");
    let store = disk_store(&dir);

    let mut group = c.benchmark_group("set");
    group.throughput(Throughput::Elements(1));

    group.bench_function("set_small", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("key:{}", i);
            store.set(key.as_bytes(), b"small_value", 0).unwrap();
            i += 1;
        });
    });

    group.bench_function("set_medium", |b| {
        let mut i = 0u64;
        let value = vec![b'x'; 1024]; // 1KB value
        b.iter(|| {
            let key = format!("key:{}", i);
            store.set(key.as_bytes(), &value, 0).unwrap();
            i += 1;
        });
    });

    group.bench_function("set_large", |b| {
        let mut i = 0u64;
        let value = vec![b'x'; 64 * 1024]; // 64KB value
        b.iter(|| {
            let key = format!("key:{}", i);
            store.set(key.as_bytes(), &value, 0).unwrap();
            i += 1;
        });
    });

    // in-place overwrite: same key, same size class
    group.bench_function("set_overwrite_in_place", |b| {
        store.set(b"hot", b"00000000", 0).unwrap();
        b.iter(|| {
            store.set(b"hot", b"11111111", 0).unwrap();
        });
    });

    group.finish();
}

/// Benchmark GET operations
fn bench_get(c: &mut Criterion) {
    let dir = TempDir::new().expect("temp dir");
    let store = disk_store(&dir);

    // Pre-populate with data
    for i in 0..100_000 {
        let key = format!("key:{}", i);
        let value = format!("value:{}", i);
        store.set(key.as_bytes(), value.as_bytes(), 0).unwrap();
    }

    let mut group = c.benchmark_group("get");
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_existing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("key:{}", i % 100_000);
            black_box(store.get(key.as_bytes()).unwrap());
            i += 1;
        });
    });

    group.bench_function("get_missing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("missing:{}", i);
            black_box(store.get(key.as_bytes()).ok());
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark counter operations
fn bench_counter(c: &mut Criterion) {
    let dir = TempDir::new().expect("temp dir");
    let store = disk_store(&dir);

    let mut group = c.benchmark_group("counter");
    group.throughput(Throughput::Elements(1));

    group.bench_function("incr", |b| {
        b.iter(|| {
            black_box(store.incr(b"counter", 1).unwrap());
        });
    });

    group.finish();
}

criterion_group!(benches, bench_set, bench_get, bench_counter);
criterion_main!(benches);
