//! Benchmarks for AtlasMV map and store operations

use atlasmv::{Config, LongType, MvStore, StringType};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use tempfile::TempDir;

const ENTRIES: u64 = 10_000;

fn setup_temp_store() -> (TempDir, MvStore) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = Config::builder()
        .file_path(dir.path().join("bench.mv"))
        .auto_commit_disabled()
        .build();
    let store = MvStore::open(config).expect("Failed to open store");
    (dir, store)
}

fn storage_benchmarks(c: &mut Criterion) {
    // Single key write throughput
    c.bench_function("put_sequential", |b| {
        let store = MvStore::open_in_memory().expect("Failed to open store");
        let map = store
            .open_map::<LongType, LongType>("data")
            .expect("Failed to open map");
        let mut key = 0u64;
        b.iter(|| {
            key += 1;
            map.put(key, key).expect("put failed");
        });
    });

    // Point reads on a committed tree
    c.bench_function("get_random", |b| {
        let (_dir, store) = setup_temp_store();
        let map = store
            .open_map::<LongType, StringType>("data")
            .expect("Failed to open map");
        for i in 0..ENTRIES {
            map.put(i, format!("value-{}", i)).expect("put failed");
        }
        store.commit().expect("commit failed");
        let mut key = 0u64;
        b.iter(|| {
            key = (key + 7919) % ENTRIES;
            black_box(map.get(&key).expect("get failed"));
        });
    });

    // Commit of a batch of changes
    c.bench_function("commit_1000", |b| {
        let (_dir, store) = setup_temp_store();
        let map = store
            .open_map::<LongType, StringType>("data")
            .expect("Failed to open map");
        let mut next = 0u64;
        b.iter_batched(
            || {
                for _ in 0..1000 {
                    next += 1;
                    map.put(next, "payload".to_string()).expect("put failed");
                }
            },
            |_| store.commit().expect("commit failed"),
            BatchSize::PerIteration,
        );
    });

    // Full scan through a cursor
    c.bench_function("cursor_scan", |b| {
        let store = MvStore::open_in_memory().expect("Failed to open store");
        let map = store
            .open_map::<LongType, LongType>("data")
            .expect("Failed to open map");
        for i in 0..ENTRIES {
            map.put(i, i * 2).expect("put failed");
        }
        b.iter(|| {
            let count = map
                .cursor(None)
                .expect("cursor failed")
                .filter(|entry| entry.is_ok())
                .count();
            black_box(count);
        });
    });
}

criterion_group!(benches, storage_benchmarks);
criterion_main!(benches);
