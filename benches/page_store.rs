//! Page store benchmarks
//!
//! Measures the operations on the hot path of the layers above:
//!
//! - Cached retrieve from both store kinds
//! - Commit of a batch of new pages, with and without the background writer
//! - Binary in-place update commits

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::tempdir;
use tristore::{PageStore, PageStoreBuilder, StoreKind};

const PAGE_SIZE: usize = 4096;

fn bench_retrieve(c: &mut Criterion) {
    let mut group = c.benchmark_group("retrieve_cached");

    for kind in [StoreKind::AppendOnly, StoreKind::Binary] {
        let dir = tempdir().unwrap();
        let store = PageStoreBuilder::new()
            .path(dir.path().join("bench.data"))
            .kind(kind)
            .open()
            .unwrap();
        for _ in 0..1000 {
            let page = store.create(1).unwrap();
            store.write(1, page.id(), &[7u8; 64], 0, 0, 64).unwrap();
        }
        store.commit(1, None).unwrap();

        group.bench_function(BenchmarkId::new("kind", format!("{:?}", kind)), |b| {
            let mut id = 0u64;
            b.iter(|| {
                id = id % 1000 + 1;
                let page = store.retrieve(black_box(id), None).unwrap();
                black_box(page.data().unwrap()[0]);
            });
        });
    }

    group.finish();
}

fn bench_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("append_only_commit");

    for count in [10usize, 100] {
        group.throughput(Throughput::Elements(count as u64));
        for background in [true, false] {
            let name = if background { "background" } else { "synchronous" };
            group.bench_with_input(BenchmarkId::new(name, count), &count, |b, &count| {
                b.iter_with_setup(
                    || {
                        let dir = tempdir().unwrap();
                        let store = PageStoreBuilder::new()
                            .path(dir.path().join("bench.data"))
                            .background_writes(background)
                            .open()
                            .unwrap();
                        (dir, store)
                    },
                    |(dir, store)| {
                        let data = [1u8; PAGE_SIZE];
                        for _ in 0..count {
                            let page = store.create(1).unwrap();
                            store.write(1, page.id(), &data, 0, 0, PAGE_SIZE).unwrap();
                        }
                        store.commit(1, None).unwrap();
                        (dir, store)
                    },
                );
            });
        }
    }

    group.finish();
}

fn bench_binary_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("binary_update_commit");

    let dir = tempdir().unwrap();
    let store = PageStoreBuilder::new()
        .path(dir.path().join("bench.data"))
        .kind(StoreKind::Binary)
        .open()
        .unwrap();
    for _ in 0..100 {
        store.create(1).unwrap();
    }
    store.commit(1, None).unwrap();

    group.throughput(Throughput::Elements(10));
    group.bench_function("ten_pages", |b| {
        let mut tx = 1u64;
        b.iter(|| {
            tx += 1;
            for i in 0..10u64 {
                let id = (tx * 10 + i) % 100 + 1;
                store.write(tx, id, &tx.to_le_bytes(), 0, 0, 8).unwrap();
            }
            store.commit(tx, None).unwrap();
        });
    });

    group.finish();
}

criterion_group!(benches, bench_retrieve, bench_commit, bench_binary_update);
criterion_main!(benches);
