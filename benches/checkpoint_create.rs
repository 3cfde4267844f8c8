//! Benchmarks for the checkpoint hot path.
//!
//! Run: cargo bench
//! Compare: cargo bench -- --save-baseline v1 && cargo bench -- --baseline v1

use std::sync::Arc;

use agentfs::bundle::{FakeBundleBackend, FakeCloneProvider};
use agentfs::checkpoint::CheckpointManager;
use agentfs::store::StoreManager;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::tempdir;

fn write_bands(mount: &std::path::Path, file_count: usize, file_size: usize) {
    let data = vec![0xABu8; file_size];
    for i in 0..file_count {
        std::fs::write(mount.join(format!("file_{i}.dat")), &data).unwrap();
    }
}

fn benchmark_checkpoint_create(c: &mut Criterion) {
    let mut group = c.benchmark_group("checkpoint_create");
    group.sample_size(10);

    for &file_count in &[10, 100, 500] {
        let dir = tempdir().unwrap();
        let backend = Arc::new(FakeBundleBackend);
        let store_mgr = StoreManager::new(backend.clone());
        let checkpoint_mgr = CheckpointManager::new(Arc::new(FakeCloneProvider), backend);
        let store = store_mgr.create(&dir.path().join("bench.fs"), 0).unwrap();
        write_bands(&store.mount_point, file_count, 4096);

        group.throughput(Throughput::Elements(file_count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(file_count), &file_count, |b, _| {
            b.iter(|| {
                let row = checkpoint_mgr.create(black_box(&store), None).unwrap();
                black_box(row);
            })
        });
    }

    group.finish();
}

fn benchmark_auto_checkpoint_no_changes(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let backend = Arc::new(FakeBundleBackend);
    let store_mgr = StoreManager::new(backend.clone());
    let checkpoint_mgr = CheckpointManager::new(Arc::new(FakeCloneProvider), backend);
    let store = store_mgr.create(&dir.path().join("bench.fs"), 0).unwrap();
    write_bands(&store.mount_point, 200, 4096);
    checkpoint_mgr.create(&store, None).unwrap();

    c.bench_function("auto_checkpoint_unchanged_200_files", |b| {
        b.iter(|| {
            let result = checkpoint_mgr.create_auto(black_box(&store)).unwrap();
            black_box(result);
        })
    });
}

criterion_group!(
    benches,
    benchmark_checkpoint_create,
    benchmark_auto_checkpoint_no_changes,
);
criterion_main!(benches);
