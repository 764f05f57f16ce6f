//! Benchmark for the document store backends
//!
//! Measures the conditional write that admits every state transition.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use declarative_control_plane::domain::{Collection, DocumentStore};
use declarative_control_plane::{FileDocumentStore, MemoryDocumentStore};
use serde_json::json;
use std::sync::Arc;
use tokio::runtime::Runtime;

fn document(counter: u64) -> serde_json::Value {
    json!({
        "resourceType": "kubernetes_namespace",
        "provisioningState": "Accepted",
        "settings": {"labels": {"team": "a"}, "generation": counter}
    })
}

fn bench_memory_conditional_writes(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("document_store");
    group.throughput(Throughput::Elements(1));

    group.bench_function("memory_insert_if_absent", |b| {
        let store = MemoryDocumentStore::new();
        let mut counter = 0u64;
        b.to_async(&rt).iter(|| {
            counter += 1;
            let key = format!("/subscriptions/s/resources/r-{}", counter);
            let store = &store;
            async move {
                let _ = store
                    .put_if_revision(Collection::Resources, black_box(&key), document(counter), None)
                    .await;
            }
        });
    });

    group.bench_function("memory_compare_and_swap", |b| {
        let store = MemoryDocumentStore::new();
        let key = "/subscriptions/s/resources/hot";
        let mut revision = rt
            .block_on(store.upsert(Collection::Resources, key, document(0)))
            .unwrap();
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            let next = rt
                .block_on(store.put_if_revision(
                    Collection::Resources,
                    black_box(key),
                    document(counter),
                    Some(revision),
                ))
                .unwrap();
            if let Some(next) = next {
                revision = next;
            }
        });
    });

    group.finish();
}

fn bench_concurrent_inserts(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("document_store");
    group.throughput(Throughput::Elements(100));

    group.bench_function("memory_concurrent_100_inserts", |b| {
        b.to_async(&rt).iter(|| async {
            let store = Arc::new(MemoryDocumentStore::new());
            let handles: Vec<_> = (0..100u64)
                .map(|i| {
                    let store = store.clone();
                    tokio::spawn(async move {
                        let key = format!("/subscriptions/s/resources/r-{}", i % 10);
                        let _ = store
                            .put_if_revision(Collection::Resources, &key, document(i), None)
                            .await;
                    })
                })
                .collect();
            for handle in handles {
                let _ = handle.await;
            }
        });
    });

    group.finish();
}

fn bench_file_upsert(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let store = rt.block_on(FileDocumentStore::with_path(dir.path())).unwrap();

    let mut group = c.benchmark_group("document_store");
    group.throughput(Throughput::Elements(1));
    group.sample_size(20);

    group.bench_function("file_upsert", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            let key = format!("/subscriptions/s/resources/r-{}", counter % 100);
            let _ = rt.block_on(store.upsert(
                Collection::Resources,
                black_box(&key),
                document(counter),
            ));
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_memory_conditional_writes,
    bench_concurrent_inserts,
    bench_file_upsert,
);
criterion_main!(benches);
