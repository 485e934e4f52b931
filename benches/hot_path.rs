use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use traffic_ledger::clock::SystemClock;
use traffic_ledger::cold::MemoryColdStore;
use traffic_ledger::compaction::Compactor;
use traffic_ledger::config::CompactionConfig;
use traffic_ledger::hot::{HotStore, HotStoreSettings, MemoryHotStore};
use traffic_ledger::key::{ResourceKey, ResourceType};
use traffic_ledger::types::{BusinessZone, TrafficSummary};

fn keys(count: u64) -> Vec<ResourceKey> {
    let bucket = BusinessZone::default().bucket_of(chrono::Utc::now());
    (0..count)
        .map(|i| ResourceKey::new(bucket, i % 16, ResourceType::Node, i))
        .collect()
}

fn bench_key_codec(c: &mut Criterion) {
    let zone = BusinessZone::default();
    let key = keys(1).remove(0);
    let encoded = key.encode();

    c.bench_function("key_encode", |b| b.iter(|| black_box(key.encode())));
    c.bench_function("key_decode", |b| {
        b.iter(|| black_box(ResourceKey::decode(&encoded, &zone).unwrap()))
    });
}

fn bench_increment(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let hot = MemoryHotStore::new(&HotStoreSettings::default(), Arc::new(SystemClock));

    let mut group = c.benchmark_group("increment");

    for size in [100u64, 1000].iter() {
        let keys = keys(*size);
        let entries: Vec<(ResourceKey, TrafficSummary)> = keys
            .iter()
            .map(|k| (k.clone(), TrafficSummary::new(1500, 300)))
            .collect();

        group.throughput(Throughput::Elements(*size));
        group.bench_with_input(BenchmarkId::new("single", size), &keys, |b, keys| {
            b.iter(|| {
                rt.block_on(async {
                    for key in keys {
                        hot.increment(key, 1500, 300).await.unwrap();
                    }
                })
            });
        });
        group.bench_with_input(BenchmarkId::new("batch", size), &entries, |b, entries| {
            b.iter(|| rt.block_on(async { hot.batch_increment(entries).await.unwrap() }));
        });
    }

    group.finish();
}

fn bench_compaction_cycle(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("compaction");

    for size in [100u64, 1000].iter() {
        let keys = keys(*size);
        group.throughput(Throughput::Elements(*size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &keys, |b, keys| {
            b.iter(|| {
                rt.block_on(async {
                    let clock = Arc::new(SystemClock);
                    let hot = Arc::new(MemoryHotStore::new(
                        &HotStoreSettings::default(),
                        clock.clone(),
                    ));
                    let compactor = Compactor::new(
                        hot.clone(),
                        Arc::new(MemoryColdStore::new()),
                        clock,
                        BusinessZone::default(),
                        std::time::Duration::from_secs(24 * 3600),
                        CompactionConfig::default(),
                    );
                    for key in keys {
                        hot.increment(key, 1500, 300).await.unwrap();
                    }
                    black_box(compactor.run_cycle(&CancellationToken::new()).await.unwrap())
                })
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_key_codec, bench_increment, bench_compaction_cycle);
criterion_main!(benches);
