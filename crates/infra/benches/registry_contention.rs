use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;
use std::time::Duration;

use atlas_core::{CharacterId, ItemId, Tenant, TenantId, TransactionId};
use atlas_infra::cache::InMemoryBackend;
use atlas_infra::coalesced::{CoalescedConfig, CoalescedRegistry};
use atlas_infra::lock::DistributedMutex;
use atlas_infra::registry::{InMemoryRegistry, TenantRegistry};
use atlas_infra::reservation::{ReservationRegistry, SlotKey};
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap()
}

fn tenant() -> Tenant {
    Tenant::new(TenantId::new(), "GMS", 83, 1).unwrap()
}

/// Many tasks racing `add` on the same key: exactly one wins per round.
fn bench_registry_add_contention(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("registry_add_contention");

    for tasks in [1usize, 8, 64].iter() {
        group.throughput(Throughput::Elements(*tasks as u64));
        group.bench_with_input(BenchmarkId::new("same_key", tasks), tasks, |b, &tasks| {
            let registry: Arc<InMemoryRegistry<CharacterId, u32>> = Arc::new(InMemoryRegistry::new());
            let t = tenant();
            b.iter(|| {
                rt.block_on(async {
                    let handles: Vec<_> = (0..tasks)
                        .map(|i| {
                            let registry = registry.clone();
                            let t = t.clone();
                            tokio::spawn(async move { registry.add(&t, CharacterId(1), i as u32).await.is_ok() })
                        })
                        .collect();
                    let mut winners = 0;
                    for handle in handles {
                        winners += handle.await.unwrap() as usize;
                    }
                    registry.remove(&t, &CharacterId(1)).await.unwrap();
                    black_box(winners)
                })
            });
        });
    }

    group.finish();
}

/// Reservation adds on one slot, serialized through the distributed mutex.
fn bench_reservation_add(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("reservation_add");

    for (name, locked) in [("unlocked", false), ("locked", true)] {
        group.bench_function(name, |b| {
            let backend = InMemoryBackend::new();
            let mut registry = ReservationRegistry::new(backend.clone());
            if locked {
                registry = registry.with_mutex(DistributedMutex::new(backend));
            }
            let t = tenant();
            let slot = SlotKey::new(1, 1, 1);
            b.iter(|| {
                rt.block_on(async {
                    let tx = TransactionId::new();
                    registry
                        .add(&t, tx, slot, ItemId(2000000), 1, Duration::from_secs(60))
                        .await
                        .unwrap();
                    registry.remove(&t, tx, slot).await.unwrap();
                })
            });
        });
    }

    group.finish();
}

/// Position updates: buffered puts against write-through puts.
fn bench_coalesced_vs_direct(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("coalesced_vs_direct");

    group.bench_function("coalesced_put", |b| {
        let registry: CoalescedRegistry<InMemoryBackend, CharacterId, (i16, i16)> = rt.block_on(async {
            CoalescedRegistry::spawn(InMemoryBackend::new(), "position", CoalescedConfig::default())
        });
        let t = tenant();
        let mut x = 0i16;
        b.iter(|| {
            x = x.wrapping_add(1);
            registry.put(&t, &CharacterId(1), black_box((x, 0))).unwrap();
        });
        rt.block_on(registry.shutdown());
    });

    group.bench_function("direct_put", |b| {
        let registry: CoalescedRegistry<InMemoryBackend, CharacterId, (i16, i16)> = rt.block_on(async {
            CoalescedRegistry::spawn(InMemoryBackend::new(), "position", CoalescedConfig::default())
        });
        let t = tenant();
        let mut x = 0i16;
        b.iter(|| {
            x = x.wrapping_add(1);
            rt.block_on(registry.direct_put(&t, &CharacterId(1), black_box((x, 0))))
                .unwrap();
        });
        rt.block_on(registry.shutdown());
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_registry_add_contention,
    bench_reservation_add,
    bench_coalesced_vs_direct
);
criterion_main!(benches);
