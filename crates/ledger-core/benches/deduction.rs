//! Deduction benchmark
//!
//! Target: resolve + deduct over 1k candidates well under 100μs

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ledger_common::{CustomerId, FeatureId, ManualClock, Timestamp};
use ledger_core::catalog::RelevantFeature;
use ledger_core::deduction::deduct;
use ledger_core::resolver::{resolve, BalanceQuery};
use ledger_core::{
    BalanceService, EntitlementGrant, FeatureDefinition, InMemoryCatalog, InMemoryStore, LedgerConfig, LedgerDeps,
    MokaBalanceCache, RecordingExecutor, RecordingQueue, RolloverBucket, UsageEvent,
};
use rust_decimal::Decimal;
use std::sync::Arc;

const NOW: i64 = 1_704_067_200_000;

fn grants(count: usize) -> Vec<EntitlementGrant> {
    let customer = CustomerId::new("cus_bench").unwrap();
    let feature = FeatureId::new("messages").unwrap();
    (0..count)
        .map(|i| {
            let created = Timestamp::from_millis(NOW - i as i64);
            let mut grant = EntitlementGrant::new(customer.clone(), feature.clone(), Decimal::from(10), created);
            let bucket = RolloverBucket::new(
                grant.id,
                Decimal::from(5),
                Some(Timestamp::from_millis(NOW + 1_000 + (i as i64 % 7))),
                0,
                created,
            );
            grant.push_rollover(bucket);
            grant
        })
        .collect()
}

fn resolve_and_deduct_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolve_and_deduct");
    let now = Timestamp::from_millis(NOW);
    let relevant = [RelevantFeature::own(FeatureId::new("messages").unwrap())];
    let query = BalanceQuery::new(
        CustomerId::new("cus_bench").unwrap(),
        FeatureId::new("messages").unwrap(),
        None,
    );

    for size in [10usize, 100, 1_000].iter() {
        let snapshot = grants(*size);
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let amount = Decimal::from(size as u64 * 12);
            b.iter(|| {
                let mut working = snapshot.clone();
                let resolution = resolve(&working, &query, &relevant, now);
                black_box(deduct(&mut working, &resolution, black_box(amount), false))
            })
        });
    }

    group.finish();
}

fn service_track_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let catalog = Arc::new(InMemoryCatalog::new());
    catalog.upsert_feature(FeatureDefinition::metered(FeatureId::new("messages").unwrap()));
    let deps = LedgerDeps {
        store: Arc::new(InMemoryStore::with_grants(grants(10))),
        catalog,
        cache: Arc::new(MokaBalanceCache::default()),
        jobs: Arc::new(RecordingQueue::new()),
        executor: Arc::new(RecordingExecutor::new()),
        clock: Arc::new(ManualClock::new(Timestamp::from_millis(NOW))),
    };
    let mut config = LedgerConfig::default();
    config.cache.refresh_after_write = false;
    config.deduction.overage = ledger_core::OverageBehaviour::Cap;
    let service = BalanceService::new(deps, config);
    let event = UsageEvent::new(
        CustomerId::new("cus_bench").unwrap(),
        FeatureId::new("messages").unwrap(),
        Decimal::new(1, 3),
    );

    c.bench_function("service_track", |b| {
        b.iter(|| runtime.block_on(service.track(black_box(event.clone()))))
    });
}

criterion_group!(benches, resolve_and_deduct_benchmark, service_track_benchmark);
criterion_main!(benches);
