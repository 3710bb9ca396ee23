use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::{Duration, NaiveDate, TimeZone, Utc};
use stockledger_core::{BatchKey, ItemId, WarehouseId};
use stockledger_infra::store::{AllocationRequest, InMemoryStockStore, StockStore};
use stockledger_inventory::{FefoCandidate, Movement, MovementReason, PlanOptions, StockKey, plan};
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn wh() -> WarehouseId {
    WarehouseId::new(1).unwrap()
}

fn item() -> ItemId {
    ItemId::new(1).unwrap()
}

/// `n` batches with expiry spread over the next `n` days, shuffled by slot order.
fn candidates(n: usize) -> Vec<FefoCandidate> {
    let base = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
    (0..n)
        .map(|i| FefoCandidate {
            key: StockKey::new(
                wh(),
                item(),
                BatchKey::from_code(Some(&format!("B{i:05}"))).unwrap(),
            ),
            qty: 10,
            expiry_date: Some(base + Duration::days(((i * 7919) % n) as i64)),
            slot_seq: i as i64,
        })
        .collect()
}

fn bench_fefo_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("fefo_plan");
    let options = PlanOptions::on(NaiveDate::from_ymd_opt(2024, 12, 31).unwrap());

    for n in [10usize, 100, 1_000] {
        let slots = candidates(n);
        // Demand spanning half of the batches.
        let qty = (n as i64 * 10) / 2;
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &slots, |b, slots| {
            b.iter(|| plan(item(), wh(), black_box(qty), black_box(slots), &options).unwrap());
        });
    }

    group.finish();
}

fn bench_apply_throughput(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("apply");
    group.throughput(Throughput::Elements(1));

    let store = InMemoryStockStore::new();
    let at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
    let key = StockKey::new(wh(), item(), BatchKey::none());
    let mut seq = 0u64;

    group.bench_function("receipt_on_hot_slot", |b| {
        b.iter(|| {
            seq += 1;
            let m = Movement::new(key.clone(), 1, MovementReason::Receipt, format!("PO-{seq}"), 1, at);
            rt.block_on(store.apply(black_box(m))).unwrap()
        });
    });

    group.bench_function("replayed_receipt", |b| {
        let m = Movement::new(key.clone(), 1, MovementReason::Receipt, "PO-REPLAY", 1, at);
        rt.block_on(store.apply(m.clone())).unwrap();
        b.iter(|| rt.block_on(store.apply(black_box(m.clone()))).unwrap());
    });

    group.finish();
}

fn bench_allocate(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("allocate");
    let at = Utc.with_ymd_and_hms(2024, 12, 31, 0, 0, 0).unwrap();

    for batches in [10usize, 100] {
        group.bench_with_input(BenchmarkId::from_parameter(batches), &batches, |b, &batches| {
            let store = InMemoryStockStore::new();
            for c in candidates(batches) {
                let m = Movement::new(
                    c.key.clone(),
                    1_000_000,
                    MovementReason::Receipt,
                    format!("GRN-{}", c.key.batch),
                    1,
                    at,
                )
                .with_dates(None, c.expiry_date);
                rt.block_on(store.apply(m)).unwrap();
            }

            let mut seq = 0u64;
            b.iter(|| {
                seq += 1;
                let request = AllocationRequest::new(item(), wh(), 15, format!("SO-{seq}"), at);
                rt.block_on(store.allocate(black_box(&request))).unwrap()
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_fefo_plan,
    bench_apply_throughput,
    bench_allocate
);
criterion_main!(benches);
