//! Storage boundary for the inventory engine.
//!
//! Two traits split the persisted state: [`StockStore`] owns the ledger, the
//! current-stock view, snapshots and batches; [`ReservationStore`] owns soft
//! reservations. Both come in an in-memory flavour (tests, dev) and a Postgres
//! flavour.
//!
//! Every mutating call on [`StockStore`] serialises writers per stock slot: two
//! concurrent `apply` calls against the same key never interleave their
//! read-modify-write. Reservation transitions are serialised per reservation.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{BatchKey, DomainError, DomainResult, ItemId, ReservationId, TraceId, WarehouseId};
use stockledger_inventory::{
    AllocationPlan, ApplyOutcome, Batch, ConsumeOutcome, KeyBalance, LedgerCut, LedgerEntry,
    Movement, MovementReason, NewReservation, PlanOptions, ReleaseOutcome, Reservation, ReservationKey,
    SnapshotRow, SnapshotSummary, StockKey, StockSlot,
};

use crate::error::StoreResult;

pub mod in_memory;
pub mod postgres;

pub use in_memory::{InMemoryReservationStore, InMemoryStockStore};
pub use postgres::{PostgresReservationStore, PostgresStockStore};

/// Inputs of a FEFO allocation that writes outbound legs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub item_id: ItemId,
    pub warehouse_id: WarehouseId,
    pub qty: i64,
    pub reason: MovementReason,
    pub reference: String,
    /// First ref_line used; each leg takes the next one.
    pub start_ref_line: i32,
    pub occurred_at: DateTime<Utc>,
    pub trace_id: Option<TraceId>,
    pub allow_expired: bool,
    pub preferred_batch: Option<BatchKey>,
}

impl AllocationRequest {
    pub fn new(
        item_id: ItemId,
        warehouse_id: WarehouseId,
        qty: i64,
        reference: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            item_id,
            warehouse_id,
            qty,
            reason: MovementReason::Shipment,
            reference: reference.into(),
            start_ref_line: 1,
            occurred_at,
            trace_id: None,
            allow_expired: false,
            preferred_batch: None,
        }
    }

    pub fn plan_options(&self) -> PlanOptions {
        PlanOptions {
            on_date: self.occurred_at.date_naive(),
            allow_expired: self.allow_expired,
            preferred_batch: self.preferred_batch.clone(),
        }
    }

    /// The outbound movement for one planned leg.
    pub fn leg_movement(&self, key: StockKey, qty: i64, ref_line: i32) -> Movement {
        let mut movement = Movement::new(
            key,
            -qty,
            self.reason,
            self.reference.clone(),
            ref_line,
            self.occurred_at,
        );
        movement.trace_id = self.trace_id.clone();
        movement
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationResult {
    pub plan: AllocationPlan,
    pub entries: Vec<LedgerEntry>,
    /// `true` when the reference was already allocated and the prior legs are returned.
    pub replayed: bool,
}

/// Counts feeding the insights formulas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub ledger_rows: u64,
    pub outbound_rows: u64,
    pub rows_since: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedReservation {
    pub reservation: Reservation,
    /// `false` when an open reservation with the same business key was refreshed.
    pub created: bool,
}

#[async_trait]
pub trait StockStore: Send + Sync {
    /// Appends one ledger entry and updates its stock slot in one transaction.
    async fn apply(&self, movement: Movement) -> StoreResult<ApplyOutcome>;

    /// Get-or-create the batch `(item, warehouse, batch_code)`.
    ///
    /// Dates of an existing batch are kept as they are.
    async fn resolve_batch(
        &self,
        item_id: ItemId,
        warehouse_id: WarehouseId,
        batch_code: &str,
        production_date: Option<NaiveDate>,
        expiry_date: Option<NaiveDate>,
        on_date: NaiveDate,
    ) -> StoreResult<Batch>;

    /// Administrative expiry correction of an existing batch.
    async fn correct_expiry(
        &self,
        item_id: ItemId,
        warehouse_id: WarehouseId,
        batch_code: &str,
        expiry_date: Option<NaiveDate>,
    ) -> StoreResult<Batch>;

    async fn batches(&self) -> StoreResult<Vec<Batch>>;

    /// Σdelta per key for entries inside `cut` (zero sums omitted).
    async fn ledger_totals(&self, cut: LedgerCut) -> StoreResult<BTreeMap<StockKey, i64>>;

    async fn ledger_entries(&self, reference: &str) -> StoreResult<Vec<LedgerEntry>>;

    async fn ledger_stats(&self, since: DateTime<Utc>) -> StoreResult<LedgerStats>;

    /// Entries with `from <= occurred_at <= to`.
    async fn ledger_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<LedgerEntry>>;

    /// Ledger total and stock quantity of each key, read in one statement.
    async fn key_balances(&self, keys: &[StockKey]) -> StoreResult<Vec<KeyBalance>>;

    async fn stock_slots(&self) -> StoreResult<Vec<StockSlot>>;

    async fn snapshot_rows(&self, date: NaiveDate) -> StoreResult<Vec<SnapshotRow>>;

    /// Replaces every snapshot row of `date`, guarded per date.
    async fn rebuild_snapshot(&self, date: NaiveDate) -> StoreResult<SnapshotSummary>;

    /// Read-only FEFO plan over current stock.
    async fn plan_allocation(
        &self,
        item_id: ItemId,
        warehouse_id: WarehouseId,
        qty: i64,
        options: &PlanOptions,
    ) -> StoreResult<AllocationPlan>;

    /// Locks candidate slots, plans, and writes one outbound leg per batch.
    async fn allocate(&self, request: &AllocationRequest) -> StoreResult<AllocationResult>;
}

#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Idempotent by business key.
    async fn create(&self, new: NewReservation, now: DateTime<Utc>)
    -> StoreResult<CreatedReservation>;

    async fn get(&self, id: ReservationId) -> StoreResult<Option<Reservation>>;

    async fn find_by_key(&self, key: &ReservationKey) -> StoreResult<Option<Reservation>>;

    /// Unknown id is `NotFound`.
    async fn consume(
        &self,
        id: ReservationId,
        now: DateTime<Utc>,
    ) -> StoreResult<(Reservation, ConsumeOutcome)>;

    /// Unknown id is `NotFound`; terminal status is `Conflict`.
    async fn cancel(&self, id: ReservationId, now: DateTime<Utc>) -> StoreResult<Reservation>;

    /// Open reservations with `expire_at < now`, oldest first.
    async fn find_expired(&self, now: DateTime<Utc>, limit: usize)
    -> StoreResult<Vec<ReservationId>>;

    /// `open -> expired` under the reservation's guard. Never fails on state:
    /// non-open or unknown ids are `Noop`.
    async fn release_expired_by_id(
        &self,
        id: ReservationId,
        now: DateTime<Utc>,
    ) -> StoreResult<ReleaseOutcome>;
}

#[async_trait]
impl<S> StockStore for Arc<S>
where
    S: StockStore + ?Sized,
{
    async fn apply(&self, movement: Movement) -> StoreResult<ApplyOutcome> {
        (**self).apply(movement).await
    }

    async fn resolve_batch(
        &self,
        item_id: ItemId,
        warehouse_id: WarehouseId,
        batch_code: &str,
        production_date: Option<NaiveDate>,
        expiry_date: Option<NaiveDate>,
        on_date: NaiveDate,
    ) -> StoreResult<Batch> {
        (**self)
            .resolve_batch(item_id, warehouse_id, batch_code, production_date, expiry_date, on_date)
            .await
    }

    async fn correct_expiry(
        &self,
        item_id: ItemId,
        warehouse_id: WarehouseId,
        batch_code: &str,
        expiry_date: Option<NaiveDate>,
    ) -> StoreResult<Batch> {
        (**self)
            .correct_expiry(item_id, warehouse_id, batch_code, expiry_date)
            .await
    }

    async fn batches(&self) -> StoreResult<Vec<Batch>> {
        (**self).batches().await
    }

    async fn ledger_totals(&self, cut: LedgerCut) -> StoreResult<BTreeMap<StockKey, i64>> {
        (**self).ledger_totals(cut).await
    }

    async fn ledger_entries(&self, reference: &str) -> StoreResult<Vec<LedgerEntry>> {
        (**self).ledger_entries(reference).await
    }

    async fn ledger_stats(&self, since: DateTime<Utc>) -> StoreResult<LedgerStats> {
        (**self).ledger_stats(since).await
    }

    async fn ledger_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<LedgerEntry>> {
        (**self).ledger_between(from, to).await
    }

    async fn key_balances(&self, keys: &[StockKey]) -> StoreResult<Vec<KeyBalance>> {
        (**self).key_balances(keys).await
    }

    async fn stock_slots(&self) -> StoreResult<Vec<StockSlot>> {
        (**self).stock_slots().await
    }

    async fn snapshot_rows(&self, date: NaiveDate) -> StoreResult<Vec<SnapshotRow>> {
        (**self).snapshot_rows(date).await
    }

    async fn rebuild_snapshot(&self, date: NaiveDate) -> StoreResult<SnapshotSummary> {
        (**self).rebuild_snapshot(date).await
    }

    async fn plan_allocation(
        &self,
        item_id: ItemId,
        warehouse_id: WarehouseId,
        qty: i64,
        options: &PlanOptions,
    ) -> StoreResult<AllocationPlan> {
        (**self)
            .plan_allocation(item_id, warehouse_id, qty, options)
            .await
    }

    async fn allocate(&self, request: &AllocationRequest) -> StoreResult<AllocationResult> {
        (**self).allocate(request).await
    }
}

#[async_trait]
impl<S> ReservationStore for Arc<S>
where
    S: ReservationStore + ?Sized,
{
    async fn create(
        &self,
        new: NewReservation,
        now: DateTime<Utc>,
    ) -> StoreResult<CreatedReservation> {
        (**self).create(new, now).await
    }

    async fn get(&self, id: ReservationId) -> StoreResult<Option<Reservation>> {
        (**self).get(id).await
    }

    async fn find_by_key(&self, key: &ReservationKey) -> StoreResult<Option<Reservation>> {
        (**self).find_by_key(key).await
    }

    async fn consume(
        &self,
        id: ReservationId,
        now: DateTime<Utc>,
    ) -> StoreResult<(Reservation, ConsumeOutcome)> {
        (**self).consume(id, now).await
    }

    async fn cancel(&self, id: ReservationId, now: DateTime<Utc>) -> StoreResult<Reservation> {
        (**self).cancel(id, now).await
    }

    async fn find_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<ReservationId>> {
        (**self).find_expired(now, limit).await
    }

    async fn release_expired_by_id(
        &self,
        id: ReservationId,
        now: DateTime<Utc>,
    ) -> StoreResult<ReleaseOutcome> {
        (**self).release_expired_by_id(id, now).await
    }
}

/// Prior legs of an allocation already written under `request.reference`.
///
/// `None` when `start_ref_line` is free. The entry at `start_ref_line` must be
/// an outbound leg of the same item and warehouse; anything else there is a
/// foreign movement and the allocation is refused with `Conflict`.
pub(crate) fn prior_allocation(
    entries: &[LedgerEntry],
    request: &AllocationRequest,
) -> DomainResult<Option<Vec<LedgerEntry>>> {
    let is_leg = |e: &LedgerEntry| {
        e.key.item_id == request.item_id
            && e.key.warehouse_id == request.warehouse_id
            && e.delta < 0
    };

    let Some(head) = entries
        .iter()
        .find(|e| e.ref_line == request.start_ref_line)
    else {
        return Ok(None);
    };
    if !is_leg(head) {
        return Err(DomainError::conflict(format!(
            "ref_line {} of {} is used by another movement",
            request.start_ref_line, request.reference
        )));
    }

    let mut legs: Vec<LedgerEntry> = entries
        .iter()
        .filter(|e| e.ref_line >= request.start_ref_line && is_leg(e))
        .cloned()
        .collect();
    legs.sort_by_key(|e| e.ref_line);

    let mut expected = request.start_ref_line;
    legs.retain(|e| {
        let contiguous = e.ref_line == expected;
        if contiguous {
            expected += 1;
        }
        contiguous
    });
    Ok(Some(legs))
}

/// Rebuilds the plan a replayed allocation originally produced.
pub(crate) fn plan_from_legs(request: &AllocationRequest, legs: &[LedgerEntry]) -> AllocationPlan {
    AllocationPlan {
        item_id: request.item_id,
        warehouse_id: request.warehouse_id,
        requested: legs.iter().map(|e| -e.delta).sum(),
        legs: legs
            .iter()
            .map(|e| stockledger_inventory::AllocationLeg {
                key: e.key.clone(),
                qty: -e.delta,
                expiry_date: None,
            })
            .collect(),
        outcome: stockledger_inventory::FefoOutcome::Strict,
    }
}

/// Batch lookups need a real code; blank normalises to "no batch" and is refused.
pub(crate) fn required_batch_key(code: &str) -> DomainResult<BatchKey> {
    let key = BatchKey::from_code(Some(code))?;
    if key.is_none() {
        return Err(DomainError::batch_resolution("batch_code is required"));
    }
    Ok(key)
}
