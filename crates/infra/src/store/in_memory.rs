//! In-memory stores for tests and local development.
//!
//! The stock store keeps ledger, slots and batches behind one async mutex, so
//! every write is a serialised read-modify-write. Snapshot rebuilds take an
//! extra per-date guard; reservation transitions take a per-reservation guard.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, instrument};

use stockledger_core::{DomainError, DomainResult, ItemId, ReservationId, WarehouseId};
use stockledger_inventory::{
    AllocationPlan, ApplyOutcome, Batch, ConsumeOutcome, FefoCandidate, IdempotencyKey, KeyBalance,
    LedgerCut, LedgerEntry, Movement, NewReservation, PlanOptions, ReleaseOutcome, Reservation,
    ReservationKey, SnapshotRow, SnapshotSummary, StockKey, StockSlot, aggregate_ledger,
    apply_delta, plan, resolve_inbound_dates, snapshot_rows,
};

use super::{
    AllocationRequest, AllocationResult, CreatedReservation, LedgerStats, ReservationStore,
    StockStore, plan_from_legs, prior_allocation, required_batch_key,
};
use crate::error::{StoreError, StoreResult};

type BatchIdentity = (ItemId, WarehouseId, String);

/// Per-key async mutexes. An entry lives only while a lease holds or waits on it.
#[derive(Debug)]
struct KeyedGuards<K> {
    guards: Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>,
}

impl<K> Default for KeyedGuards<K> {
    fn default() -> Self {
        Self {
            guards: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedGuards<K> {
    async fn lock(&self, key: K) -> StoreResult<KeyedLease<'_, K>> {
        let mutex = {
            let mut guards = self.guards.lock().map_err(|_| StoreError::LockPoisoned)?;
            guards.entry(key.clone()).or_default().clone()
        };
        let held = mutex.lock_owned().await;
        Ok(KeyedLease {
            owner: self,
            key,
            held: Some(held),
        })
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.guards.lock().map(|g| g.len()).unwrap_or(0)
    }
}

struct KeyedLease<'a, K: Eq + Hash> {
    owner: &'a KeyedGuards<K>,
    key: K,
    held: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash> Drop for KeyedLease<'_, K> {
    fn drop(&mut self) {
        let Some(held) = self.held.take() else {
            return;
        };
        let mutex = OwnedMutexGuard::mutex(&held).clone();
        drop(held);
        if let Ok(mut guards) = self.owner.guards.lock() {
            // Only the map and `mutex` left: nobody holds or waits on this key.
            if Arc::strong_count(&mutex) == 2 {
                guards.remove(&self.key);
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    qty: i64,
    seq: i64,
}

#[derive(Debug, Default)]
struct StockState {
    ledger: Vec<LedgerEntry>,
    applied: HashMap<IdempotencyKey, usize>,
    slots: BTreeMap<StockKey, Slot>,
    batches: BTreeMap<BatchIdentity, Batch>,
    next_slot_seq: i64,
}

impl StockState {
    fn ensure_batch(
        &mut self,
        item_id: ItemId,
        warehouse_id: WarehouseId,
        code: &str,
        production_date: Option<NaiveDate>,
        expiry_date: Option<NaiveDate>,
        on_date: NaiveDate,
    ) -> DomainResult<Batch> {
        let identity = (item_id, warehouse_id, code.to_string());
        if let Some(existing) = self.batches.get(&identity) {
            return Ok(existing.clone());
        }
        let (production_date, expiry_date) =
            resolve_inbound_dates(production_date, expiry_date, on_date)?;
        let batch = Batch {
            id: self.batches.len() as i64 + 1,
            item_id,
            warehouse_id,
            batch_code: code.to_string(),
            production_date,
            expiry_date,
            created_at: Utc::now(),
        };
        self.batches.insert(identity, batch.clone());
        Ok(batch)
    }

    fn apply(&mut self, movement: &Movement) -> DomainResult<(ApplyOutcome, Option<LedgerEntry>)> {
        movement.validate()?;

        if let Some(&idx) = self.applied.get(&movement.idempotency_key()) {
            return Ok((ApplyOutcome::replayed(&self.ledger[idx]), None));
        }

        let before = self.slots.get(&movement.key).map_or(0, |s| s.qty);
        if movement.delta == 0 {
            return Ok((ApplyOutcome::unchanged(movement.key.clone(), before), None));
        }

        let after = apply_delta(before, movement)?;

        if let Some(code) = movement.key.batch.code() {
            self.ensure_batch(
                movement.key.item_id,
                movement.key.warehouse_id,
                code,
                movement.production_date,
                movement.expiry_date,
                movement.occurred_at.date_naive(),
            )?;
        }

        let entry = LedgerEntry {
            id: self.ledger.len() as i64 + 1,
            key: movement.key.clone(),
            delta: movement.delta,
            reason: movement.reason,
            reference: movement.reference.clone(),
            ref_line: movement.ref_line,
            after_qty: after,
            occurred_at: movement.occurred_at,
            trace_id: movement.effective_trace_id(),
        };

        let next_seq = &mut self.next_slot_seq;
        let slot = self.slots.entry(movement.key.clone()).or_insert_with(|| {
            *next_seq += 1;
            Slot {
                qty: 0,
                seq: *next_seq,
            }
        });
        slot.qty = after;

        self.applied.insert(movement.idempotency_key(), self.ledger.len());
        self.ledger.push(entry.clone());
        Ok((ApplyOutcome::applied(&entry), Some(entry)))
    }

    fn candidates(&self, item_id: ItemId, warehouse_id: WarehouseId) -> Vec<FefoCandidate> {
        self.slots
            .iter()
            .filter(|(k, s)| k.item_id == item_id && k.warehouse_id == warehouse_id && s.qty > 0)
            .map(|(k, s)| {
                let expiry_date = k.batch.code().and_then(|code| {
                    self.batches
                        .get(&(item_id, warehouse_id, code.to_string()))
                        .and_then(|b| b.expiry_date)
                });
                FefoCandidate {
                    key: k.clone(),
                    qty: s.qty,
                    expiry_date,
                    slot_seq: s.seq,
                }
            })
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStockStore {
    state: tokio::sync::Mutex<StockState>,
    snapshots: RwLock<BTreeMap<NaiveDate, Vec<SnapshotRow>>>,
    snapshot_guards: KeyedGuards<NaiveDate>,
}

impl InMemoryStockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites a slot without a ledger entry. Only used to simulate drift.
    #[cfg(test)]
    pub(crate) async fn force_slot_qty(&self, key: StockKey, qty: i64) {
        let mut state = self.state.lock().await;
        let seq = state.next_slot_seq + 1;
        state.next_slot_seq = seq;
        state
            .slots
            .entry(key)
            .and_modify(|s| s.qty = qty)
            .or_insert(Slot { qty, seq });
    }
}

#[async_trait]
impl StockStore for InMemoryStockStore {
    #[instrument(
        skip(self, movement),
        fields(key = %movement.key, reference = %movement.reference, ref_line = movement.ref_line),
        err
    )]
    async fn apply(&self, movement: Movement) -> StoreResult<ApplyOutcome> {
        let mut state = self.state.lock().await;
        let (outcome, _) = state.apply(&movement)?;
        if !outcome.applied {
            debug!(before = outcome.before, "movement not applied (replay or zero delta)");
        }
        Ok(outcome)
    }

    async fn resolve_batch(
        &self,
        item_id: ItemId,
        warehouse_id: WarehouseId,
        batch_code_raw: &str,
        production_date: Option<NaiveDate>,
        expiry_date: Option<NaiveDate>,
        on_date: NaiveDate,
    ) -> StoreResult<Batch> {
        let key = required_batch_key(batch_code_raw)?;
        let mut state = self.state.lock().await;
        Ok(state.ensure_batch(
            item_id,
            warehouse_id,
            key.as_key(),
            production_date,
            expiry_date,
            on_date,
        )?)
    }

    async fn correct_expiry(
        &self,
        item_id: ItemId,
        warehouse_id: WarehouseId,
        batch_code_raw: &str,
        expiry_date: Option<NaiveDate>,
    ) -> StoreResult<Batch> {
        let key = required_batch_key(batch_code_raw)?;
        let mut state = self.state.lock().await;
        let batch = state
            .batches
            .get_mut(&(item_id, warehouse_id, key.as_key().to_string()))
            .ok_or_else(|| DomainError::not_found(format!("batch {key} of item {item_id}")))?;
        if let (Some(p), Some(e)) = (batch.production_date, expiry_date) {
            if e < p {
                return Err(DomainError::validation(format!(
                    "expiry_date ({e}) is before production_date ({p})"
                ))
                .into());
            }
        }
        batch.expiry_date = expiry_date;
        Ok(batch.clone())
    }

    async fn batches(&self) -> StoreResult<Vec<Batch>> {
        let state = self.state.lock().await;
        Ok(state.batches.values().cloned().collect())
    }

    async fn ledger_totals(&self, cut: LedgerCut) -> StoreResult<BTreeMap<StockKey, i64>> {
        let state = self.state.lock().await;
        Ok(aggregate_ledger(&state.ledger, cut))
    }

    async fn ledger_entries(&self, reference: &str) -> StoreResult<Vec<LedgerEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .ledger
            .iter()
            .filter(|e| e.reference == reference)
            .cloned()
            .collect())
    }

    async fn ledger_stats(&self, since: DateTime<Utc>) -> StoreResult<LedgerStats> {
        let state = self.state.lock().await;
        Ok(LedgerStats {
            ledger_rows: state.ledger.len() as u64,
            outbound_rows: state.ledger.iter().filter(|e| e.is_outbound()).count() as u64,
            rows_since: state.ledger.iter().filter(|e| e.occurred_at >= since).count() as u64,
        })
    }

    async fn ledger_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<LedgerEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .ledger
            .iter()
            .filter(|e| e.occurred_at >= from && e.occurred_at <= to)
            .cloned()
            .collect())
    }

    async fn key_balances(&self, keys: &[StockKey]) -> StoreResult<Vec<KeyBalance>> {
        let state = self.state.lock().await;
        Ok(keys
            .iter()
            .map(|key| KeyBalance {
                key: key.clone(),
                ledger_qty: state
                    .ledger
                    .iter()
                    .filter(|e| &e.key == key)
                    .map(|e| e.delta)
                    .sum(),
                stock_qty: state.slots.get(key).map(|s| s.qty).unwrap_or(0),
            })
            .collect())
    }

    async fn stock_slots(&self) -> StoreResult<Vec<StockSlot>> {
        let state = self.state.lock().await;
        Ok(state
            .slots
            .iter()
            .map(|(key, slot)| StockSlot {
                key: key.clone(),
                qty: slot.qty,
            })
            .collect())
    }

    async fn snapshot_rows(&self, date: NaiveDate) -> StoreResult<Vec<SnapshotRow>> {
        let snapshots = self.snapshots.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(snapshots.get(&date).cloned().unwrap_or_default())
    }

    #[instrument(skip(self), fields(snapshot_date = %date), err)]
    async fn rebuild_snapshot(&self, date: NaiveDate) -> StoreResult<SnapshotSummary> {
        let _lease = self.snapshot_guards.lock(date).await?;

        let rows = {
            let state = self.state.lock().await;
            snapshot_rows(date, &state.ledger)
        };
        let summary = SnapshotSummary::of_rows(date, &rows);

        let mut snapshots = self.snapshots.write().map_err(|_| StoreError::LockPoisoned)?;
        snapshots.insert(date, rows);
        Ok(summary)
    }

    async fn plan_allocation(
        &self,
        item_id: ItemId,
        warehouse_id: WarehouseId,
        qty: i64,
        options: &PlanOptions,
    ) -> StoreResult<AllocationPlan> {
        let state = self.state.lock().await;
        let candidates = state.candidates(item_id, warehouse_id);
        Ok(plan(item_id, warehouse_id, qty, &candidates, options)?)
    }

    #[instrument(
        skip(self, request),
        fields(
            item_id = %request.item_id,
            warehouse_id = %request.warehouse_id,
            qty = request.qty,
            reference = %request.reference
        ),
        err
    )]
    async fn allocate(&self, request: &AllocationRequest) -> StoreResult<AllocationResult> {
        let mut state = self.state.lock().await;

        let prior: Vec<LedgerEntry> = state
            .ledger
            .iter()
            .filter(|e| e.reference == request.reference)
            .cloned()
            .collect();
        if let Some(legs) = prior_allocation(&prior, request)? {
            debug!(legs = legs.len(), "allocation replayed");
            return Ok(AllocationResult {
                plan: plan_from_legs(request, &legs),
                entries: legs,
                replayed: true,
            });
        }

        let candidates = state.candidates(request.item_id, request.warehouse_id);
        let plan = plan(
            request.item_id,
            request.warehouse_id,
            request.qty,
            &candidates,
            &request.plan_options(),
        )?;

        let movements: Vec<Movement> = plan
            .legs
            .iter()
            .zip(request.start_ref_line..)
            .map(|(leg, ref_line)| request.leg_movement(leg.key.clone(), leg.qty, ref_line))
            .collect();
        for m in &movements {
            m.validate()?;
            if state.applied.contains_key(&m.idempotency_key()) {
                return Err(DomainError::conflict(format!(
                    "ref_line {} of {} is already used",
                    m.ref_line, m.reference
                ))
                .into());
            }
        }

        let mut entries = Vec::with_capacity(movements.len());
        for m in &movements {
            if let (_, Some(entry)) = state.apply(m)? {
                entries.push(entry);
            }
        }

        Ok(AllocationResult {
            plan,
            entries,
            replayed: false,
        })
    }
}

#[derive(Debug, Default)]
struct ReservationState {
    by_id: HashMap<ReservationId, Reservation>,
    by_key: HashMap<ReservationKey, ReservationId>,
}

#[derive(Debug, Default)]
pub struct InMemoryReservationStore {
    state: RwLock<ReservationState>,
    guards: KeyedGuards<ReservationId>,
}

impl InMemoryReservationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` on the stored reservation while its guard is held.
    async fn with_reservation<T>(
        &self,
        id: ReservationId,
        f: impl FnOnce(Option<&mut Reservation>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let _lease = self.guards.lock(id).await?;
        let mut state = self.state.write().map_err(|_| StoreError::LockPoisoned)?;
        f(state.by_id.get_mut(&id))
    }
}

#[async_trait]
impl ReservationStore for InMemoryReservationStore {
    #[instrument(skip(self, new), fields(reservation_key = %new.key.lock_key()), err)]
    async fn create(
        &self,
        new: NewReservation,
        now: DateTime<Utc>,
    ) -> StoreResult<CreatedReservation> {
        new.validate()?;
        let mut state = self.state.write().map_err(|_| StoreError::LockPoisoned)?;

        if let Some(id) = state.by_key.get(&new.key).copied() {
            let reservation = state
                .by_id
                .get_mut(&id)
                .ok_or_else(|| StoreError::storage(format!("dangling key index for {id}")))?;
            reservation.refresh(&new, now)?;
            return Ok(CreatedReservation {
                reservation: reservation.clone(),
                created: false,
            });
        }

        let reservation = Reservation::open(ReservationId::new(), &new, now)?;
        state.by_key.insert(new.key.clone(), reservation.id);
        state.by_id.insert(reservation.id, reservation.clone());
        Ok(CreatedReservation {
            reservation,
            created: true,
        })
    }

    async fn get(&self, id: ReservationId) -> StoreResult<Option<Reservation>> {
        let state = self.state.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(state.by_id.get(&id).cloned())
    }

    async fn find_by_key(&self, key: &ReservationKey) -> StoreResult<Option<Reservation>> {
        let state = self.state.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(state
            .by_key
            .get(key)
            .and_then(|id| state.by_id.get(id))
            .cloned())
    }

    #[instrument(skip(self), fields(reservation_id = %id), err)]
    async fn consume(
        &self,
        id: ReservationId,
        now: DateTime<Utc>,
    ) -> StoreResult<(Reservation, ConsumeOutcome)> {
        self.with_reservation(id, |r| {
            let r = r.ok_or_else(|| DomainError::not_found(format!("reservation {id}")))?;
            let outcome = r.consume(now)?;
            Ok((r.clone(), outcome))
        })
        .await
    }

    #[instrument(skip(self), fields(reservation_id = %id), err)]
    async fn cancel(&self, id: ReservationId, now: DateTime<Utc>) -> StoreResult<Reservation> {
        self.with_reservation(id, |r| {
            let r = r.ok_or_else(|| DomainError::not_found(format!("reservation {id}")))?;
            r.cancel(now)?;
            Ok(r.clone())
        })
        .await
    }

    async fn find_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<ReservationId>> {
        let state = self.state.read().map_err(|_| StoreError::LockPoisoned)?;
        let mut expired: Vec<&Reservation> = state
            .by_id
            .values()
            .filter(|r| r.is_expired_at(now))
            .collect();
        expired.sort_by_key(|r| (r.expire_at, r.id));
        Ok(expired.into_iter().take(limit).map(|r| r.id).collect())
    }

    #[instrument(skip(self), fields(reservation_id = %id), err)]
    async fn release_expired_by_id(
        &self,
        id: ReservationId,
        now: DateTime<Utc>,
    ) -> StoreResult<ReleaseOutcome> {
        self.with_reservation(id, |r| {
            Ok(match r {
                Some(r) => r.expire(now),
                None => ReleaseOutcome::Noop { id: None },
            })
        })
        .await
    }
}
