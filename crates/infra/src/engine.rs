//! Inventory engine: the operations collaborators call.
//!
//! The engine is a thin layer over the two stores. It adds what does not
//! belong in a backend: audit publishing after commit, allocation quality
//! counters, reconciliation and insight composition, and the TTL sweep loop.
//!
//! With `verify_commits` on, every committed write is followed by a check of
//! the keys it touched: each leg must have its ledger row, and each touched
//! key must hold exactly its ledger total. A failed check is logged and
//! counted; the write itself stays committed.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use stockledger_core::{ItemId, ReservationId, WarehouseId};
use stockledger_inventory::{
    AllocationPlan, ApplyOutcome, Batch, BatchAgeing, CommitCheck, CommitEffect, ConsumeOutcome,
    FefoOutcome, FefoStats, HealSuggestion, InsightInputs, InventoryEvent, InventoryInsights,
    LedgerCut, LedgerDiagnostics, Movement, NewReservation, PlanOptions, ReconciliationReport,
    ReleaseOutcome, Reservation, SnapshotSummary, StockKey, detect_ageing, reconcile,
    suggest_heal, summarize_ledger, touched_keys, verify_commit,
};

use crate::audit::{AuditSink, NoAudit};
use crate::config::EngineConfig;
use crate::error::StoreResult;
use crate::metrics::{self, AllocationMetrics};
use crate::store::{
    AllocationRequest, AllocationResult, CreatedReservation, ReservationStore, StockStore,
};
use crate::sweeper::{self, SweepReport};

/// Window of `batch_activity_30d`.
const ACTIVITY_WINDOW_DAYS: i64 = 30;

/// Ephemeral ledger aggregation up to an instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotCut {
    pub at: DateTime<Utc>,
    pub totals: BTreeMap<StockKey, i64>,
    pub summary: SnapshotSummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub reservation_ttl: Duration,
    pub sweep_batch_size: usize,
    pub ageing_window_days: i64,
    pub verify_commits: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for EngineSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            reservation_ttl: config.reservation_ttl,
            sweep_batch_size: config.sweep_batch_size,
            ageing_window_days: config.ageing_window_days,
            verify_commits: config.verify_commits,
        }
    }
}

pub struct InventoryEngine<S, R> {
    stock: S,
    reservations: R,
    audit: Arc<dyn AuditSink>,
    metrics: Arc<AllocationMetrics>,
    settings: EngineSettings,
}

impl<S, R> InventoryEngine<S, R>
where
    S: StockStore,
    R: ReservationStore,
{
    pub fn new(stock: S, reservations: R) -> Self {
        Self {
            stock,
            reservations,
            audit: Arc::new(NoAudit),
            metrics: Arc::new(AllocationMetrics::new()),
            settings: EngineSettings::default(),
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<AllocationMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn stock_store(&self) -> &S {
        &self.stock
    }

    pub fn reservation_store(&self) -> &R {
        &self.reservations
    }

    // Ledger writer

    /// Applies one movement. Replays of `(ref, ref_line)` return the prior result.
    pub async fn apply(&self, movement: Movement) -> StoreResult<ApplyOutcome> {
        let trace_id = movement.effective_trace_id();
        let reason = movement.reason;
        let reference = movement.reference.clone();
        let ref_line = movement.ref_line;
        let occurred_at = movement.occurred_at;

        let outcome = self.stock.apply(movement).await?;

        if let (true, Some(ledger_id)) = (outcome.applied, outcome.ledger_id) {
            let effect = CommitEffect {
                key: outcome.key.clone(),
                ref_line,
                delta: outcome.delta,
            };
            let event = InventoryEvent::MovementApplied {
                ledger_id,
                key: outcome.key.clone(),
                delta: outcome.delta,
                after_qty: outcome.after,
                reason,
                reference: reference.clone(),
                ref_line,
                occurred_at,
            };
            self.audit.publish(&event, Some(&trace_id));
            metrics::record_movement(reason);
            self.check_committed("apply", &reference, &[effect]).await;
        }
        Ok(outcome)
    }

    /// Get-or-create the batch identity callers attach to inbound movements.
    pub async fn resolve_batch_id(
        &self,
        item_id: ItemId,
        warehouse_id: WarehouseId,
        batch_code: &str,
        production_date: Option<NaiveDate>,
        expiry_date: Option<NaiveDate>,
        on_date: NaiveDate,
    ) -> StoreResult<Batch> {
        self.stock
            .resolve_batch(item_id, warehouse_id, batch_code, production_date, expiry_date, on_date)
            .await
    }

    pub async fn correct_expiry(
        &self,
        item_id: ItemId,
        warehouse_id: WarehouseId,
        batch_code: &str,
        expiry_date: Option<NaiveDate>,
    ) -> StoreResult<Batch> {
        let batch = self
            .stock
            .correct_expiry(item_id, warehouse_id, batch_code, expiry_date)
            .await?;
        info!(
            item_id = %item_id,
            warehouse_id = %warehouse_id,
            batch_code = %batch.batch_code,
            expiry_date = ?batch.expiry_date,
            "batch expiry corrected"
        );
        Ok(batch)
    }

    // Snapshots

    pub async fn snapshot_cut(&self, at: DateTime<Utc>) -> StoreResult<SnapshotCut> {
        let totals = self.stock.ledger_totals(LedgerCut::AtOrBefore(at)).await?;
        let summary = SnapshotSummary::of_cut(&totals);
        Ok(SnapshotCut {
            at,
            totals,
            summary,
        })
    }

    pub async fn rebuild_snapshot(&self, date: NaiveDate) -> StoreResult<SnapshotSummary> {
        self.stock.rebuild_snapshot(date).await
    }

    // Reconciliation, auto-heal, ageing

    /// Three-way comparison at `cut`. Mismatches are data, never errors.
    #[instrument(skip(self), err)]
    pub async fn detect(&self, cut: DateTime<Utc>) -> StoreResult<ReconciliationReport> {
        let ledger = self.stock.ledger_totals(LedgerCut::AtOrBefore(cut)).await?;
        let stock: BTreeMap<StockKey, i64> = self
            .stock
            .stock_slots()
            .await?
            .into_iter()
            .map(|s| (s.key, s.qty))
            .collect();
        let snapshot: BTreeMap<StockKey, i64> = self
            .stock
            .snapshot_rows(cut.date_naive())
            .await?
            .into_iter()
            .map(|r| (r.key, r.qty_on_hand))
            .collect();

        let report = reconcile(cut, &ledger, &stock, &snapshot);
        debug!(mismatches = report.mismatch_count(), "reconciliation computed");
        Ok(report)
    }

    /// Corrective deltas for ledger-vs-stock drift. Never writes.
    pub async fn suggest(&self, cut: DateTime<Utc>) -> StoreResult<Vec<HealSuggestion>> {
        Ok(suggest_heal(&self.detect(cut).await?))
    }

    pub async fn batch_ageing(
        &self,
        today: NaiveDate,
        within_days: i64,
    ) -> StoreResult<Vec<BatchAgeing>> {
        let batches = self.stock.batches().await?;
        Ok(detect_ageing(&batches, today, within_days))
    }

    /// Ageing over the configured window.
    pub async fn ageing_report(&self, today: NaiveDate) -> StoreResult<Vec<BatchAgeing>> {
        self.batch_ageing(today, self.settings.ageing_window_days)
            .await
    }

    // Reservations

    /// `expire_at` for a reservation created at `now` with the default TTL.
    pub fn default_expire_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.settings.reservation_ttl
    }

    pub async fn create_reservation(
        &self,
        new: NewReservation,
        now: DateTime<Utc>,
    ) -> StoreResult<CreatedReservation> {
        let created = self.reservations.create(new, now).await?;
        if created.created {
            let r = &created.reservation;
            self.audit
                .publish(&InventoryEvent::reservation_created(r), Some(&r.trace_id));
        }
        Ok(created)
    }

    pub async fn get_reservation(&self, id: ReservationId) -> StoreResult<Option<Reservation>> {
        self.reservations.get(id).await
    }

    pub async fn consume_reservation(
        &self,
        id: ReservationId,
        now: DateTime<Utc>,
    ) -> StoreResult<(Reservation, ConsumeOutcome)> {
        let (reservation, outcome) = self.reservations.consume(id, now).await?;
        if outcome == ConsumeOutcome::Consumed {
            self.publish_closed(&reservation);
        }
        Ok((reservation, outcome))
    }

    pub async fn cancel_reservation(
        &self,
        id: ReservationId,
        now: DateTime<Utc>,
    ) -> StoreResult<Reservation> {
        let reservation = self.reservations.cancel(id, now).await?;
        self.publish_closed(&reservation);
        Ok(reservation)
    }

    pub async fn find_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<ReservationId>> {
        self.reservations.find_expired(now, limit).await
    }

    pub async fn release_expired_by_id(
        &self,
        id: ReservationId,
        now: DateTime<Utc>,
    ) -> StoreResult<ReleaseOutcome> {
        let outcome = self.reservations.release_expired_by_id(id, now).await?;
        if outcome.is_expired() {
            if let Some(reservation) = self.reservations.get(id).await? {
                self.publish_closed(&reservation);
            }
        }
        Ok(outcome)
    }

    pub async fn sweep(&self, now: DateTime<Utc>, batch_size: usize) -> StoreResult<SweepReport> {
        sweeper::sweep(&self.reservations, self.audit.as_ref(), now, batch_size).await
    }

    /// Sweep with the configured batch size.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> StoreResult<SweepReport> {
        self.sweep(now, self.settings.sweep_batch_size).await
    }

    fn publish_closed(&self, reservation: &Reservation) {
        if let Some(event) = InventoryEvent::reservation_closed(reservation) {
            self.audit.publish(&event, Some(&reservation.trace_id));
        }
    }

    // FEFO allocation

    pub async fn plan(
        &self,
        item_id: ItemId,
        warehouse_id: WarehouseId,
        qty: i64,
        options: &PlanOptions,
    ) -> StoreResult<AllocationPlan> {
        self.stock
            .plan_allocation(item_id, warehouse_id, qty, options)
            .await
    }

    /// Allocates earliest-expiry-first and writes one outbound leg per batch.
    pub async fn allocate(&self, request: &AllocationRequest) -> StoreResult<AllocationResult> {
        let result = self.stock.allocate(request).await?;
        if result.replayed {
            return Ok(result);
        }

        self.metrics.record(&result.plan.outcome);
        if let FefoOutcome::Fallback { used, fefo_head } = &result.plan.outcome {
            warn!(
                item_id = %request.item_id,
                warehouse_id = %request.warehouse_id,
                reference = %request.reference,
                used = %used,
                fefo_head = %fefo_head,
                "allocation deviated from FEFO order"
            );
        }
        for entry in &result.entries {
            self.audit.publish(
                &InventoryEvent::movement_applied(entry),
                Some(&entry.trace_id),
            );
        }
        let effects: Vec<CommitEffect> = result.entries.iter().map(CommitEffect::from).collect();
        self.check_committed("allocate", &request.reference, &effects).await;
        Ok(result)
    }

    pub fn allocation_stats(&self) -> FefoStats {
        self.metrics.snapshot()
    }

    // Diagnostics

    /// Ledger activity in `[from, to]` grouped by movement family, ref and trace.
    pub async fn ledger_diagnostics(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<LedgerDiagnostics> {
        let entries = self.stock.ledger_between(from, to).await?;
        Ok(summarize_ledger(&entries, from, to))
    }

    /// Checks the ledger rows of `reference` against `effects` and the touched
    /// keys' stock against their ledger totals.
    pub async fn verify_commit(
        &self,
        reference: &str,
        effects: &[CommitEffect],
    ) -> StoreResult<CommitCheck> {
        let recorded = self.stock.ledger_entries(reference).await?;
        let balances = self.stock.key_balances(&touched_keys(effects)).await?;
        Ok(verify_commit(reference, effects, &recorded, &balances))
    }

    async fn check_committed(
        &self,
        operation: &'static str,
        reference: &str,
        effects: &[CommitEffect],
    ) {
        if !self.settings.verify_commits || effects.is_empty() {
            return;
        }
        match self.verify_commit(reference, effects).await {
            Ok(check) if check.is_consistent() => {}
            Ok(check) => {
                metrics::record_commit_check_failure(operation);
                error!(
                    operation,
                    reference = %reference,
                    issues = ?check.issues,
                    "committed write left touched keys inconsistent"
                );
            }
            Err(e) => {
                warn!(operation, reference = %reference, error = %e, "commit check could not run");
            }
        }
    }

    // Insights

    /// Dashboard scores recomputed from the stores on every call.
    pub async fn insights(&self, now: DateTime<Utc>) -> StoreResult<InventoryInsights> {
        let today = now.date_naive();
        let stats = self
            .stock
            .ledger_stats(now - Duration::days(ACTIVITY_WINDOW_DAYS))
            .await?;
        let ledger = self.stock.ledger_totals(LedgerCut::AtOrBefore(now)).await?;
        let slots = self.stock.stock_slots().await?;
        let snapshot = self.stock.snapshot_rows(today).await?;
        let batches = self.stock.batches().await?;

        let ledger_qty = |key: &StockKey| ledger.get(key).copied().unwrap_or(0);
        let inputs = InsightInputs {
            ledger_rows: stats.ledger_rows,
            stock_rows: slots.len() as u64,
            stock_keys_matching_ledger: slots.iter().filter(|s| s.qty == ledger_qty(&s.key)).count()
                as u64,
            snapshot_rows: snapshot.len() as u64,
            snapshot_keys_matching_ledger: snapshot
                .iter()
                .filter(|r| r.qty_on_hand == ledger_qty(&r.key))
                .count() as u64,
            ledger_rows_30d: stats.rows_since,
            outbound_ledger_rows: stats.outbound_rows,
            ..InsightInputs::default()
        }
        .with_batch_risk(&batches, today);

        Ok(InventoryInsights::compute(&inputs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use stockledger_core::{BatchKey, DomainError};
    use stockledger_events::{EventBus, InMemoryEventBus};
    use stockledger_inventory::{
        CommitIssue, DeltaSummary, MovementClass, MovementReason, NewReservationLine,
        ReservationKey,
    };

    use crate::audit::{AuditEnvelope, BusAudit};
    use crate::error::StoreError;
    use crate::store::{InMemoryReservationStore, InMemoryStockStore};

    type Engine = InventoryEngine<Arc<InMemoryStockStore>, InMemoryReservationStore>;

    fn wh() -> WarehouseId {
        WarehouseId::new(1).unwrap()
    }

    fn item() -> ItemId {
        ItemId::new(42).unwrap()
    }

    fn at(m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, m, d, 9, 0, 0).unwrap()
    }

    fn key(code: &str) -> StockKey {
        StockKey::new(wh(), item(), BatchKey::from_code(Some(code)).unwrap())
    }

    fn receipt(code: &str, qty: i64, expiry: NaiveDate) -> Movement {
        Movement::new(key(code), qty, MovementReason::Receipt, format!("PO-{code}"), 1, at(1, 1))
            .with_dates(None, Some(expiry))
    }

    fn engine() -> (Engine, Arc<InMemoryStockStore>, Arc<InMemoryEventBus<AuditEnvelope>>) {
        let stock = Arc::new(InMemoryStockStore::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let engine = InventoryEngine::new(stock.clone(), InMemoryReservationStore::new())
            .with_audit(Arc::new(BusAudit::new(bus.clone())));
        (engine, stock, bus)
    }

    async fn seed_two_batches(engine: &Engine) {
        engine
            .apply(receipt("EARLY", 5, NaiveDate::from_ymd_opt(2025, 1, 10).unwrap()))
            .await
            .unwrap();
        engine
            .apply(receipt("LATE", 10, NaiveDate::from_ymd_opt(2025, 2, 1).unwrap()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn applied_movements_are_audited_once() {
        let (engine, _, bus) = engine();
        let sub = bus.subscribe();
        let m = receipt("B1", 4, NaiveDate::from_ymd_opt(2025, 3, 1).unwrap());

        engine.apply(m.clone()).await.unwrap();
        engine.apply(m).await.unwrap();

        let events = sub.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), "inventory.movement.applied");
        assert_eq!(events[0].trace_id().map(|t| t.as_str()), Some("PO-B1"));
    }

    #[tokio::test]
    async fn fresh_rebuild_reconciles_clean() {
        let (engine, _, _) = engine();
        seed_two_batches(&engine).await;

        let summary = engine.rebuild_snapshot(at(1, 1).date_naive()).await.unwrap();
        assert_eq!(summary.slot_count, 2);
        assert_eq!(summary.total_qty, 15);

        let report = engine.detect(at(1, 1)).await.unwrap();
        assert!(report.is_clean(), "{report:?}");
        assert!(engine.suggest(at(1, 1)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn drift_yields_a_heal_suggestion() {
        let (engine, stock, _) = engine();
        seed_two_batches(&engine).await;
        stock.force_slot_qty(key("EARLY"), 3).await;

        let suggestions = engine.suggest(at(1, 2)).await.unwrap();
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].adjust_delta, 2);

        // Suggesting never writes.
        let again = engine.detect(at(1, 2)).await.unwrap();
        assert_eq!(again.ledger_vs_stock.len(), 1);
    }

    #[tokio::test]
    async fn snapshot_cut_is_not_persisted() {
        let (engine, stock, _) = engine();
        seed_two_batches(&engine).await;

        let cut = engine.snapshot_cut(at(1, 1)).await.unwrap();
        assert_eq!(cut.summary.total_qty, 15);
        assert!(stock.snapshot_rows(at(1, 1).date_naive()).await.unwrap().is_empty());

        let before = engine.snapshot_cut(at(1, 1) - Duration::seconds(1)).await.unwrap();
        assert_eq!(before.summary.slot_count, 0);
    }

    #[tokio::test]
    async fn allocation_spills_and_counts_quality() {
        let (engine, _, bus) = engine();
        seed_two_batches(&engine).await;
        let sub = bus.subscribe();

        // LATE is not the FEFO head while EARLY still has stock.
        let mut pinned = AllocationRequest::new(item(), wh(), 2, "SO-2", at(1, 2));
        pinned.preferred_batch = Some(BatchKey::from_code(Some("LATE")).unwrap());
        let pinned = engine.allocate(&pinned).await.unwrap();
        assert!(pinned.plan.outcome.is_fallback());
        assert_eq!(pinned.plan.legs[0].key, key("LATE"));

        let request = AllocationRequest::new(item(), wh(), 8, "SO-1", at(1, 2));
        let result = engine.allocate(&request).await.unwrap();
        let legs: Vec<(&str, i64)> = result
            .plan
            .legs
            .iter()
            .map(|l| (l.key.batch.as_key(), l.qty))
            .collect();
        assert_eq!(legs, vec![("EARLY", 5), ("LATE", 3)]);
        assert!(!result.plan.outcome.is_fallback());
        assert_eq!(sub.drain().len(), 3);

        // Replays are not counted again.
        assert!(engine.allocate(&request).await.unwrap().replayed);

        let stats = engine.allocation_stats();
        assert_eq!(stats.total(), 2);
        assert_eq!(stats.fallbacks, 1);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn oversized_allocation_mutates_nothing() {
        let (engine, _, _) = engine();
        seed_two_batches(&engine).await;

        let request = AllocationRequest::new(item(), wh(), 16, "SO-big", at(1, 2));
        let err = engine.allocate(&request).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Domain(DomainError::InsufficientStock {
                requested: 16,
                available: 15
            })
        ));
        assert_eq!(engine.snapshot_cut(at(1, 3)).await.unwrap().summary.total_qty, 15);
    }

    #[tokio::test]
    async fn ageing_uses_configured_window() {
        let (engine, _, _) = engine();
        seed_two_batches(&engine).await;

        let report = engine.ageing_report(at(1, 5).date_naive()).await.unwrap();
        let codes: Vec<&str> = report.iter().map(|a| a.batch_code.as_str()).collect();
        assert_eq!(codes, vec!["EARLY", "LATE"]);
        assert_eq!(report[0].days_left, 5);
    }

    #[tokio::test]
    async fn reservation_lifecycle_is_audited() {
        let (engine, _, bus) = engine();
        let sub = bus.subscribe();
        let now = at(1, 1);

        let new = NewReservation {
            key: ReservationKey::new("web", "S1", wh(), "SO-9"),
            lines: vec![NewReservationLine {
                ref_line: 1,
                item_id: item(),
                qty: 1,
            }],
            expire_at: engine.default_expire_at(now),
            trace_id: None,
        };
        let created = engine.create_reservation(new.clone(), now).await.unwrap();
        assert!(created.created);
        assert_eq!(created.reservation.expire_at, now + Duration::minutes(30));
        assert!(!engine.create_reservation(new, now).await.unwrap().created);

        let later = now + Duration::hours(1);
        let report = engine.sweep_expired(later).await.unwrap();
        assert_eq!(report.expired, vec![created.reservation.id]);
        assert_eq!(engine.sweep(later, 1).await.unwrap().expired_count(), 0);

        let types: Vec<String> = sub.drain().iter().map(|e| e.event_type().to_string()).collect();
        assert_eq!(
            types,
            vec!["inventory.reservation.created", "inventory.reservation.expired"]
        );
    }

    #[tokio::test]
    async fn insights_on_a_consistent_store() {
        let (engine, _, _) = engine();
        seed_two_batches(&engine).await;
        engine
            .allocate(&AllocationRequest::new(item(), wh(), 2, "SO-1", at(1, 2)))
            .await
            .unwrap();
        engine.rebuild_snapshot(at(1, 3).date_naive()).await.unwrap();

        let insights = engine.insights(at(1, 3)).await.unwrap();
        // 3 ledger rows, 2 stock rows.
        assert_eq!(insights.inventory_health_score, 0.6667);
        assert_eq!(insights.inventory_accuracy_score, 1.0);
        assert_eq!(insights.snapshot_accuracy_score, 1.0);
        assert_eq!(insights.batch_activity_30d, 3);
        assert_eq!(insights.warehouse_efficiency, 0.3333);
        // EARLY has 7 days left (HIGH), LATE 29 (LOW): (3 + 1) / 6.
        assert_eq!(insights.batch_risk_score, 0.6667);
    }

    #[tokio::test]
    async fn committed_writes_check_out_until_stock_drifts() {
        let (engine, stock, _) = engine();
        seed_two_batches(&engine).await;
        let result = engine
            .allocate(&AllocationRequest::new(item(), wh(), 7, "SO-1", at(1, 2)))
            .await
            .unwrap();
        let effects: Vec<CommitEffect> = result.entries.iter().map(CommitEffect::from).collect();

        let check = engine.verify_commit("SO-1", &effects).await.unwrap();
        assert!(check.is_consistent(), "{check:?}");
        assert_eq!(check.touched_keys, 2);

        stock.force_slot_qty(key("LATE"), 1).await;
        let check = engine.verify_commit("SO-1", &effects).await.unwrap();
        assert_eq!(
            check.issues,
            vec![CommitIssue::StockDrift {
                key: key("LATE"),
                ledger_qty: 8,
                stock_qty: 1
            }]
        );

        // The write after drift still commits; the check only reports.
        let outcome = engine
            .apply(Movement::new(key("LATE"), 1, MovementReason::Return, "RMA-1", 1, at(1, 3)))
            .await
            .unwrap();
        assert!(outcome.applied);
        assert_eq!(outcome.after, 2);
    }

    #[tokio::test]
    async fn commit_check_reports_effects_without_ledger_rows() {
        let (engine, _, _) = engine();
        seed_two_batches(&engine).await;

        let effects = vec![CommitEffect {
            key: key("EARLY"),
            ref_line: 2,
            delta: 5,
        }];
        let check = engine.verify_commit("PO-EARLY", &effects).await.unwrap();
        assert_eq!(
            check.issues,
            vec![CommitIssue::MissingLedger {
                key: key("EARLY"),
                ref_line: 2
            }]
        );
    }

    #[tokio::test]
    async fn diagnostics_cover_the_window_only() {
        let (engine, _, _) = engine();
        seed_two_batches(&engine).await;
        engine
            .allocate(&AllocationRequest::new(item(), wh(), 7, "SO-1", at(1, 2)))
            .await
            .unwrap();

        let d = engine.ledger_diagnostics(at(1, 2), at(1, 3)).await.unwrap();
        assert_eq!(d.by_movement_type.len(), 1);
        assert_eq!(
            d.by_movement_type[&MovementClass::Outbound],
            DeltaSummary {
                count: 2,
                total_delta: -7
            }
        );
        assert_eq!(d.by_ref.keys().collect::<Vec<_>>(), vec!["SO-1"]);

        let all = engine.ledger_diagnostics(at(1, 1), at(1, 3)).await.unwrap();
        assert_eq!(all.by_ref.len(), 3);
        assert_eq!(all.by_movement_type[&MovementClass::Inbound].total_delta, 15);
    }
}
