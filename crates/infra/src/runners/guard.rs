//! Scheduled reconciliation with alerting.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use stockledger_inventory::ReconciliationReport;

use super::Job;
use crate::engine::InventoryEngine;
use crate::error::StoreResult;
use crate::metrics;
use crate::store::{ReservationStore, StockStore};

/// What the guard hands to the alert channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationAlert {
    pub cut: DateTime<Utc>,
    pub ledger_vs_stock: usize,
    pub ledger_vs_snapshot: usize,
    pub stock_vs_snapshot: usize,
    pub report: ReconciliationReport,
}

impl ReconciliationAlert {
    pub fn from_report(report: ReconciliationReport) -> Self {
        Self {
            cut: report.cut,
            ledger_vs_stock: report.ledger_vs_stock.len(),
            ledger_vs_snapshot: report.ledger_vs_snapshot.len(),
            stock_vs_snapshot: report.stock_vs_snapshot.len(),
            report,
        }
    }
}

/// Destination of reconciliation alerts (pager, chat, log pipeline).
pub trait AlertSink: Send + Sync + 'static {
    fn raise(&self, alert: ReconciliationAlert);
}

/// In-memory sink for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryAlertSink {
    inner: Mutex<Vec<ReconciliationAlert>>,
}

impl InMemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<ReconciliationAlert> {
        match self.inner.lock() {
            Ok(alerts) => alerts.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl AlertSink for InMemoryAlertSink {
    fn raise(&self, alert: ReconciliationAlert) {
        match self.inner.lock() {
            Ok(mut alerts) => alerts.push(alert),
            Err(poisoned) => poisoned.into_inner().push(alert),
        }
    }
}

/// Runs `detect(now)` and raises an alert when any mismatch list is non-empty.
pub struct ReconciliationGuard<S, R> {
    engine: Arc<InventoryEngine<S, R>>,
    alerts: Arc<dyn AlertSink>,
}

impl<S, R> ReconciliationGuard<S, R> {
    pub fn new(engine: Arc<InventoryEngine<S, R>>, alerts: Arc<dyn AlertSink>) -> Self {
        Self { engine, alerts }
    }
}

#[async_trait]
impl<S, R> Job for ReconciliationGuard<S, R>
where
    S: StockStore + 'static,
    R: ReservationStore + 'static,
{
    fn name(&self) -> &'static str {
        "reconciliation-guard"
    }

    #[instrument(skip(self), err)]
    async fn run_once(&self, now: DateTime<Utc>) -> StoreResult<()> {
        let report = self.engine.detect(now).await?;
        metrics::record_reconciliation(&report);
        if report.is_clean() {
            info!(
                stock_keys = report.total_stock_keys,
                "reconciliation clean"
            );
            return Ok(());
        }

        let alert = ReconciliationAlert::from_report(report);
        warn!(
            ledger_vs_stock = alert.ledger_vs_stock,
            ledger_vs_snapshot = alert.ledger_vs_snapshot,
            stock_vs_snapshot = alert.stock_vs_snapshot,
            "reconciliation mismatch"
        );
        self.alerts.raise(alert);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use stockledger_core::{BatchKey, ItemId, WarehouseId};
    use stockledger_inventory::{Movement, MovementReason, StockKey};

    use crate::store::{InMemoryReservationStore, InMemoryStockStore};

    fn key() -> StockKey {
        StockKey::new(
            WarehouseId::new(1).unwrap(),
            ItemId::new(5).unwrap(),
            BatchKey::none(),
        )
    }

    #[tokio::test]
    async fn raises_only_on_mismatch() {
        let stock = Arc::new(InMemoryStockStore::new());
        let engine = Arc::new(InventoryEngine::new(
            stock.clone(),
            InMemoryReservationStore::new(),
        ));
        let alerts = Arc::new(InMemoryAlertSink::new());
        let guard = ReconciliationGuard::new(engine.clone(), alerts.clone());

        let now = Utc.with_ymd_and_hms(2025, 1, 1, 18, 0, 0).unwrap();
        engine
            .apply(Movement::new(
                key(),
                7,
                MovementReason::Count,
                "CNT-1",
                1,
                now,
            ))
            .await
            .unwrap();
        engine.rebuild_snapshot(now.date_naive()).await.unwrap();

        guard.run_once(now).await.unwrap();
        assert!(alerts.all().is_empty());

        stock.force_slot_qty(key(), 4).await;
        guard.run_once(now).await.unwrap();

        let raised = alerts.all();
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].ledger_vs_stock, 1);
        assert_eq!(raised[0].ledger_vs_snapshot, 0);
        assert_eq!(raised[0].stock_vs_snapshot, 1);
    }
}
