use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use super::Job;
use crate::engine::InventoryEngine;
use crate::error::StoreResult;
use crate::store::{ReservationStore, StockStore};

/// Rebuilds the snapshot of the current UTC day.
pub struct SnapshotPipeline<S, R> {
    engine: Arc<InventoryEngine<S, R>>,
}

impl<S, R> SnapshotPipeline<S, R> {
    pub fn new(engine: Arc<InventoryEngine<S, R>>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl<S, R> Job for SnapshotPipeline<S, R>
where
    S: StockStore + 'static,
    R: ReservationStore + 'static,
{
    fn name(&self) -> &'static str {
        "snapshot-pipeline"
    }

    async fn run_once(&self, now: DateTime<Utc>) -> StoreResult<()> {
        let date = now.date_naive();
        let summary = self.engine.rebuild_snapshot(date).await?;
        info!(
            snapshot_date = %date,
            slots = summary.slot_count,
            total_qty = summary.total_qty,
            "snapshot rebuilt"
        );
        Ok(())
    }
}
