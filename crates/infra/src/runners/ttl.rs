use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::Job;
use crate::engine::InventoryEngine;
use crate::error::StoreResult;
use crate::store::{ReservationStore, StockStore};

/// Expires open reservations past their TTL.
///
/// Per-id release failures are reported by the sweep itself and do not fail
/// the run; only a failing candidate query does.
pub struct TtlSweeper<S, R> {
    engine: Arc<InventoryEngine<S, R>>,
}

impl<S, R> TtlSweeper<S, R> {
    pub fn new(engine: Arc<InventoryEngine<S, R>>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl<S, R> Job for TtlSweeper<S, R>
where
    S: StockStore + 'static,
    R: ReservationStore + 'static,
{
    fn name(&self) -> &'static str {
        "ttl-sweeper"
    }

    async fn run_once(&self, now: DateTime<Utc>) -> StoreResult<()> {
        self.engine.sweep_expired(now).await?;
        Ok(())
    }
}
