//! TTL sweep over open reservations.
//!
//! One invocation drains successive `find_expired` batches until a batch comes
//! back short, so nothing eligible at `now` is left behind whatever the batch
//! size. Each id is released in its own transaction; a failing id is logged,
//! recorded, and skipped by later batches of the same run.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use stockledger_core::{DomainError, ReservationId};
use stockledger_inventory::{InventoryEvent, ReleaseOutcome};

use crate::audit::AuditSink;
use crate::error::StoreResult;
use crate::metrics;
use crate::store::ReservationStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Number of `find_expired` batches fetched.
    pub batches: usize,
    pub expired: Vec<ReservationId>,
    /// Candidates another caller closed first.
    pub noops: usize,
    pub failed: Vec<SweepFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepFailure {
    pub id: ReservationId,
    pub error: String,
}

impl SweepReport {
    pub fn expired_count(&self) -> usize {
        self.expired.len()
    }
}

#[instrument(skip(store, audit), err)]
pub async fn sweep<S>(
    store: &S,
    audit: &dyn AuditSink,
    now: DateTime<Utc>,
    batch_size: usize,
) -> StoreResult<SweepReport>
where
    S: ReservationStore + ?Sized,
{
    if batch_size == 0 {
        return Err(DomainError::validation("sweep batch_size must be at least 1").into());
    }

    let mut report = SweepReport::default();
    let mut failed: HashSet<ReservationId> = HashSet::new();

    loop {
        // Ids that failed earlier still match the query; widen the window past them.
        let limit = batch_size + failed.len();
        let ids = store.find_expired(now, limit).await?;
        report.batches += 1;

        let candidates: Vec<ReservationId> =
            ids.iter().copied().filter(|id| !failed.contains(id)).collect();
        if candidates.is_empty() {
            break;
        }

        for id in candidates {
            match store.release_expired_by_id(id, now).await {
                Ok(ReleaseOutcome::Expired { id }) => {
                    report.expired.push(id);
                    publish_expired(store, audit, id).await;
                }
                Ok(ReleaseOutcome::Noop { .. }) => {
                    debug!(reservation_id = %id, "reservation no longer open");
                    report.noops += 1;
                }
                Err(e) => {
                    warn!(
                        reservation_id = %id,
                        code = e.code(),
                        error = %e,
                        "failed to release expired reservation"
                    );
                    failed.insert(id);
                    report.failed.push(SweepFailure {
                        id,
                        error: e.to_string(),
                    });
                }
            }
        }

        if ids.len() < limit {
            break;
        }
    }

    metrics::record_expired(report.expired.len());
    if !report.expired.is_empty() || !report.failed.is_empty() {
        info!(
            expired = report.expired.len(),
            noops = report.noops,
            failed = report.failed.len(),
            batches = report.batches,
            "reservation sweep finished"
        );
    }
    Ok(report)
}

async fn publish_expired<S>(store: &S, audit: &dyn AuditSink, id: ReservationId)
where
    S: ReservationStore + ?Sized,
{
    match store.get(id).await {
        Ok(Some(reservation)) => {
            if let Some(event) = InventoryEvent::reservation_closed(&reservation) {
                audit.publish(&event, Some(&reservation.trace_id));
            }
        }
        Ok(None) => {}
        Err(e) => {
            warn!(reservation_id = %id, error = %e, "failed to load expired reservation for audit")
        }
    }
}
