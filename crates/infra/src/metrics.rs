//! Engine metrics.
//!
//! Counters go through the `metrics` facade; whichever recorder the binary
//! installs (Prometheus in the worker) receives them. Without a recorder the
//! macros are no-ops.
//!
//! | metric | kind | labels |
//! |--------|------|--------|
//! | `inventory_fefo_allocations_total` | counter | `outcome` = `strict` / `fallback` |
//! | `inventory_movements_applied_total` | counter | `reason` |
//! | `inventory_reservations_expired_total` | counter | |
//! | `inventory_reconciliation_mismatches` | gauge | `kind` |
//! | `inventory_runner_failures_total` | counter | `runner` |
//! | `inventory_commit_check_failures_total` | counter | `operation` |

use std::sync::Mutex;

use ::metrics::{counter, describe_counter, describe_gauge, gauge};

use stockledger_inventory::{FefoOutcome, FefoStats, MovementReason, ReconciliationReport};

pub const FEFO_ALLOCATIONS_TOTAL: &str = "inventory_fefo_allocations_total";
pub const MOVEMENTS_APPLIED_TOTAL: &str = "inventory_movements_applied_total";
pub const RESERVATIONS_EXPIRED_TOTAL: &str = "inventory_reservations_expired_total";
pub const RECONCILIATION_MISMATCHES: &str = "inventory_reconciliation_mismatches";
pub const RUNNER_FAILURES_TOTAL: &str = "inventory_runner_failures_total";
pub const COMMIT_CHECK_FAILURES_TOTAL: &str = "inventory_commit_check_failures_total";

/// Registers descriptions with the installed recorder. Call once after installing it.
pub fn describe() {
    describe_counter!(
        FEFO_ALLOCATIONS_TOTAL,
        "Allocations split by whether they followed strict FEFO order"
    );
    describe_counter!(MOVEMENTS_APPLIED_TOTAL, "Ledger movements applied");
    describe_counter!(RESERVATIONS_EXPIRED_TOTAL, "Reservations expired by the TTL sweep");
    describe_gauge!(
        RECONCILIATION_MISMATCHES,
        "Mismatching keys found by the last reconciliation"
    );
    describe_counter!(RUNNER_FAILURES_TOTAL, "Failed background runner attempts");
    describe_counter!(
        COMMIT_CHECK_FAILURES_TOTAL,
        "Committed writes whose touched keys did not check out"
    );
}

pub fn record_movement(reason: MovementReason) {
    counter!(MOVEMENTS_APPLIED_TOTAL, "reason" => reason.as_str()).increment(1);
}

pub fn record_expired(count: usize) {
    counter!(RESERVATIONS_EXPIRED_TOTAL).increment(count as u64);
}

pub fn record_reconciliation(report: &ReconciliationReport) {
    gauge!(RECONCILIATION_MISMATCHES, "kind" => "ledger_vs_stock")
        .set(report.ledger_vs_stock.len() as f64);
    gauge!(RECONCILIATION_MISMATCHES, "kind" => "ledger_vs_snapshot")
        .set(report.ledger_vs_snapshot.len() as f64);
    gauge!(RECONCILIATION_MISMATCHES, "kind" => "stock_vs_snapshot")
        .set(report.stock_vs_snapshot.len() as f64);
}

pub fn record_runner_failure(runner: &'static str) {
    counter!(RUNNER_FAILURES_TOTAL, "runner" => runner).increment(1);
}

pub fn record_commit_check_failure(operation: &'static str) {
    counter!(COMMIT_CHECK_FAILURES_TOTAL, "operation" => operation).increment(1);
}

/// FEFO allocation quality.
///
/// Every outcome is emitted as `inventory_fefo_allocations_total`; the same
/// outcomes are folded into a [`FefoStats`] the engine can report without a
/// recorder.
#[derive(Debug, Default)]
pub struct AllocationMetrics {
    stats: Mutex<FefoStats>,
}

impl AllocationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, outcome: &FefoOutcome) {
        counter!(FEFO_ALLOCATIONS_TOTAL, "outcome" => outcome.label()).increment(1);
        if let Ok(mut stats) = self.stats.lock() {
            stats.record(outcome);
        }
    }

    pub fn snapshot(&self) -> FefoStats {
        self.stats.lock().map(|s| *s).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockledger_core::BatchKey;

    #[test]
    fn counts_split_by_outcome() {
        let metrics = AllocationMetrics::new();
        metrics.record(&FefoOutcome::Strict);
        metrics.record(&FefoOutcome::Strict);
        metrics.record(&FefoOutcome::Fallback {
            used: BatchKey::from_code(Some("B2")).unwrap(),
            fefo_head: BatchKey::from_code(Some("B1")).unwrap(),
        });

        let stats = metrics.snapshot();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.fallbacks, 1);
        assert!((stats.hit_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn recording_without_a_recorder_is_harmless() {
        describe();
        record_movement(MovementReason::Receipt);
        record_expired(3);
        record_runner_failure("ttl-sweeper");
        record_commit_check_failure("apply");
    }
}
