//! Dashboard scores derived from already-gathered aggregates.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::batch::{Batch, RiskLevel};

/// Raw counts a store collects before scoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsightInputs {
    pub ledger_rows: u64,
    pub stock_rows: u64,
    /// Stock keys whose quantity equals the ledger sum.
    pub stock_keys_matching_ledger: u64,
    /// Rows of today's snapshot.
    pub snapshot_rows: u64,
    /// Ledger keys whose sum equals today's snapshot quantity.
    pub snapshot_keys_matching_ledger: u64,
    pub ledger_rows_30d: u64,
    pub outbound_ledger_rows: u64,
    pub batches_with_expiry: u64,
    /// Σ risk weight over batches with expiry.
    pub risk_points: u64,
}

impl InsightInputs {
    /// Fills `batches_with_expiry` and `risk_points` from batch rows.
    pub fn with_batch_risk(mut self, batches: &[Batch], today: NaiveDate) -> Self {
        let mut with_expiry = 0u64;
        let mut points = 0u64;
        for days_left in batches.iter().filter_map(|b| b.days_left(today)) {
            with_expiry += 1;
            points += RiskLevel::classify(days_left).map_or(0, |r| u64::from(r.weight()));
        }
        self.batches_with_expiry = with_expiry;
        self.risk_points = points;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InventoryInsights {
    pub inventory_health_score: f64,
    pub inventory_accuracy_score: f64,
    pub snapshot_accuracy_score: f64,
    pub batch_activity_30d: u64,
    pub batch_risk_score: f64,
    pub warehouse_efficiency: f64,
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

fn ratio(num: u64, den: u64) -> f64 {
    num as f64 / den.max(1) as f64
}

impl InventoryInsights {
    pub fn compute(inputs: &InsightInputs) -> Self {
        let health = if inputs.ledger_rows == 0 {
            1.0
        } else {
            ratio(inputs.stock_rows, inputs.ledger_rows)
        };
        let risk = if inputs.batches_with_expiry == 0 {
            0.0
        } else {
            ratio(inputs.risk_points, inputs.batches_with_expiry * 3)
        };

        Self {
            inventory_health_score: round4(health.clamp(0.0, 1.0)),
            inventory_accuracy_score: round4(
                ratio(inputs.stock_keys_matching_ledger, inputs.stock_rows).clamp(0.0, 1.0),
            ),
            snapshot_accuracy_score: round4(
                ratio(inputs.snapshot_keys_matching_ledger, inputs.snapshot_rows).clamp(0.0, 1.0),
            ),
            batch_activity_30d: inputs.ledger_rows_30d,
            batch_risk_score: round4(risk),
            warehouse_efficiency: round4(ratio(inputs.outbound_ledger_rows, inputs.ledger_rows)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use stockledger_core::{ItemId, WarehouseId};

    #[test]
    fn empty_system_scores() {
        let insights = InventoryInsights::compute(&InsightInputs::default());
        assert_eq!(insights.inventory_health_score, 1.0);
        assert_eq!(insights.inventory_accuracy_score, 0.0);
        assert_eq!(insights.batch_risk_score, 0.0);
        assert_eq!(insights.warehouse_efficiency, 0.0);
    }

    #[test]
    fn ratios_are_rounded_and_clamped() {
        let inputs = InsightInputs {
            ledger_rows: 3,
            stock_rows: 5,
            stock_keys_matching_ledger: 2,
            outbound_ledger_rows: 1,
            ..Default::default()
        };
        let insights = InventoryInsights::compute(&inputs);
        assert_eq!(insights.inventory_health_score, 1.0);
        assert_eq!(insights.inventory_accuracy_score, 0.4);
        assert_eq!(insights.warehouse_efficiency, 0.3333);
    }

    #[test]
    fn risk_is_weighted_over_dated_batches() {
        let today = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let batch = |days: Option<u64>| Batch {
            id: 1,
            item_id: ItemId::new(1).unwrap(),
            warehouse_id: WarehouseId::new(1).unwrap(),
            batch_code: "B".into(),
            production_date: None,
            expiry_date: days.map(|d| today + chrono::Days::new(d)),
            created_at: Utc::now(),
        };
        let batches = vec![batch(Some(3)), batch(Some(20)), batch(Some(90)), batch(None)];

        let inputs = InsightInputs::default().with_batch_risk(&batches, today);
        assert_eq!(inputs.batches_with_expiry, 3);
        assert_eq!(inputs.risk_points, 4);
        assert_eq!(InventoryInsights::compute(&inputs).batch_risk_score, 0.4444);
    }
}
