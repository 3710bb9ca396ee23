//! First-expiry-first-out batch planning.
//!
//! `plan` is pure: the store locks the candidate slots, asks for a plan, and
//! writes one outbound ledger leg per planned batch in the same transaction.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use stockledger_core::{BatchKey, DomainError, DomainResult, ItemId, WarehouseId};

use crate::movement::StockKey;

/// A stock slot that may feed an allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FefoCandidate {
    pub key: StockKey,
    pub qty: i64,
    pub expiry_date: Option<NaiveDate>,
    /// Slot creation order; breaks ties between equal expiry dates.
    pub slot_seq: i64,
}

impl FefoCandidate {
    fn sort_key(&self) -> (bool, Option<NaiveDate>, i64) {
        (self.expiry_date.is_none(), self.expiry_date, self.slot_seq)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanOptions {
    /// Allocation date; batches expiring before it are skipped.
    pub on_date: NaiveDate,
    pub allow_expired: bool,
    /// Operational override: drain this batch first if it is eligible.
    pub preferred_batch: Option<BatchKey>,
}

impl PlanOptions {
    pub fn on(on_date: NaiveDate) -> Self {
        Self {
            on_date,
            allow_expired: false,
            preferred_batch: None,
        }
    }

    pub fn allowing_expired(mut self) -> Self {
        self.allow_expired = true;
        self
    }

    pub fn preferring(mut self, batch: BatchKey) -> Self {
        self.preferred_batch = Some(batch);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationLeg {
    pub key: StockKey,
    pub qty: i64,
    pub expiry_date: Option<NaiveDate>,
}

/// Whether the plan followed strict earliest-first order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FefoOutcome {
    Strict,
    Fallback {
        used: BatchKey,
        fefo_head: BatchKey,
    },
}

impl FefoOutcome {
    pub fn is_fallback(&self) -> bool {
        matches!(self, FefoOutcome::Fallback { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            FefoOutcome::Strict => "strict",
            FefoOutcome::Fallback { .. } => "fallback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationPlan {
    pub item_id: ItemId,
    pub warehouse_id: WarehouseId,
    pub requested: i64,
    pub legs: Vec<AllocationLeg>,
    pub outcome: FefoOutcome,
}

impl AllocationPlan {
    pub fn allocated(&self) -> i64 {
        self.legs.iter().map(|l| l.qty).sum()
    }
}

/// Hit/fallback counters for allocation quality.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FefoStats {
    pub hits: u64,
    pub fallbacks: u64,
}

impl FefoStats {
    pub fn record(&mut self, outcome: &FefoOutcome) {
        if outcome.is_fallback() {
            self.fallbacks += 1;
        } else {
            self.hits += 1;
        }
    }

    pub fn total(&self) -> u64 {
        self.hits + self.fallbacks
    }

    /// Share of allocations that followed strict FEFO; 1.0 when nothing ran yet.
    pub fn hit_rate(&self) -> f64 {
        match self.total() {
            0 => 1.0,
            total => self.hits as f64 / total as f64,
        }
    }
}

/// Plans an outbound allocation of `qty` units.
///
/// Candidates for other items or warehouses, empty slots, and (unless allowed)
/// expired batches are ignored. Batches without expiry go last.
pub fn plan(
    item_id: ItemId,
    warehouse_id: WarehouseId,
    qty: i64,
    candidates: &[FefoCandidate],
    options: &PlanOptions,
) -> DomainResult<AllocationPlan> {
    if qty <= 0 {
        return Err(DomainError::validation(format!(
            "allocation qty must be positive, got {qty}"
        )));
    }

    let mut eligible: Vec<&FefoCandidate> = candidates
        .iter()
        .filter(|c| c.key.item_id == item_id && c.key.warehouse_id == warehouse_id)
        .filter(|c| c.qty > 0)
        .filter(|c| {
            options.allow_expired || c.expiry_date.is_none_or(|exp| exp >= options.on_date)
        })
        .collect();
    eligible.sort_by_key(|c| c.sort_key());

    let available: i64 = eligible.iter().map(|c| c.qty).sum();
    if available < qty {
        return Err(DomainError::insufficient_stock(qty, available));
    }

    let mut outcome = FefoOutcome::Strict;
    if let Some(preferred) = &options.preferred_batch {
        if let Some(pos) = eligible.iter().position(|c| &c.key.batch == preferred) {
            if pos > 0 {
                outcome = FefoOutcome::Fallback {
                    used: preferred.clone(),
                    fefo_head: eligible[0].key.batch.clone(),
                };
                let chosen = eligible.remove(pos);
                eligible.insert(0, chosen);
            }
        }
    }

    let mut remaining = qty;
    let mut legs = Vec::new();
    for candidate in eligible {
        if remaining == 0 {
            break;
        }
        let take = remaining.min(candidate.qty);
        legs.push(AllocationLeg {
            key: candidate.key.clone(),
            qty: take,
            expiry_date: candidate.expiry_date,
        });
        remaining -= take;
    }

    Ok(AllocationPlan {
        item_id,
        warehouse_id,
        requested: qty,
        legs,
        outcome,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn item() -> ItemId {
        ItemId::new(9).unwrap()
    }

    fn wh() -> WarehouseId {
        WarehouseId::new(2).unwrap()
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn candidate(code: &str, qty: i64, expiry: Option<NaiveDate>, seq: i64) -> FefoCandidate {
        FefoCandidate {
            key: StockKey::new(wh(), item(), BatchKey::from_code(Some(code)).unwrap()),
            qty,
            expiry_date: expiry,
            slot_seq: seq,
        }
    }

    #[test]
    fn earliest_batch_is_drained_first_then_spills_over() {
        let candidates = vec![
            candidate("LATE", 10, Some(day(2025, 2, 1)), 1),
            candidate("EARLY", 5, Some(day(2025, 1, 10)), 2),
        ];
        let plan = plan(item(), wh(), 8, &candidates, &PlanOptions::on(day(2025, 1, 1))).unwrap();

        let legs: Vec<_> = plan
            .legs
            .iter()
            .map(|l| (l.key.batch.as_key().to_string(), l.qty))
            .collect();
        assert_eq!(legs, vec![("EARLY".to_string(), 5), ("LATE".to_string(), 3)]);
        assert_eq!(plan.outcome, FefoOutcome::Strict);
    }

    #[test]
    fn shortfall_is_insufficient_stock() {
        let candidates = vec![
            candidate("A", 5, Some(day(2025, 1, 10)), 1),
            candidate("B", 10, Some(day(2025, 2, 1)), 2),
        ];
        let err = plan(item(), wh(), 16, &candidates, &PlanOptions::on(day(2025, 1, 1))).unwrap_err();
        assert_eq!(err, DomainError::insufficient_stock(16, 15));
    }

    #[test]
    fn undated_batches_go_last() {
        let candidates = vec![
            candidate("NOEXP", 10, None, 1),
            candidate("DATED", 2, Some(day(2030, 1, 1)), 2),
        ];
        let plan = plan(item(), wh(), 3, &candidates, &PlanOptions::on(day(2025, 1, 1))).unwrap();
        assert_eq!(plan.legs[0].key.batch.as_key(), "DATED");
        assert_eq!(plan.legs[1].key.batch.as_key(), "NOEXP");
    }

    #[test]
    fn expired_batches_are_skipped_unless_allowed() {
        let candidates = vec![
            candidate("OLD", 4, Some(day(2024, 12, 1)), 1),
            candidate("NEW", 4, Some(day(2025, 6, 1)), 2),
        ];
        let today = day(2025, 1, 1);
        let err = plan(item(), wh(), 6, &candidates, &PlanOptions::on(today)).unwrap_err();
        assert!(matches!(err, DomainError::InsufficientStock { available: 4, .. }));

        let plan = plan(item(), wh(), 6, &candidates, &PlanOptions::on(today).allowing_expired())
            .unwrap();
        assert_eq!(plan.legs[0].key.batch.as_key(), "OLD");
    }

    #[test]
    fn ties_break_by_slot_order() {
        let exp = Some(day(2025, 3, 1));
        let candidates = vec![candidate("SECOND", 5, exp, 7), candidate("FIRST", 5, exp, 3)];
        let plan = plan(item(), wh(), 2, &candidates, &PlanOptions::on(day(2025, 1, 1))).unwrap();
        assert_eq!(plan.legs.len(), 1);
        assert_eq!(plan.legs[0].key.batch.as_key(), "FIRST");
    }

    #[test]
    fn preferred_non_head_batch_is_a_fallback() {
        let candidates = vec![
            candidate("EARLY", 5, Some(day(2025, 1, 10)), 1),
            candidate("LATE", 10, Some(day(2025, 2, 1)), 2),
        ];
        let opts = PlanOptions::on(day(2025, 1, 1))
            .preferring(BatchKey::from_code(Some("LATE")).unwrap());
        let plan = plan(item(), wh(), 4, &candidates, &opts).unwrap();

        assert_eq!(plan.legs[0].key.batch.as_key(), "LATE");
        assert!(plan.outcome.is_fallback());

        let mut stats = FefoStats::default();
        stats.record(&plan.outcome);
        stats.record(&FefoOutcome::Strict);
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[test]
    fn non_positive_qty_is_rejected() {
        assert!(plan(item(), wh(), 0, &[], &PlanOptions::on(day(2025, 1, 1))).is_err());
    }

    proptest! {
        #[test]
        fn legs_follow_expiry_and_sum_to_demand(
            slots in prop::collection::vec((1i64..20, proptest::option::of(0u32..365)), 1..12),
            want in 1i64..100,
        ) {
            let base = day(2025, 1, 1);
            let candidates: Vec<FefoCandidate> = slots
                .iter()
                .enumerate()
                .map(|(i, (qty, offset))| {
                    let expiry = offset.map(|o| base + chrono::Days::new(o as u64));
                    candidate(&format!("B{i}"), *qty, expiry, i as i64)
                })
                .collect();
            let total: i64 = candidates.iter().map(|c| c.qty).sum();

            match plan(item(), wh(), want, &candidates, &PlanOptions::on(base)) {
                Ok(plan) => {
                    prop_assert_eq!(plan.allocated(), want);
                    let keys: Vec<_> = plan
                        .legs
                        .iter()
                        .map(|l| (l.expiry_date.is_none(), l.expiry_date))
                        .collect();
                    let mut sorted = keys.clone();
                    sorted.sort();
                    prop_assert_eq!(keys, sorted);
                }
                Err(DomainError::InsufficientStock { available, .. }) => {
                    prop_assert!(total < want);
                    prop_assert_eq!(available, total);
                }
                Err(other) => prop_assert!(false, "unexpected error {other}"),
            }
        }
    }
}
