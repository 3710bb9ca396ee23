//! Three-way comparison of ledger, stock and snapshot, plus heal suggestions,
//! ledger diagnostics and the post-commit check of touched keys.
//!
//! Mismatches are data, not errors: nothing here fails on drift.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::movement::{LedgerEntry, MovementReason, StockKey};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchKind {
    LedgerVsStock,
    LedgerVsSnapshot,
    StockVsSnapshot,
}

/// One key whose two representations disagree. `diff = left - right`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mismatch {
    pub kind: MismatchKind,
    pub key: StockKey,
    pub left_qty: i64,
    pub right_qty: i64,
    pub diff: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub cut: DateTime<Utc>,
    /// Keys present in the current stock view (the accuracy denominator).
    pub total_stock_keys: usize,
    /// Stock keys agreeing with the ledger.
    pub matching_stock_keys: usize,
    pub ledger_vs_stock: Vec<Mismatch>,
    pub ledger_vs_snapshot: Vec<Mismatch>,
    pub stock_vs_snapshot: Vec<Mismatch>,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.ledger_vs_stock.is_empty()
            && self.ledger_vs_snapshot.is_empty()
            && self.stock_vs_snapshot.is_empty()
    }

    pub fn mismatch_count(&self) -> usize {
        self.ledger_vs_stock.len() + self.ledger_vs_snapshot.len() + self.stock_vs_snapshot.len()
    }
}

fn diff(
    kind: MismatchKind,
    left: &BTreeMap<StockKey, i64>,
    right: &BTreeMap<StockKey, i64>,
) -> Vec<Mismatch> {
    let keys: BTreeSet<&StockKey> = left.keys().chain(right.keys()).collect();
    keys.into_iter()
        .filter_map(|key| {
            let left_qty = left.get(key).copied().unwrap_or(0);
            let right_qty = right.get(key).copied().unwrap_or(0);
            (left_qty != right_qty).then(|| Mismatch {
                kind,
                key: key.clone(),
                left_qty,
                right_qty,
                diff: left_qty - right_qty,
            })
        })
        .collect()
}

/// Compares the three representations key by key. A key missing on one side
/// counts as zero there.
pub fn reconcile(
    cut: DateTime<Utc>,
    ledger: &BTreeMap<StockKey, i64>,
    stock: &BTreeMap<StockKey, i64>,
    snapshot: &BTreeMap<StockKey, i64>,
) -> ReconciliationReport {
    let matching_stock_keys = stock
        .iter()
        .filter(|(key, qty)| ledger.get(*key).copied().unwrap_or(0) == **qty)
        .count();
    ReconciliationReport {
        cut,
        total_stock_keys: stock.len(),
        matching_stock_keys,
        ledger_vs_stock: diff(MismatchKind::LedgerVsStock, ledger, stock),
        ledger_vs_snapshot: diff(MismatchKind::LedgerVsSnapshot, ledger, snapshot),
        stock_vs_snapshot: diff(MismatchKind::StockVsSnapshot, stock, snapshot),
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealDirection {
    Increase,
    Decrease,
}

/// A correction an operator may push through the normal movement path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealSuggestion {
    pub key: StockKey,
    pub ledger_qty: i64,
    pub stock_qty: i64,
    pub adjust_delta: i64,
    pub direction: HealDirection,
}

/// Derives suggestions from ledger-vs-stock drift only.
pub fn suggest_heal(report: &ReconciliationReport) -> Vec<HealSuggestion> {
    report
        .ledger_vs_stock
        .iter()
        .map(|m| HealSuggestion {
            key: m.key.clone(),
            ledger_qty: m.left_qty,
            stock_qty: m.right_qty,
            adjust_delta: m.diff,
            direction: if m.diff > 0 {
                HealDirection::Increase
            } else {
                HealDirection::Decrease
            },
        })
        .collect()
}

/// Movement family used to group ledger diagnostics.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MovementClass {
    Inbound,
    Outbound,
    Count,
    Adjust,
    Return,
    Transfer,
}

impl MovementClass {
    pub fn of(reason: MovementReason) -> Self {
        match reason {
            MovementReason::Receipt => MovementClass::Inbound,
            MovementReason::Pick | MovementReason::Shipment => MovementClass::Outbound,
            MovementReason::Count => MovementClass::Count,
            MovementReason::Adjustment => MovementClass::Adjust,
            MovementReason::Return => MovementClass::Return,
            MovementReason::TransferIn | MovementReason::TransferOut => MovementClass::Transfer,
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaSummary {
    pub count: u64,
    pub total_delta: i64,
}

impl DeltaSummary {
    fn add(&mut self, delta: i64) {
        self.count += 1;
        self.total_delta += delta;
    }
}

/// Ledger activity in `[from, to]` grouped three ways.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerDiagnostics {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub by_movement_type: BTreeMap<MovementClass, DeltaSummary>,
    pub by_ref: BTreeMap<String, DeltaSummary>,
    pub by_trace: BTreeMap<String, DeltaSummary>,
}

/// Groups entries with `from <= occurred_at <= to`. Entries outside the
/// window are skipped, so callers may pass a superset.
pub fn summarize_ledger(
    entries: &[LedgerEntry],
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> LedgerDiagnostics {
    let mut out = LedgerDiagnostics {
        from,
        to,
        by_movement_type: BTreeMap::new(),
        by_ref: BTreeMap::new(),
        by_trace: BTreeMap::new(),
    };
    for e in entries
        .iter()
        .filter(|e| e.occurred_at >= from && e.occurred_at <= to)
    {
        out.by_movement_type
            .entry(MovementClass::of(e.reason))
            .or_default()
            .add(e.delta);
        out.by_ref.entry(e.reference.clone()).or_default().add(e.delta);
        out.by_trace
            .entry(e.trace_id.as_str().to_string())
            .or_default()
            .add(e.delta);
    }
    out
}

/// One stock effect a commit is expected to have written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitEffect {
    pub key: StockKey,
    pub ref_line: i32,
    pub delta: i64,
}

impl From<&LedgerEntry> for CommitEffect {
    fn from(entry: &LedgerEntry) -> Self {
        Self {
            key: entry.key.clone(),
            ref_line: entry.ref_line,
            delta: entry.delta,
        }
    }
}

/// Ledger total and stock quantity of one key, read together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBalance {
    pub key: StockKey,
    pub ledger_qty: i64,
    pub stock_qty: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum CommitIssue {
    MissingLedger {
        key: StockKey,
        ref_line: i32,
    },
    DeltaMismatch {
        key: StockKey,
        ref_line: i32,
        expected: i64,
        recorded: i64,
    },
    StockDrift {
        key: StockKey,
        ledger_qty: i64,
        stock_qty: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitCheck {
    pub reference: String,
    pub touched_keys: usize,
    pub issues: Vec<CommitIssue>,
}

impl CommitCheck {
    pub fn is_consistent(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Keys touched by `effects`, deduplicated and ordered.
pub fn touched_keys(effects: &[CommitEffect]) -> Vec<StockKey> {
    effects
        .iter()
        .map(|e| e.key.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Checks one commit: every effect has its ledger row with the same delta,
/// and every touched key has stock equal to its ledger total.
///
/// `recorded` are the ledger rows under `reference`; `balances` cover the
/// touched keys (a key without a balance counts as zero on both sides).
pub fn verify_commit(
    reference: &str,
    effects: &[CommitEffect],
    recorded: &[LedgerEntry],
    balances: &[KeyBalance],
) -> CommitCheck {
    let mut issues = Vec::new();
    for effect in effects {
        match recorded
            .iter()
            .find(|e| e.ref_line == effect.ref_line && e.key == effect.key)
        {
            None => issues.push(CommitIssue::MissingLedger {
                key: effect.key.clone(),
                ref_line: effect.ref_line,
            }),
            Some(entry) if entry.delta != effect.delta => issues.push(CommitIssue::DeltaMismatch {
                key: effect.key.clone(),
                ref_line: effect.ref_line,
                expected: effect.delta,
                recorded: entry.delta,
            }),
            Some(_) => {}
        }
    }

    let keys = touched_keys(effects);
    for key in &keys {
        if let Some(b) = balances.iter().find(|b| &b.key == key) {
            if b.ledger_qty != b.stock_qty {
                issues.push(CommitIssue::StockDrift {
                    key: key.clone(),
                    ledger_qty: b.ledger_qty,
                    stock_qty: b.stock_qty,
                });
            }
        }
    }

    CommitCheck {
        reference: reference.to_string(),
        touched_keys: keys.len(),
        issues,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use stockledger_core::{BatchKey, ItemId, TraceId, WarehouseId};

    fn key(item: i64) -> StockKey {
        StockKey::new(
            WarehouseId::new(1).unwrap(),
            ItemId::new(item).unwrap(),
            BatchKey::none(),
        )
    }

    fn entry(
        item: i64,
        delta: i64,
        reason: MovementReason,
        reference: &str,
        ref_line: i32,
        hour: u32,
    ) -> LedgerEntry {
        LedgerEntry {
            id: ref_line as i64,
            key: key(item),
            delta,
            reason,
            reference: reference.to_string(),
            ref_line,
            after_qty: 0,
            occurred_at: Utc.with_ymd_and_hms(2025, 1, 1, hour, 0, 0).unwrap(),
            trace_id: TraceId::new(reference),
        }
    }

    fn map(pairs: &[(i64, i64)]) -> BTreeMap<StockKey, i64> {
        pairs.iter().map(|(item, qty)| (key(*item), *qty)).collect()
    }

    #[test]
    fn identical_views_are_clean() {
        let view = map(&[(1, 10), (2, 3)]);
        let report = reconcile(Utc::now(), &view, &view, &view);
        assert!(report.is_clean());
        assert_eq!(report.matching_stock_keys, 2);
        assert!(suggest_heal(&report).is_empty());
    }

    #[test]
    fn each_pair_is_reported_independently() {
        let ledger = map(&[(1, 10), (2, 3)]);
        let stock = map(&[(1, 8), (2, 3)]);
        let snapshot = map(&[(1, 10)]);

        let report = reconcile(Utc::now(), &ledger, &stock, &snapshot);
        assert_eq!(report.ledger_vs_stock.len(), 1);
        assert_eq!(report.ledger_vs_stock[0].diff, 2);
        assert_eq!(report.ledger_vs_snapshot.len(), 1);
        assert_eq!(report.ledger_vs_snapshot[0].key, key(2));
        assert_eq!(report.stock_vs_snapshot.len(), 2);
        assert_eq!(report.mismatch_count(), 4);
        assert_eq!(report.matching_stock_keys, 1);
    }

    #[test]
    fn missing_side_counts_as_zero() {
        let ledger = map(&[(5, 4)]);
        let empty = BTreeMap::new();
        let report = reconcile(Utc::now(), &ledger, &empty, &empty);
        let m = &report.ledger_vs_stock[0];
        assert_eq!((m.left_qty, m.right_qty, m.diff), (4, 0, 4));
    }

    #[test]
    fn heal_direction_follows_sign() {
        let ledger = map(&[(1, 10), (2, 1)]);
        let stock = map(&[(1, 7), (2, 6)]);
        let report = reconcile(Utc::now(), &ledger, &stock, &ledger);

        let heal = suggest_heal(&report);
        assert_eq!(heal.len(), 2);
        assert_eq!(heal[0].adjust_delta, 3);
        assert_eq!(heal[0].direction, HealDirection::Increase);
        assert_eq!(heal[1].adjust_delta, -5);
        assert_eq!(heal[1].direction, HealDirection::Decrease);
    }

    #[test]
    fn diagnostics_group_by_family_ref_and_trace() {
        let entries = vec![
            entry(1, 10, MovementReason::Receipt, "PO-1", 1, 8),
            entry(1, -3, MovementReason::Pick, "SO-1", 1, 9),
            entry(1, -2, MovementReason::Shipment, "SO-1", 2, 9),
            entry(2, 4, MovementReason::TransferIn, "TR-1", 1, 10),
            entry(2, 1, MovementReason::Count, "CNT-1", 1, 23),
        ];
        let from = Utc.with_ymd_and_hms(2025, 1, 1, 8, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();

        let d = summarize_ledger(&entries, from, to);
        assert_eq!(
            d.by_movement_type[&MovementClass::Outbound],
            DeltaSummary { count: 2, total_delta: -5 }
        );
        assert_eq!(d.by_movement_type[&MovementClass::Inbound].total_delta, 10);
        assert_eq!(d.by_movement_type[&MovementClass::Transfer].count, 1);
        assert!(!d.by_movement_type.contains_key(&MovementClass::Count));
        assert_eq!(d.by_ref["SO-1"], DeltaSummary { count: 2, total_delta: -5 });
        assert_eq!(d.by_trace.len(), 3);
    }

    #[test]
    fn commit_check_flags_missing_rows_wrong_deltas_and_drift() {
        let recorded = vec![entry(1, -3, MovementReason::Pick, "SO-1", 1, 9)];
        let effects = vec![
            CommitEffect { key: key(1), ref_line: 1, delta: -4 },
            CommitEffect { key: key(2), ref_line: 2, delta: -1 },
        ];
        let balances = vec![
            KeyBalance { key: key(1), ledger_qty: 7, stock_qty: 7 },
            KeyBalance { key: key(2), ledger_qty: 5, stock_qty: 4 },
        ];

        let check = verify_commit("SO-1", &effects, &recorded, &balances);
        assert!(!check.is_consistent());
        assert_eq!(check.touched_keys, 2);
        assert_eq!(
            check.issues,
            vec![
                CommitIssue::DeltaMismatch { key: key(1), ref_line: 1, expected: -4, recorded: -3 },
                CommitIssue::MissingLedger { key: key(2), ref_line: 2 },
                CommitIssue::StockDrift { key: key(2), ledger_qty: 5, stock_qty: 4 },
            ]
        );
    }

    #[test]
    fn commit_check_passes_when_rows_and_balances_agree() {
        let recorded = vec![entry(1, -3, MovementReason::Pick, "SO-1", 1, 9)];
        let effects: Vec<CommitEffect> = recorded.iter().map(CommitEffect::from).collect();
        let balances = vec![KeyBalance { key: key(1), ledger_qty: 7, stock_qty: 7 }];

        let check = verify_commit("SO-1", &effects, &recorded, &balances);
        assert!(check.is_consistent());
        assert_eq!(touched_keys(&effects), vec![key(1)]);
    }
}
