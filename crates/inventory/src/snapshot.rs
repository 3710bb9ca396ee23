//! Point-in-time aggregation of the ledger.
//!
//! Snapshots are never patched incrementally: a rebuild recomputes every row
//! for its date from the ledger and replaces what was there.

use std::collections::BTreeMap;

use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::movement::{LedgerEntry, StockKey};

/// Which ledger entries a cut includes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerCut {
    /// `occurred_at <= at` (diagnostic cuts, reconciliation).
    AtOrBefore(DateTime<Utc>),
    /// `occurred_at < at` (snapshot day boundaries).
    Before(DateTime<Utc>),
}

impl LedgerCut {
    pub fn for_snapshot_date(date: NaiveDate) -> Self {
        LedgerCut::Before(snapshot_cutoff(date))
    }

    pub fn includes(&self, occurred_at: DateTime<Utc>) -> bool {
        match self {
            LedgerCut::AtOrBefore(at) => occurred_at <= *at,
            LedgerCut::Before(at) => occurred_at < *at,
        }
    }

    pub fn instant(&self) -> DateTime<Utc> {
        match self {
            LedgerCut::AtOrBefore(at) | LedgerCut::Before(at) => *at,
        }
    }
}

/// Exclusive upper bound for a snapshot date: midnight UTC of the next day.
pub fn snapshot_cutoff(date: NaiveDate) -> DateTime<Utc> {
    let next = date.checked_add_days(Days::new(1)).unwrap_or(NaiveDate::MAX);
    next.and_time(NaiveTime::MIN).and_utc()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub snapshot_date: NaiveDate,
    pub key: StockKey,
    pub qty_on_hand: i64,
    pub qty_available: i64,
    pub qty_allocated: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    /// Set for persisted rebuilds, absent for ephemeral cuts.
    pub snapshot_date: Option<NaiveDate>,
    pub slot_count: usize,
    pub total_qty: i64,
}

impl SnapshotSummary {
    pub fn of_cut(totals: &BTreeMap<StockKey, i64>) -> Self {
        Self {
            snapshot_date: None,
            slot_count: totals.len(),
            total_qty: totals.values().sum(),
        }
    }

    pub fn of_rows(snapshot_date: NaiveDate, rows: &[SnapshotRow]) -> Self {
        Self {
            snapshot_date: Some(snapshot_date),
            slot_count: rows.len(),
            total_qty: rows.iter().map(|r| r.qty_on_hand).sum(),
        }
    }
}

/// Σdelta per key over the entries inside `cut`; zero sums are dropped.
pub fn aggregate_ledger<'a, I>(entries: I, cut: LedgerCut) -> BTreeMap<StockKey, i64>
where
    I: IntoIterator<Item = &'a LedgerEntry>,
{
    let mut totals: BTreeMap<StockKey, i64> = BTreeMap::new();
    for entry in entries {
        if cut.includes(entry.occurred_at) {
            *totals.entry(entry.key.clone()).or_insert(0) += entry.delta;
        }
    }
    totals.retain(|_, qty| *qty != 0);
    totals
}

/// Rows a rebuild of `date` must contain, ordered by key.
pub fn snapshot_rows<'a, I>(date: NaiveDate, entries: I) -> Vec<SnapshotRow>
where
    I: IntoIterator<Item = &'a LedgerEntry>,
{
    aggregate_ledger(entries, LedgerCut::for_snapshot_date(date))
        .into_iter()
        .map(|(key, qty)| SnapshotRow {
            snapshot_date: date,
            key,
            qty_on_hand: qty,
            qty_available: qty,
            qty_allocated: 0,
        })
        .collect()
}
