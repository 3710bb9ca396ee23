//! Ledger movements and the stock slots they materialise.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{
    BatchKey, DomainError, DomainResult, ItemId, TraceId, ValueObject, WarehouseId,
};

/// Why a quantity moved.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MovementReason {
    Receipt,
    Pick,
    Shipment,
    Count,
    Adjustment,
    Return,
    TransferIn,
    TransferOut,
}

/// Sign a reason's delta is expected to carry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MovementDirection {
    Inbound,
    Outbound,
    Either,
}

impl MovementReason {
    pub const ALL: [MovementReason; 8] = [
        MovementReason::Receipt,
        MovementReason::Pick,
        MovementReason::Shipment,
        MovementReason::Count,
        MovementReason::Adjustment,
        MovementReason::Return,
        MovementReason::TransferIn,
        MovementReason::TransferOut,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MovementReason::Receipt => "RECEIPT",
            MovementReason::Pick => "PICK",
            MovementReason::Shipment => "SHIPMENT",
            MovementReason::Count => "COUNT",
            MovementReason::Adjustment => "ADJUSTMENT",
            MovementReason::Return => "RETURN",
            MovementReason::TransferIn => "TRANSFER_IN",
            MovementReason::TransferOut => "TRANSFER_OUT",
        }
    }

    pub fn direction(&self) -> MovementDirection {
        match self {
            MovementReason::Receipt | MovementReason::Return | MovementReason::TransferIn => {
                MovementDirection::Inbound
            }
            MovementReason::Pick | MovementReason::Shipment | MovementReason::TransferOut => {
                MovementDirection::Outbound
            }
            MovementReason::Count | MovementReason::Adjustment => MovementDirection::Either,
        }
    }
}

impl core::fmt::Display for MovementReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for MovementReason {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        MovementReason::ALL
            .into_iter()
            .find(|r| r.as_str() == wanted)
            .ok_or_else(|| DomainError::validation(format!("unknown movement reason '{s}'")))
    }
}

/// Identity of a stock slot: (warehouse, item, batch key).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StockKey {
    pub warehouse_id: WarehouseId,
    pub item_id: ItemId,
    pub batch: BatchKey,
}

impl ValueObject for StockKey {}

impl StockKey {
    pub fn new(warehouse_id: WarehouseId, item_id: ItemId, batch: BatchKey) -> Self {
        Self {
            warehouse_id,
            item_id,
            batch,
        }
    }
}

impl core::fmt::Display for StockKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "wh:{}/item:{}/batch:{}", self.warehouse_id, self.item_id, self.batch)
    }
}

/// Current quantity of one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockSlot {
    pub key: StockKey,
    pub qty: i64,
}

/// `(ref, ref_line)`: re-submitting the same logical event must not double-apply.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub reference: String,
    pub ref_line: i32,
}

/// A requested movement (input of `Apply`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Movement {
    pub key: StockKey,
    pub delta: i64,
    pub reason: MovementReason,
    pub reference: String,
    pub ref_line: i32,
    pub occurred_at: DateTime<Utc>,
    pub trace_id: Option<TraceId>,
    pub production_date: Option<NaiveDate>,
    pub expiry_date: Option<NaiveDate>,
    /// Administrative corrections may drive a slot below zero.
    pub allow_negative: bool,
}

impl Movement {
    pub fn new(
        key: StockKey,
        delta: i64,
        reason: MovementReason,
        reference: impl Into<String>,
        ref_line: i32,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            delta,
            reason,
            reference: reference.into(),
            ref_line,
            occurred_at,
            trace_id: None,
            production_date: None,
            expiry_date: None,
            allow_negative: false,
        }
    }

    pub fn with_trace(mut self, trace_id: TraceId) -> Self {
        self.trace_id = Some(trace_id);
        self
    }

    pub fn with_dates(
        mut self,
        production_date: Option<NaiveDate>,
        expiry_date: Option<NaiveDate>,
    ) -> Self {
        self.production_date = production_date;
        self.expiry_date = expiry_date;
        self
    }

    pub fn allowing_negative(mut self) -> Self {
        self.allow_negative = true;
        self
    }

    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey {
            reference: self.reference.clone(),
            ref_line: self.ref_line,
        }
    }

    /// Trace id written to the ledger: the caller's, or the reference itself.
    pub fn effective_trace_id(&self) -> TraceId {
        self.trace_id
            .clone()
            .unwrap_or_else(|| TraceId::new(self.reference.clone()))
    }

    /// Structural checks that do not need the current stock.
    pub fn validate(&self) -> DomainResult<()> {
        if self.reference.trim().is_empty() {
            return Err(DomainError::validation("ref cannot be empty"));
        }
        if self.ref_line < 1 {
            return Err(DomainError::validation(format!(
                "ref_line must be >= 1, got {}",
                self.ref_line
            )));
        }
        match (self.reason.direction(), self.delta.signum()) {
            (MovementDirection::Inbound, -1) => Err(DomainError::validation(format!(
                "{} movements must not decrease stock",
                self.reason
            ))),
            (MovementDirection::Outbound, 1) => Err(DomainError::validation(format!(
                "{} movements must not increase stock",
                self.reason
            ))),
            _ => Ok(()),
        }
    }
}

/// An immutable ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Store-assigned, monotonically increasing.
    pub id: i64,
    pub key: StockKey,
    pub delta: i64,
    pub reason: MovementReason,
    pub reference: String,
    pub ref_line: i32,
    /// Slot quantity right after this entry was applied.
    pub after_qty: i64,
    pub occurred_at: DateTime<Utc>,
    pub trace_id: TraceId,
}

impl LedgerEntry {
    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey {
            reference: self.reference.clone(),
            ref_line: self.ref_line,
        }
    }

    pub fn is_outbound(&self) -> bool {
        self.delta < 0
    }
}

/// Result of `Apply`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyOutcome {
    pub key: StockKey,
    pub before: i64,
    pub delta: i64,
    pub after: i64,
    /// `false` for idempotent replays and zero deltas.
    pub applied: bool,
    pub ledger_id: Option<i64>,
}

impl ApplyOutcome {
    pub fn applied(entry: &LedgerEntry) -> Self {
        Self {
            key: entry.key.clone(),
            before: entry.after_qty - entry.delta,
            delta: entry.delta,
            after: entry.after_qty,
            applied: true,
            ledger_id: Some(entry.id),
        }
    }

    /// The prior result of an already-applied `(ref, ref_line)`.
    pub fn replayed(entry: &LedgerEntry) -> Self {
        Self {
            applied: false,
            ..Self::applied(entry)
        }
    }

    pub fn unchanged(key: StockKey, qty: i64) -> Self {
        Self {
            key,
            before: qty,
            delta: 0,
            after: qty,
            applied: false,
            ledger_id: None,
        }
    }
}

/// New slot quantity after applying `movement` on top of `before`.
pub fn apply_delta(before: i64, movement: &Movement) -> DomainResult<i64> {
    let after = before
        .checked_add(movement.delta)
        .ok_or_else(|| DomainError::validation("quantity overflow"))?;
    if after < 0 && !movement.allow_negative {
        return Err(DomainError::insufficient_stock(
            movement.delta.saturating_neg(),
            before,
        ));
    }
    Ok(after)
}
