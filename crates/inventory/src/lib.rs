//! Inventory consistency and allocation rules.
//!
//! This crate contains the business rules of the stock ledger implemented as
//! deterministic domain logic (no IO, no storage, no clocks). The infra crate
//! loads rows, calls into these functions, and persists the results.

pub mod batch;
pub mod events;
pub mod fefo;
pub mod insights;
pub mod movement;
pub mod reconcile;
pub mod reservation;
pub mod snapshot;

pub use batch::{Batch, BatchAgeing, RiskLevel, detect_ageing, resolve_inbound_dates};
pub use events::InventoryEvent;
pub use fefo::{
    AllocationLeg, AllocationPlan, FefoCandidate, FefoOutcome, FefoStats, PlanOptions, plan,
};
pub use insights::{InsightInputs, InventoryInsights};
pub use movement::{
    ApplyOutcome, IdempotencyKey, LedgerEntry, Movement, MovementDirection, MovementReason,
    StockKey, StockSlot, apply_delta,
};
pub use reconcile::{
    CommitCheck, CommitEffect, CommitIssue, DeltaSummary, HealDirection, HealSuggestion,
    KeyBalance, LedgerDiagnostics, Mismatch, MismatchKind, MovementClass, ReconciliationReport,
    reconcile, suggest_heal, summarize_ledger, touched_keys, verify_commit,
};
pub use reservation::{
    ConsumeOutcome, NewReservation, NewReservationLine, ReleaseOutcome, Reservation,
    ReservationKey, ReservationLine, ReservationStatus,
};
pub use snapshot::{
    LedgerCut, SnapshotRow, SnapshotSummary, aggregate_ledger, snapshot_cutoff, snapshot_rows,
};
