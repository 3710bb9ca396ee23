//! Audit events emitted after inventory state changes commit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::ReservationId;
use stockledger_events::Event;

use crate::movement::{LedgerEntry, MovementReason, StockKey};
use crate::reservation::{Reservation, ReservationStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InventoryEvent {
    MovementApplied {
        ledger_id: i64,
        key: StockKey,
        delta: i64,
        after_qty: i64,
        reason: MovementReason,
        reference: String,
        ref_line: i32,
        occurred_at: DateTime<Utc>,
    },
    ReservationCreated {
        reservation_id: ReservationId,
        reference: String,
        expire_at: DateTime<Utc>,
        occurred_at: DateTime<Utc>,
    },
    ReservationConsumed {
        reservation_id: ReservationId,
        reference: String,
        occurred_at: DateTime<Utc>,
    },
    ReservationCancelled {
        reservation_id: ReservationId,
        reference: String,
        occurred_at: DateTime<Utc>,
    },
    ReservationExpired {
        reservation_id: ReservationId,
        reference: String,
        occurred_at: DateTime<Utc>,
    },
}

impl InventoryEvent {
    pub fn movement_applied(entry: &LedgerEntry) -> Self {
        InventoryEvent::MovementApplied {
            ledger_id: entry.id,
            key: entry.key.clone(),
            delta: entry.delta,
            after_qty: entry.after_qty,
            reason: entry.reason,
            reference: entry.reference.clone(),
            ref_line: entry.ref_line,
            occurred_at: entry.occurred_at,
        }
    }

    pub fn reservation_created(reservation: &Reservation) -> Self {
        InventoryEvent::ReservationCreated {
            reservation_id: reservation.id,
            reference: reservation.key.reference.clone(),
            expire_at: reservation.expire_at,
            occurred_at: reservation.updated_at,
        }
    }

    /// Event for a reservation that just reached a terminal status.
    pub fn reservation_closed(reservation: &Reservation) -> Option<Self> {
        let reservation_id = reservation.id;
        let reference = reservation.key.reference.clone();
        let occurred_at = reservation.updated_at;
        match reservation.status {
            ReservationStatus::Open => None,
            ReservationStatus::Consumed => Some(InventoryEvent::ReservationConsumed {
                reservation_id,
                reference,
                occurred_at,
            }),
            ReservationStatus::Cancelled => Some(InventoryEvent::ReservationCancelled {
                reservation_id,
                reference,
                occurred_at,
            }),
            ReservationStatus::Expired => Some(InventoryEvent::ReservationExpired {
                reservation_id,
                reference,
                occurred_at,
            }),
        }
    }

    /// Fact family used as the envelope stream.
    pub fn stream(&self) -> &'static str {
        match self {
            InventoryEvent::MovementApplied { .. } => "stock_ledger",
            _ => "reservations",
        }
    }

    pub fn stream_key(&self) -> String {
        match self {
            InventoryEvent::MovementApplied { key, .. } => key.to_string(),
            InventoryEvent::ReservationCreated { reservation_id, .. }
            | InventoryEvent::ReservationConsumed { reservation_id, .. }
            | InventoryEvent::ReservationCancelled { reservation_id, .. }
            | InventoryEvent::ReservationExpired { reservation_id, .. } => {
                reservation_id.to_string()
            }
        }
    }
}

impl Event for InventoryEvent {
    fn event_type(&self) -> &'static str {
        match self {
            InventoryEvent::MovementApplied { .. } => "inventory.movement.applied",
            InventoryEvent::ReservationCreated { .. } => "inventory.reservation.created",
            InventoryEvent::ReservationConsumed { .. } => "inventory.reservation.consumed",
            InventoryEvent::ReservationCancelled { .. } => "inventory.reservation.cancelled",
            InventoryEvent::ReservationExpired { .. } => "inventory.reservation.expired",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            InventoryEvent::MovementApplied { occurred_at, .. }
            | InventoryEvent::ReservationCreated { occurred_at, .. }
            | InventoryEvent::ReservationConsumed { occurred_at, .. }
            | InventoryEvent::ReservationCancelled { occurred_at, .. }
            | InventoryEvent::ReservationExpired { occurred_at, .. } => *occurred_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockledger_core::{BatchKey, ItemId, TraceId, WarehouseId};
    use stockledger_events::EventEnvelope;

    #[test]
    fn movement_event_wraps_into_envelope() {
        let entry = LedgerEntry {
            id: 5,
            key: StockKey::new(
                WarehouseId::new(1).unwrap(),
                ItemId::new(2).unwrap(),
                BatchKey::none(),
            ),
            delta: 4,
            reason: MovementReason::Receipt,
            reference: "PO-7".into(),
            ref_line: 1,
            after_qty: 4,
            occurred_at: Utc::now(),
            trace_id: TraceId::new("PO-7"),
        };
        let event = InventoryEvent::movement_applied(&entry);
        let envelope = EventEnvelope::from_typed(
            event.stream(),
            event.stream_key(),
            Some(entry.trace_id.clone()),
            &event,
        )
        .unwrap();

        assert_eq!(envelope.event_type(), "inventory.movement.applied");
        assert_eq!(envelope.stream(), "stock_ledger");
        assert_eq!(envelope.stream_key(), "wh:1/item:2/batch:__NULL_BATCH__");
        assert_eq!(envelope.payload()["type"], "movement_applied");
        assert_eq!(envelope.payload()["delta"], 4);
    }
}
