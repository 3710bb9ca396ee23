//! Best-effort audit publishing.
//!
//! Audit events are emitted after the state change they describe has
//! committed. A failed publish is logged and dropped; it never reaches the
//! caller of the primary operation.

use serde_json::Value as JsonValue;
use tracing::warn;

use stockledger_core::TraceId;
use stockledger_events::{EventBus, EventEnvelope};
use stockledger_inventory::InventoryEvent;

pub type AuditEnvelope = EventEnvelope<JsonValue>;

pub trait AuditSink: Send + Sync {
    fn publish(&self, event: &InventoryEvent, trace_id: Option<&TraceId>);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAudit;

impl AuditSink for NoAudit {
    fn publish(&self, _event: &InventoryEvent, _trace_id: Option<&TraceId>) {}
}

/// Wraps events in an [`EventEnvelope`] and hands them to an [`EventBus`].
#[derive(Debug, Clone)]
pub struct BusAudit<B> {
    bus: B,
}

impl<B> BusAudit<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }
}

impl<B> AuditSink for BusAudit<B>
where
    B: EventBus<AuditEnvelope>,
{
    fn publish(&self, event: &InventoryEvent, trace_id: Option<&TraceId>) {
        let envelope = match EventEnvelope::from_typed(
            event.stream(),
            event.stream_key(),
            trace_id.cloned(),
            event,
        ) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(stream = event.stream(), error = %e, "failed to encode audit event");
                return;
            }
        };

        if let Err(e) = self.bus.publish(envelope) {
            warn!(
                stream = event.stream(),
                stream_key = %event.stream_key(),
                error = ?e,
                "failed to publish audit event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use stockledger_core::ReservationId;
    use stockledger_events::{InMemoryEventBus, Subscription};

    struct ClosedBus;

    impl EventBus<AuditEnvelope> for ClosedBus {
        type Error = &'static str;

        fn publish(&self, _message: AuditEnvelope) -> Result<(), Self::Error> {
            Err("closed")
        }

        fn subscribe(&self) -> Subscription<AuditEnvelope> {
            let (_tx, rx) = std::sync::mpsc::channel();
            Subscription::new(rx)
        }
    }

    fn expired() -> InventoryEvent {
        InventoryEvent::ReservationExpired {
            reservation_id: ReservationId::new(),
            reference: "SO-1".into(),
            occurred_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn envelopes_carry_stream_and_trace() {
        let audit = BusAudit::new(InMemoryEventBus::<AuditEnvelope>::new());
        let sub = audit.bus().subscribe();
        let event = expired();

        audit.publish(&event, Some(&TraceId::new("trace-1")));

        let got = sub.drain();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].stream(), "reservations");
        assert_eq!(got[0].stream_key(), event.stream_key());
        assert_eq!(got[0].event_type(), "inventory.reservation.expired");
        assert_eq!(got[0].trace_id().map(TraceId::as_str), Some("trace-1"));
    }

    #[test]
    fn late_consumers_read_the_retained_audit_tail() {
        let audit = BusAudit::new(InMemoryEventBus::<AuditEnvelope>::with_retention(4));
        audit.publish(&expired(), Some(&TraceId::new("trace-1")));
        audit.publish(&expired(), Some(&TraceId::new("trace-2")));

        let tail = audit.bus().subscribe_with_backlog();
        let traces: Vec<String> = tail
            .drain()
            .iter()
            .filter_map(|e| e.trace_id().map(|t| t.as_str().to_string()))
            .collect();
        assert_eq!(traces, vec!["trace-1", "trace-2"]);
        assert_eq!(audit.bus().published(), 2);
    }

    #[test]
    fn publish_failures_are_swallowed() {
        BusAudit::new(ClosedBus).publish(&expired(), None);
    }
}
