use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use stockledger_core::TraceId;

use crate::event::Event;

/// Envelope for an audit event, carrying stream metadata.
///
/// - `stream` names the fact family (`stock_ledger`, `reservations`).
/// - `stream_key` identifies the row the event is about (slot key or
///   reservation id) so consumers can partition.
/// - `trace_id` correlates the event with the calling workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    stream: String,
    stream_key: String,
    event_type: String,
    event_version: u32,
    occurred_at: DateTime<Utc>,
    trace_id: Option<TraceId>,
    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn event_version(&self) -> u32 {
        self.event_version
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn trace_id(&self) -> Option<&TraceId> {
        self.trace_id.as_ref()
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}

impl EventEnvelope<JsonValue> {
    /// Wrap a typed event, serialising its payload to JSON.
    pub fn from_typed<E>(
        stream: impl Into<String>,
        stream_key: impl Into<String>,
        trace_id: Option<TraceId>,
        event: &E,
    ) -> Result<Self, serde_json::Error>
    where
        E: Event + Serialize,
    {
        Ok(Self {
            event_id: Uuid::now_v7(),
            stream: stream.into(),
            stream_key: stream_key.into(),
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            occurred_at: event.occurred_at(),
            trace_id,
            payload: serde_json::to_value(event)?,
        })
    }
}
