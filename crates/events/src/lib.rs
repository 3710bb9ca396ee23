//! Audit events: event trait, envelope and the publish/subscribe bus.
//!
//! The stock ledger is the source of truth; events published here are a
//! best-effort audit stream for downstream consumers.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
