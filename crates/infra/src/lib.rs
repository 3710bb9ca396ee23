//! Infrastructure layer: stores, engine facade, background runners, config.

pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod runners;
pub mod store;
pub mod sweeper;


pub use audit::{AuditEnvelope, AuditSink, BusAudit, NoAudit};
pub use config::{ConfigError, EngineConfig};
pub use engine::{EngineSettings, InventoryEngine, SnapshotCut};
pub use error::{StoreError, StoreResult};
pub use metrics::AllocationMetrics;
pub use store::{
    AllocationRequest, AllocationResult, CreatedReservation, InMemoryReservationStore,
    InMemoryStockStore, LedgerStats, PostgresReservationStore, PostgresStockStore,
    ReservationStore, StockStore,
};
pub use sweeper::{SweepFailure, SweepReport};
