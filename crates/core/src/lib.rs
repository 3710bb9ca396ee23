//! `stockledger-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod batch_key;
pub mod entity;
pub mod error;
pub mod id;
pub mod value_object;

pub use batch_key::{BatchKey, NULL_BATCH_KEY};
pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{ItemId, ReservationId, TraceId, WarehouseId};
pub use value_object::ValueObject;
