//! Value object trait: equality by value, not identity.
//!
//! Value objects have **no identity**; they are defined entirely by their
//! attribute values. `BatchKey` and the stock slot key are the main examples in
//! this workspace: two keys built from the same warehouse, item and batch code
//! are the same key, regardless of where they were constructed.

/// Marker trait for value objects.
///
/// Value objects are **immutable** and **compared by value**. To "modify" one,
/// build a new one.
///
/// ```ignore
/// #[derive(Debug, Clone, PartialEq, Eq)]
/// struct BatchKey(String);
///
/// impl ValueObject for BatchKey {}
/// ```
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
