//! Batch-code key normalisation.
//!
//! A movement may carry no batch code at all (non-batch-managed items). Ledger,
//! stock and snapshot rows are grouped and joined on a *key* rather than the
//! nullable code, so "no batch" must be a stable, comparable value. The reserved
//! key [`NULL_BATCH_KEY`] plays that role in memory and in the database
//! (`batch_code_key` generated columns).

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::value_object::ValueObject;

/// Reserved key standing for "no batch". Never a valid user batch code.
pub const NULL_BATCH_KEY: &str = "__NULL_BATCH__";

/// Normalised batch code.
///
/// `BatchKey::none()` and `BatchKey::from_code(None | Some("  "))` are the same
/// key. Ordering follows the key string so grouping is deterministic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchKey(String);

impl ValueObject for BatchKey {}

impl BatchKey {
    /// The "no batch" key.
    pub fn none() -> Self {
        Self(NULL_BATCH_KEY.to_string())
    }

    /// Build a key from an optional user batch code.
    ///
    /// Blank codes normalise to "no batch". A code equal to the sentinel is
    /// rejected so that a real batch can never alias the empty slot.
    pub fn from_code(code: Option<&str>) -> Result<Self, DomainError> {
        match code.map(str::trim) {
            None | Some("") => Ok(Self::none()),
            Some(NULL_BATCH_KEY) => Err(DomainError::batch_resolution(format!(
                "batch code '{NULL_BATCH_KEY}' is reserved"
            ))),
            Some(c) => Ok(Self(c.to_string())),
        }
    }

    /// Rebuild a key from its stored representation (`batch_code_key` column).
    pub fn from_key(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn is_none(&self) -> bool {
        self.0 == NULL_BATCH_KEY
    }

    /// The stored key, sentinel included.
    pub fn as_key(&self) -> &str {
        &self.0
    }

    /// The user-facing batch code (`None` for the sentinel).
    pub fn code(&self) -> Option<&str> {
        if self.is_none() { None } else { Some(&self.0) }
    }
}

impl core::fmt::Display for BatchKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn blank_and_missing_codes_share_the_sentinel() {
        assert_eq!(BatchKey::from_code(None).unwrap(), BatchKey::none());
        assert_eq!(BatchKey::from_code(Some("   ")).unwrap(), BatchKey::none());
        assert_eq!(BatchKey::none().as_key(), NULL_BATCH_KEY);
        assert_eq!(BatchKey::none().code(), None);
    }

    #[test]
    fn sentinel_cannot_be_used_as_a_code() {
        let err = BatchKey::from_code(Some(NULL_BATCH_KEY)).unwrap_err();
        assert!(matches!(err, DomainError::BatchResolution(_)));
    }

    #[test]
    fn codes_are_trimmed() {
        let key = BatchKey::from_code(Some(" B-01 ")).unwrap();
        assert_eq!(key.code(), Some("B-01"));
    }

    proptest! {
        #[test]
        fn stored_key_round_trips(code in "[A-Za-z0-9-]{1,16}") {
            let key = BatchKey::from_code(Some(&code)).unwrap();
            prop_assert_eq!(BatchKey::from_key(key.as_key()), key);
        }
    }
}
