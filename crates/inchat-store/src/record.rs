//! The versioned entity wrapper.
//!
//! Every entity the store persists travels as a [`Versioned<T>`]: a stable
//! identity, an opaque version token and the payload. The version changes on
//! every successful mutation and doubles as the expected-state token handed
//! back to [`Repository::update`] and [`Repository::delete`].
//!
//! [`Repository::update`]: crate::repository::Repository::update
//! [`Repository::delete`]: crate::repository::Repository::delete

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bounds shared by every payload stored through a repository.
pub trait Payload: Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> Payload for T where T: Clone + fmt::Debug + Send + Sync + 'static {}

/// Mint a fresh version token (128 random bits).
pub(crate) fn fresh_version() -> Uuid {
    Uuid::new_v4()
}

/// An immutable snapshot of an entity at one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned<T> {
    identity: Uuid,
    version: Uuid,
    value: T,
}

impl<T> Versioned<T> {
    /// Wrap a new entity: fresh identity (UUID v7) and initial version.
    pub fn new(value: T) -> Self {
        Self {
            identity: Uuid::now_v7(),
            version: fresh_version(),
            value,
        }
    }

    /// Rebuild a record read back from a backing store.
    pub(crate) fn from_parts(identity: Uuid, version: Uuid, value: T) -> Self {
        Self {
            identity,
            version,
            value,
        }
    }

    /// The successor of this record: same identity, new version, new value.
    pub fn next_version(&self, value: T) -> Self {
        Self {
            identity: self.identity,
            version: fresh_version(),
            value,
        }
    }

    /// Stable identity of the entity.
    pub fn identity(&self) -> Uuid {
        self.identity
    }

    /// Version token of this snapshot.
    pub fn version(&self) -> Uuid {
        self.version
    }

    /// The payload.
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Consume the record, keeping only the payload.
    pub fn into_value(self) -> T {
        self.value
    }

    /// Whether `other` is the same snapshot (identity and version) as `self`.
    pub fn same_snapshot<U>(&self, other: &Versioned<U>) -> bool {
        self.identity == other.identity && self.version == other.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_records_get_distinct_identity_and_version() {
        let a = Versioned::new("a");
        let b = Versioned::new("a");
        assert_ne!(a.identity(), b.identity());
        assert_ne!(a.version(), b.version());
        assert_ne!(a.identity(), a.version());
    }

    #[test]
    fn next_version_keeps_identity() {
        let first = Versioned::new(1_u32);
        let second = first.next_version(2);

        assert_eq!(second.identity(), first.identity());
        assert_ne!(second.version(), first.version());
        assert_eq!(*second.value(), 2);
        assert_eq!(*first.value(), 1);
        assert!(!first.same_snapshot(&second));
        assert!(first.same_snapshot(&first.clone()));
    }

    #[test]
    fn serializes_all_three_parts() {
        let record = Versioned::new("hello".to_string());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["identity"], record.identity().to_string());
        assert_eq!(json["version"], record.version().to_string());
        assert_eq!(json["value"], "hello");
    }
}
