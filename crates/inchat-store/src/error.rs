//! Error types for the inchat-store crate.
//!
//! Two layers:
//!
//! * [`StoreError`]: faults raised by the backing store itself (SQLite,
//!   configuration, corrupt rows). Returned via [`StoreResult`].
//! * [`RepoError`]: the concurrency taxonomy every [`Repository`] speaks:
//!   missing entities, stale writes, expired waits. Backing-store faults are
//!   carried unchanged in [`RepoError::Store`].
//!
//! [`Repository`]: crate::repository::Repository

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::record::Versioned;

/// Alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Alias for repository results: `R` is the success value, `T` the payload
/// type carried by a conflict.
pub type RepoResult<R, T> = Result<R, RepoError<T>>;

/// Errors raised by the backing store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A schema migration failed.
    #[error("migration v{version} failed: {message}")]
    Migration { version: u32, message: String },

    /// An invalid argument was provided to a store operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A stored row could not be mapped back into its entity.
    #[error("corrupt {entity} row: {reason}")]
    Corrupt {
        entity: &'static str,
        reason: String,
    },

    /// A blocking task was cancelled or panicked.
    #[error("background task failed: {0}")]
    TaskJoin(String),

    /// Configuration could not be read or parsed.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}

/// Errors returned by repository operations on payloads of type `T`.
#[derive(Debug, Error)]
pub enum RepoError<T: fmt::Debug> {
    /// The identity was never saved or has been deleted. Terminal for that
    /// identity.
    #[error("{entity} {id} no longer exists")]
    NotFound { entity: &'static str, id: Uuid },

    /// The expected version is stale. Carries the record that is stored now
    /// so the caller can recompute and resubmit.
    #[error("stale write on {}: stored version is {}", .0.identity(), .0.version())]
    Conflict(Box<Versioned<T>>),

    /// A wait for a new version passed its deadline.
    #[error("no new version of {id} within {waited:?}")]
    Timeout { id: Uuid, waited: Duration },

    /// The retry helper kept losing the race.
    #[error("gave up on {} after {attempts} conflicting attempts", current.identity())]
    RetriesExhausted {
        attempts: u32,
        current: Box<Versioned<T>>,
    },

    /// The backing store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl<T: fmt::Debug> RepoError<T> {
    /// Whether this error signals that the entity no longer exists.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// The current record carried by a conflict, if this is one.
    pub fn conflict(&self) -> Option<&Versioned<T>> {
        match self {
            Self::Conflict(current) => Some(current.as_ref()),
            _ => None,
        }
    }
}
