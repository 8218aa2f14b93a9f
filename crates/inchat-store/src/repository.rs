//! The repository contract and the optimistic retry helpers.
//!
//! A [`Repository<T>`] stores payloads of type `T` as [`Versioned<T>`]
//! records. Writes take the caller's last-seen record as the expected state;
//! if someone else committed in the meantime the write is refused with
//! [`RepoError::Conflict`] carrying the record that won, and nothing changes.
//!
//! Retrying is never automatic. Callers that want it go through
//! [`update_with`], handing over a pure `old value -> new value` function that
//! is re-applied to fresh state after every conflict.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::error::{RepoError, RepoResult};
use crate::record::{Payload, Versioned};
use crate::waiter::VersionWaiter;

/// Default number of submissions made by [`update_with`] and
/// [`delete_latest`].
pub const DEFAULT_UPDATE_ATTEMPTS: u32 = 5;

/// Versioned storage for one entity kind with optimistic concurrency.
#[async_trait]
pub trait Repository<T: Payload>: Send + Sync {
    /// Registry of callers parked on identities of this repository.
    fn waiter(&self) -> &VersionWaiter<T>;

    /// Persist a new entity under a fresh identity and initial version.
    async fn save(&self, value: T) -> RepoResult<Versioned<T>, T>;

    /// Latest committed record for `identity`.
    async fn get(&self, identity: Uuid) -> RepoResult<Versioned<T>, T>;

    /// Replace the payload if `expected` is still the stored version.
    ///
    /// Fails with [`RepoError::Conflict`] (no change applied) if another
    /// write got there first, [`RepoError::NotFound`] if the entity is gone.
    /// Waiters on the identity are woken with the new record.
    async fn update(&self, expected: &Versioned<T>, value: T) -> RepoResult<Versioned<T>, T>;

    /// Remove the entity if `expected` is still the stored version.
    ///
    /// Same gate as [`update`](Repository::update). Waiters on the identity
    /// are released with [`RepoError::NotFound`].
    async fn delete(&self, expected: &Versioned<T>) -> RepoResult<(), T>;

    /// Mint a new version for the current payload and wake waiters.
    ///
    /// Used when something the entity depends on changed while the entity's
    /// own row did not.
    async fn touch(&self, identity: Uuid) -> RepoResult<Versioned<T>, T>;

    /// Block until `identity` has a version other than `known`.
    ///
    /// Returns immediately if the stored version already differs. Otherwise
    /// parks until an update is published, the entity is deleted
    /// ([`RepoError::NotFound`]) or `timeout` elapses ([`RepoError::Timeout`]).
    async fn wait_for_next_version(
        &self,
        identity: Uuid,
        known: Uuid,
        timeout: Duration,
    ) -> RepoResult<Versioned<T>, T> {
        // Register before reading so a commit landing in between still wakes us.
        let subscription = self.waiter().subscribe(identity);
        let current = self.get(identity).await?;
        if current.version() != known {
            return Ok(current);
        }
        subscription.next_after(known, timeout).await
    }
}

/// Apply `mutate` to `record`'s payload and submit, retrying on conflict.
///
/// After each [`RepoError::Conflict`] the carried record becomes the new base
/// and `mutate` is applied again. Gives up with
/// [`RepoError::RetriesExhausted`] after `attempts` conflicting submissions
/// (at least one submission is always made). Any other error is returned as
/// is.
pub async fn update_with<T, R, F>(
    repo: &R,
    record: Versioned<T>,
    attempts: u32,
    mutate: F,
) -> RepoResult<Versioned<T>, T>
where
    T: Payload,
    R: Repository<T> + ?Sized,
    F: Fn(&T) -> T + Send + Sync,
{
    let attempts = attempts.max(1);
    let mut current = record;
    for attempt in 1..=attempts {
        let next = mutate(current.value());
        match repo.update(&current, next).await {
            Ok(updated) => return Ok(updated),
            Err(RepoError::Conflict(fresh)) => {
                debug!(identity = %current.identity(), attempt, "update conflicted, retrying on fresh state");
                current = *fresh;
            }
            Err(err) => return Err(err),
        }
    }
    Err(RepoError::RetriesExhausted {
        attempts,
        current: Box::new(current),
    })
}

/// Delete the entity behind `record`, re-targeting the latest version on
/// conflict. Same retry bound as [`update_with`].
pub async fn delete_latest<T, R>(repo: &R, record: Versioned<T>, attempts: u32) -> RepoResult<(), T>
where
    T: Payload,
    R: Repository<T> + ?Sized,
{
    let attempts = attempts.max(1);
    let mut current = record;
    for attempt in 1..=attempts {
        match repo.delete(&current).await {
            Ok(()) => return Ok(()),
            Err(RepoError::Conflict(fresh)) => {
                debug!(identity = %current.identity(), attempt, "delete conflicted, retrying on fresh state");
                current = *fresh;
            }
            Err(err) => return Err(err),
        }
    }
    Err(RepoError::RetriesExhausted {
        attempts,
        current: Box::new(current),
    })
}
