//! In-process [`Repository`] backed by a [`DashMap`].
//!
//! Nothing survives a restart. Useful for tests and for entity kinds that
//! only need to live as long as the process. The map's entry guard is the
//! per-identity critical section: compare, write and publish all happen
//! under one shard lock, so waiters hear about changes in commit order.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{RepoError, RepoResult};
use crate::record::{Payload, Versioned, fresh_version};
use crate::repository::Repository;
use crate::waiter::{Change, VersionWaiter};

/// Volatile repository for payloads of type `T`.
pub struct MemoryRepository<T> {
    entity: &'static str,
    records: DashMap<Uuid, Versioned<T>>,
    waiter: VersionWaiter<T>,
}

enum Gate<T, R> {
    Applied(R),
    Missing,
    Stale(Versioned<T>),
}

impl<T: Payload> MemoryRepository<T> {
    /// Create an empty repository. `entity` names the kind in errors and logs.
    pub fn new(entity: &'static str) -> Self {
        Self {
            entity,
            records: DashMap::new(),
            waiter: VersionWaiter::new(entity),
        }
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn not_found(&self, id: Uuid) -> RepoError<T> {
        RepoError::NotFound {
            entity: self.entity,
            id,
        }
    }
}

#[async_trait]
impl<T: Payload> Repository<T> for MemoryRepository<T> {
    fn waiter(&self) -> &VersionWaiter<T> {
        &self.waiter
    }

    #[instrument(skip_all, fields(entity = self.entity))]
    async fn save(&self, value: T) -> RepoResult<Versioned<T>, T> {
        let record = Versioned::new(value);
        self.records.insert(record.identity(), record.clone());
        debug!(identity = %record.identity(), "saved");
        Ok(record)
    }

    async fn get(&self, identity: Uuid) -> RepoResult<Versioned<T>, T> {
        self.records
            .get(&identity)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| self.not_found(identity))
    }

    #[instrument(skip_all, fields(entity = self.entity, identity = %expected.identity()))]
    async fn update(&self, expected: &Versioned<T>, value: T) -> RepoResult<Versioned<T>, T> {
        let identity = expected.identity();
        let gate = match self.records.entry(identity) {
            Entry::Vacant(_) => Gate::Missing,
            Entry::Occupied(mut slot) => {
                if slot.get().version() != expected.version() {
                    Gate::Stale(slot.get().clone())
                } else {
                    let next = slot.get().next_version(value);
                    slot.insert(next.clone());
                    self.waiter.publish(identity, Change::Updated(next.clone()));
                    Gate::Applied(next)
                }
            }
        };

        match gate {
            Gate::Applied(next) => {
                debug!(version = %next.version(), "updated");
                Ok(next)
            }
            Gate::Missing => Err(self.not_found(identity)),
            Gate::Stale(current) => Err(RepoError::Conflict(Box::new(current))),
        }
    }

    #[instrument(skip_all, fields(entity = self.entity, identity = %expected.identity()))]
    async fn delete(&self, expected: &Versioned<T>) -> RepoResult<(), T> {
        let identity = expected.identity();
        let gate = match self.records.entry(identity) {
            Entry::Vacant(_) => Gate::Missing,
            Entry::Occupied(slot) => {
                if slot.get().version() != expected.version() {
                    Gate::Stale(slot.get().clone())
                } else {
                    // Announce before the shard lock goes away with the entry.
                    self.waiter.publish(identity, Change::Deleted);
                    slot.remove();
                    Gate::Applied(())
                }
            }
        };

        match gate {
            Gate::Applied(()) => {
                debug!("deleted");
                Ok(())
            }
            Gate::Missing => Err(self.not_found(identity)),
            Gate::Stale(current) => Err(RepoError::Conflict(Box::new(current))),
        }
    }

    async fn touch(&self, identity: Uuid) -> RepoResult<Versioned<T>, T> {
        let mut slot = self
            .records
            .get_mut(&identity)
            .ok_or_else(|| self.not_found(identity))?;
        let next = Versioned::from_parts(identity, fresh_version(), slot.value().value().clone());
        *slot = next.clone();
        self.waiter.publish(identity, Change::Updated(next.clone()));
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::repository::{delete_latest, update_with};

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Counter {
        hits: u32,
    }

    fn repo() -> MemoryRepository<Counter> {
        MemoryRepository::new("counter")
    }

    #[tokio::test]
    async fn get_after_save_returns_payload() {
        let repo = repo();
        let saved = repo.save(Counter { hits: 1 }).await.unwrap();
        let fetched = repo.get(saved.identity()).await.unwrap();
        assert_eq!(fetched, saved);
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test]
    async fn stale_update_conflicts_with_winner() {
        let repo = repo();
        let v0 = repo.save(Counter { hits: 0 }).await.unwrap();

        let v1 = repo.update(&v0, Counter { hits: 1 }).await.unwrap();
        let err = repo.update(&v0, Counter { hits: 99 }).await.unwrap_err();

        let current = err.conflict().expect("conflict");
        assert!(current.same_snapshot(&v1));
        assert_eq!(repo.get(v0.identity()).await.unwrap().value().hits, 1);
    }

    #[tokio::test]
    async fn delete_is_terminal() {
        let repo = repo();
        let v0 = repo.save(Counter { hits: 0 }).await.unwrap();
        repo.delete(&v0).await.unwrap();

        assert!(repo.get(v0.identity()).await.unwrap_err().is_not_found());
        assert!(repo.delete(&v0).await.unwrap_err().is_not_found());
        assert!(repo.update(&v0, Counter { hits: 1 }).await.unwrap_err().is_not_found());
        assert!(repo.touch(v0.identity()).await.unwrap_err().is_not_found());
        assert!(repo.is_empty());
    }

    #[tokio::test]
    async fn stale_delete_conflicts() {
        let repo = repo();
        let v0 = repo.save(Counter { hits: 0 }).await.unwrap();
        let v1 = repo.update(&v0, Counter { hits: 1 }).await.unwrap();

        let err = repo.delete(&v0).await.unwrap_err();
        assert!(err.conflict().unwrap().same_snapshot(&v1));
        repo.delete(&v1).await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_updates_on_one_version_have_one_winner() {
        let repo = Arc::new(repo());
        let v0 = repo.save(Counter { hits: 0 }).await.unwrap();

        let handles: Vec<_> = (1..=16)
            .map(|n| {
                let repo = Arc::clone(&repo);
                let v0 = v0.clone();
                tokio::spawn(async move { repo.update(&v0, Counter { hits: n }).await })
            })
            .collect();

        let mut winners = Vec::new();
        let mut conflicts = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                Ok(record) => winners.push(record),
                Err(RepoError::Conflict(current)) => conflicts.push(*current),
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(winners.len(), 1);
        assert_eq!(conflicts.len(), 15);
        for current in &conflicts {
            assert!(current.same_snapshot(&winners[0]));
        }
    }

    #[tokio::test]
    async fn update_with_retries_on_fresh_state() {
        let repo = Arc::new(repo());
        let v0 = repo.save(Counter { hits: 0 }).await.unwrap();

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let repo = Arc::clone(&repo);
                let v0 = v0.clone();
                tokio::spawn(async move {
                    update_with(repo.as_ref(), v0, 64, |c| Counter { hits: c.hits + 1 }).await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(repo.get(v0.identity()).await.unwrap().value().hits, 10);
    }

    #[tokio::test]
    async fn update_with_reports_exhaustion() {
        let repo = repo();
        let v0 = repo.save(Counter { hits: 0 }).await.unwrap();
        let v1 = repo.update(&v0, Counter { hits: 5 }).await.unwrap();

        // A mutation that always races a competing writer never lands.
        let competitor = &repo;
        let err = update_with(&repo, v0.clone(), 3, |c| {
            let current = competitor.records.get(&v0.identity()).unwrap().clone();
            competitor
                .records
                .insert(v0.identity(), current.next_version(Counter { hits: c.hits }));
            Counter { hits: c.hits + 1 }
        })
        .await
        .unwrap_err();

        match err {
            RepoError::RetriesExhausted { attempts, current } => {
                assert_eq!(attempts, 3);
                assert_eq!(current.identity(), v1.identity());
            }
            other => panic!("expected exhaustion, got {other}"),
        }
    }

    #[tokio::test]
    async fn update_with_stops_on_not_found() {
        let repo = repo();
        let v0 = repo.save(Counter { hits: 0 }).await.unwrap();
        repo.delete(&v0).await.unwrap();

        let err = update_with(&repo, v0, 5, |c| c.clone()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn delete_latest_follows_newer_versions() {
        let repo = repo();
        let v0 = repo.save(Counter { hits: 0 }).await.unwrap();
        repo.update(&v0, Counter { hits: 1 }).await.unwrap();

        delete_latest(&repo, v0.clone(), 3).await.unwrap();
        assert!(repo.get(v0.identity()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_already_newer() {
        let repo = repo();
        let v0 = repo.save(Counter { hits: 0 }).await.unwrap();
        let v1 = repo.update(&v0, Counter { hits: 1 }).await.unwrap();

        let started = std::time::Instant::now();
        let got = repo
            .wait_for_next_version(v0.identity(), v0.version(), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(got.same_snapshot(&v1));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(repo.waiter().tracked(), 0);
    }

    #[tokio::test]
    async fn wait_unblocks_on_concurrent_update() {
        let repo = Arc::new(repo());
        let v0 = repo.save(Counter { hits: 0 }).await.unwrap();

        let waiter = {
            let repo = Arc::clone(&repo);
            let v0 = v0.clone();
            tokio::spawn(async move {
                repo.wait_for_next_version(v0.identity(), v0.version(), Duration::from_secs(5))
                    .await
            })
        };
        while repo.waiter().waiting(v0.identity()) == 0 {
            tokio::task::yield_now().await;
        }

        let v1 = repo.update(&v0, Counter { hits: 1 }).await.unwrap();
        let got = waiter.await.unwrap().unwrap();
        assert!(got.same_snapshot(&v1));
        assert_eq!(repo.waiter().tracked(), 0);
    }

    #[tokio::test]
    async fn wait_times_out_without_updates() {
        let repo = repo();
        let v0 = repo.save(Counter { hits: 0 }).await.unwrap();
        let err = repo
            .wait_for_next_version(v0.identity(), v0.version(), Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::Timeout { .. }));
        assert_eq!(repo.waiter().tracked(), 0);
    }

    #[tokio::test]
    async fn wait_on_missing_identity_is_not_found() {
        let repo = repo();
        let err = repo
            .wait_for_next_version(Uuid::now_v7(), Uuid::new_v4(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(repo.waiter().tracked(), 0);
    }

    #[tokio::test]
    async fn follower_tracks_concurrent_writers_until_deletion() {
        let repo = Arc::new(repo());
        let v0 = repo.save(Counter { hits: 0 }).await.unwrap();

        let follower = {
            let repo = Arc::clone(&repo);
            let id = v0.identity();
            let mut known = v0.version();
            tokio::spawn(async move {
                let mut seen = 0;
                loop {
                    match repo.wait_for_next_version(id, known, Duration::from_secs(5)).await {
                        Ok(next) => {
                            seen += 1;
                            known = next.version();
                        }
                        Err(err) if err.is_not_found() => return seen,
                        Err(err) => panic!("follower stalled: {err}"),
                    }
                }
            })
        };

        let writers: Vec<_> = (0..8)
            .map(|_| {
                let repo = Arc::clone(&repo);
                let v0 = v0.clone();
                tokio::spawn(async move {
                    update_with(&*repo, v0, 64, |c: &Counter| Counter { hits: c.hits + 1 }).await
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }
        let last = repo.get(v0.identity()).await.unwrap();
        assert_eq!(last.value().hits, 8);
        delete_latest(&*repo, last, 3).await.unwrap();

        let seen = follower.await.unwrap();
        assert!(seen <= 8);
        assert_eq!(repo.waiter().tracked(), 0);
    }

    #[tokio::test]
    async fn touch_wakes_waiters_without_changing_payload() {
        let repo = Arc::new(repo());
        let v0 = repo.save(Counter { hits: 7 }).await.unwrap();

        let waiter = {
            let repo = Arc::clone(&repo);
            let v0 = v0.clone();
            tokio::spawn(async move {
                repo.wait_for_next_version(v0.identity(), v0.version(), Duration::from_secs(5))
                    .await
            })
        };
        while repo.waiter().waiting(v0.identity()) == 0 {
            tokio::task::yield_now().await;
        }

        let touched = repo.touch(v0.identity()).await.unwrap();
        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.version(), touched.version());
        assert_eq!(got.value(), v0.value());
    }
}
