//! Long-poll primitive: park until an identity moves past a known version.
//!
//! A [`VersionWaiter`] keeps one slot per identity that currently has parked
//! callers. Each slot owns a [`tokio::sync::watch`] sender over a short log of
//! published changes; every subscriber holds a receiver. Publishing appends to
//! the log, which wakes every receiver at once (broadcast).
//!
//! # Missed wakeups
//!
//! Callers must [`subscribe`](VersionWaiter::subscribe) *before* reading the
//! current version from the store. A subscription sees every change published
//! after it was created, so an update committed between the read and the park
//! is still observed:
//!
//! ```text
//! subscribe(id) ──► get(id) ──► version == known? ──► next_after(known)
//!       ▲                                                  ▲
//!       └──── any publish from here on is seen ────────────┘
//! ```
//!
//! # Ordering
//!
//! Repositories publish while still holding the identity's critical section,
//! so the log is in commit order. A subscriber that is slow to wake still
//! judges the whole log since it subscribed: a deletion anywhere in it ends
//! the wait with [`RepoError::NotFound`], otherwise the newest version other
//! than `known` is returned.
//!
//! # Lifecycle
//!
//! A [`Subscription`] deregisters itself on drop: after wake-up, timeout, or
//! when the waiting future is cancelled. Log entries no live subscriber can
//! see are dropped at the same time, and the slot is removed together with
//! its last subscriber, so the registry only ever holds identities that have
//! someone parked on them.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::{RepoError, RepoResult};
use crate::record::{Payload, Versioned};

/// What happened to an identity.
#[derive(Debug, Clone)]
pub enum Change<T> {
    /// A new version was committed.
    Updated(Versioned<T>),
    /// The entity was deleted.
    Deleted,
}

#[derive(Debug, Clone)]
struct Logged<T> {
    seq: u64,
    change: Change<T>,
}

struct Slot<T> {
    sender: watch::Sender<Vec<Logged<T>>>,
    next_seq: u64,
    /// First sequence number each live subscriber can see, with counts.
    starts: BTreeMap<u64, usize>,
    waiters: usize,
}

type Registry<T> = Mutex<HashMap<Uuid, Slot<T>>>;

/// Per-identity registry of parked callers for one entity kind.
///
/// Cheap to clone; clones share the registry.
pub struct VersionWaiter<T> {
    entity: &'static str,
    slots: Arc<Registry<T>>,
}

impl<T> Clone for VersionWaiter<T> {
    fn clone(&self) -> Self {
        Self {
            entity: self.entity,
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<T: Payload> VersionWaiter<T> {
    /// Create an empty registry. `entity` names the kind in logs and errors.
    pub fn new(entity: &'static str) -> Self {
        Self {
            entity,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register interest in `identity`.
    ///
    /// Everything published for `identity` after this call is visible to the
    /// returned subscription.
    pub fn subscribe(&self, identity: Uuid) -> Subscription<T> {
        let mut slots = lock(&self.slots);
        let slot = slots.entry(identity).or_insert_with(|| Slot {
            sender: watch::Sender::new(Vec::new()),
            next_seq: 0,
            starts: BTreeMap::new(),
            waiters: 0,
        });
        let start = slot.next_seq;
        *slot.starts.entry(start).or_default() += 1;
        slot.waiters += 1;
        let receiver = slot.sender.subscribe();
        trace!(entity = self.entity, %identity, waiters = slot.waiters, "waiter registered");

        Subscription {
            entity: self.entity,
            identity,
            start,
            receiver,
            slots: Arc::clone(&self.slots),
        }
    }

    /// Wake every caller parked on `identity`. Returns how many were parked.
    ///
    /// Identities without subscribers are ignored; nothing is allocated.
    /// Callers must publish changes of one identity in commit order.
    pub fn publish(&self, identity: Uuid, change: Change<T>) -> usize {
        let mut slots = lock(&self.slots);
        match slots.get_mut(&identity) {
            Some(slot) => {
                let seq = slot.next_seq;
                slot.next_seq += 1;
                slot.sender.send_modify(|log| log.push(Logged { seq, change }));
                debug!(entity = self.entity, %identity, woken = slot.waiters, "published change");
                slot.waiters
            }
            None => 0,
        }
    }

    /// Number of callers currently parked on `identity`.
    pub fn waiting(&self, identity: Uuid) -> usize {
        lock(&self.slots).get(&identity).map_or(0, |slot| slot.waiters)
    }

    /// Number of identities with at least one parked caller.
    pub fn tracked(&self) -> usize {
        lock(&self.slots).len()
    }

    /// Changes retained for `identity`.
    #[cfg(test)]
    fn retained(&self, identity: Uuid) -> usize {
        lock(&self.slots)
            .get(&identity)
            .map_or(0, |slot| slot.sender.borrow().len())
    }
}

/// A registered interest in one identity. Deregisters on drop.
pub struct Subscription<T: Payload> {
    entity: &'static str,
    identity: Uuid,
    start: u64,
    receiver: watch::Receiver<Vec<Logged<T>>>,
    slots: Arc<Registry<T>>,
}

impl<T: Payload> Subscription<T> {
    /// The identity this subscription watches.
    pub fn identity(&self) -> Uuid {
        self.identity
    }

    /// Park until a version other than `known` is published for the identity.
    ///
    /// Returns the newest such record, [`RepoError::NotFound`] if the entity
    /// was deleted, or [`RepoError::Timeout`] once `timeout` has elapsed. The
    /// registration is released on every exit path, including cancellation.
    pub async fn next_after(mut self, known: Uuid, timeout: Duration) -> RepoResult<Versioned<T>, T> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.receiver.changed()).await {
                Err(_elapsed) => {
                    debug!(entity = self.entity, identity = %self.identity, ?timeout, "wait timed out");
                    return Err(RepoError::Timeout {
                        id: self.identity,
                        waited: timeout,
                    });
                }
                // The slot (and its sender) lives as long as this
                // subscription is registered, so the channel cannot close
                // underneath us.
                Ok(Err(_closed)) => {
                    return Err(RepoError::Timeout {
                        id: self.identity,
                        waited: timeout,
                    });
                }
                Ok(Ok(())) => {
                    let seen = {
                        let log = self.receiver.borrow_and_update();
                        Self::judge(self.entity, self.identity, self.start, &log, known)
                    };
                    if let Some(outcome) = seen {
                        return outcome;
                    }
                }
            }
        }
    }

    /// Decide the wait from everything published since subscribing, or
    /// `None` to keep waiting.
    fn judge(
        entity: &'static str,
        identity: Uuid,
        start: u64,
        log: &[Logged<T>],
        known: Uuid,
    ) -> Option<RepoResult<Versioned<T>, T>> {
        let mut newest = None;
        for entry in log.iter().filter(|entry| entry.seq >= start) {
            match &entry.change {
                Change::Deleted => {
                    return Some(Err(RepoError::NotFound {
                        entity,
                        id: identity,
                    }));
                }
                Change::Updated(record) if record.version() != known => newest = Some(record),
                Change::Updated(_) => {}
            }
        }
        newest.map(|record| Ok(record.clone()))
    }
}

impl<T: Payload> Drop for Subscription<T> {
    fn drop(&mut self) {
        let mut slots = lock(&self.slots);
        if let Some(slot) = slots.get_mut(&self.identity) {
            if let Some(count) = slot.starts.get_mut(&self.start) {
                *count -= 1;
                if *count == 0 {
                    slot.starts.remove(&self.start);
                }
            }
            slot.waiters = slot.waiters.saturating_sub(1);
            match slot.starts.keys().next().copied() {
                None => {
                    slots.remove(&self.identity);
                }
                Some(oldest) => {
                    slot.sender.send_if_modified(|log| {
                        log.retain(|entry| entry.seq >= oldest);
                        false
                    });
                }
            }
        }
        trace!(entity = self.entity, identity = %self.identity, "waiter released");
    }
}

/// The registry holds plain counters and senders; a panic elsewhere cannot
/// leave it half-updated, so a poisoned lock is still usable.
fn lock<T>(slots: &Registry<T>) -> MutexGuard<'_, HashMap<Uuid, Slot<T>>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}
