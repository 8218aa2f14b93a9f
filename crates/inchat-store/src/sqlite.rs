//! SQLite-backed [`Repository`].
//!
//! Entity modules describe how their payload maps onto rows by implementing
//! [`Table`]; everything version-related lives here and is shared by every
//! entity kind:
//!
//! * identities and versions are stored as text in the parent table's `id`
//!   and `version` columns,
//! * each write runs in one [`Database::transaction`], so the parent row and
//!   all child rows commit together or not at all,
//! * the compare-and-swap is a conditional
//!   `UPDATE ... SET version = new WHERE id = ? AND version = expected`,
//!   executed after the stored version has been checked inside the same
//!   transaction,
//! * waiters are notified after the transaction has committed but before the
//!   connection is released, so notifications follow commit order.

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{RepoError, RepoResult, StoreError, StoreResult};
use crate::record::{Payload, Versioned, fresh_version};
use crate::repository::Repository;
use crate::waiter::{Change, VersionWaiter};

/// Row mapping for one entity kind.
///
/// Implementations only deal with payload columns and child rows; the
/// repository owns the `id`/`version` protocol.
pub trait Table: Payload {
    /// Entity name used in errors and logs.
    const ENTITY: &'static str;
    /// Parent table; must have `id TEXT PRIMARY KEY` and `version TEXT`.
    const TABLE: &'static str;

    /// Insert the parent row (including `id` and `version`) and all child
    /// rows.
    fn insert(tx: &Transaction<'_>, id: &str, version: &str, value: &Self) -> StoreResult<()>;

    /// Overwrite payload columns and replace child rows of an existing
    /// entity. The version column has already been advanced.
    fn rewrite(tx: &Transaction<'_>, id: &str, value: &Self) -> StoreResult<()>;

    /// Read the stored version and payload, or `None` if `id` is absent.
    fn load(conn: &Connection, id: &str) -> StoreResult<Option<(String, Self)>>;
}

/// Parse a UUID column.
pub(crate) fn parse_uuid(entity: &'static str, raw: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(raw).map_err(|e| StoreError::Corrupt {
        entity,
        reason: format!("invalid uuid {raw:?}: {e}"),
    })
}

/// Current time at the precision timestamps are stored with.
pub(crate) fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Parse a Unix-millisecond timestamp column.
pub(crate) fn from_millis(entity: &'static str, millis: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| StoreError::Corrupt {
        entity,
        reason: format!("timestamp out of range: {millis}"),
    })
}

pub(crate) fn load_record<T: Table>(conn: &Connection, id: Uuid) -> StoreResult<Option<Versioned<T>>> {
    T::load(conn, &id.to_string())?
        .map(|(version, value)| {
            Ok(Versioned::from_parts(id, parse_uuid(T::ENTITY, &version)?, value))
        })
        .transpose()
}

/// Advance the version column, guarded by the expected version.
fn swap_version<T: Table>(tx: &Transaction<'_>, id: &str, expected: Uuid, next: Uuid) -> StoreResult<()> {
    let sql = format!(
        "UPDATE {} SET version = ?1 WHERE id = ?2 AND version = ?3",
        T::TABLE
    );
    let changed = tx.execute(
        &sql,
        rusqlite::params![next.to_string(), id, expected.to_string()],
    )?;
    if changed != 1 {
        return Err(StoreError::Corrupt {
            entity: T::ENTITY,
            reason: format!("version of {id} changed inside its own transaction"),
        });
    }
    Ok(())
}

fn not_found<T: Table>(id: Uuid) -> RepoError<T> {
    RepoError::NotFound {
        entity: T::ENTITY,
        id,
    }
}

/// Load `expected`'s identity and check it is still at `expected`'s version.
fn gate<T: Table>(tx: &Transaction<'_>, expected: &Versioned<T>) -> RepoResult<(), T> {
    match load_record::<T>(tx, expected.identity())? {
        None => Err(not_found(expected.identity())),
        Some(current) if current.version() != expected.version() => {
            debug!(entity = T::ENTITY, stored = %current.version(), "stale write refused");
            Err(RepoError::Conflict(Box::new(current)))
        }
        Some(_) => Ok(()),
    }
}

/// Insert a new entity inside `tx`.
pub(crate) fn stage_insert<T: Table>(tx: &Transaction<'_>, value: T) -> StoreResult<Versioned<T>> {
    let record = Versioned::new(value);
    T::insert(
        tx,
        &record.identity().to_string(),
        &record.version().to_string(),
        record.value(),
    )?;
    Ok(record)
}

/// Compare-and-swap update inside `tx`.
pub(crate) fn stage_update<T: Table>(tx: &Transaction<'_>, expected: &Versioned<T>, value: T) -> RepoResult<Versioned<T>, T> {
    gate(tx, expected)?;
    let next = expected.next_version(value);
    let key = next.identity().to_string();
    swap_version::<T>(tx, &key, expected.version(), next.version())?;
    T::rewrite(tx, &key, next.value())?;
    Ok(next)
}

/// Compare-and-swap delete inside `tx`. Child rows go with the parent
/// through ON DELETE CASCADE.
pub(crate) fn stage_delete<T: Table>(tx: &Transaction<'_>, expected: &Versioned<T>) -> RepoResult<(), T> {
    gate(tx, expected)?;
    let sql = format!("DELETE FROM {} WHERE id = ?1 AND version = ?2", T::TABLE);
    tx.execute(
        &sql,
        rusqlite::params![expected.identity().to_string(), expected.version().to_string()],
    )
    .map_err(StoreError::from)?;
    Ok(())
}

/// Mint a new version for the stored payload inside `tx`.
pub(crate) fn stage_touch<T: Table>(tx: &Transaction<'_>, identity: Uuid) -> RepoResult<Versioned<T>, T> {
    let current = load_record::<T>(tx, identity)?.ok_or_else(|| not_found(identity))?;
    let next = fresh_version();
    swap_version::<T>(tx, &identity.to_string(), current.version(), next)?;
    Ok(Versioned::from_parts(identity, next, current.into_value()))
}

/// Look up one entity through a query selecting its `id`.
///
/// `sql` must take exactly one parameter and return at most one row whose
/// first column is the entity's identity.
pub(crate) fn lookup<T: Table>(conn: &Connection, sql: &str, param: &str) -> StoreResult<Option<Versioned<T>>> {
    let id: Option<String> = conn.query_row(sql, [param], |row| row.get(0)).optional()?;
    match id {
        Some(raw) => load_record::<T>(conn, parse_uuid(T::ENTITY, &raw)?),
        None => Ok(None),
    }
}

/// Waiter notifications held back until the surrounding transaction has
/// committed. Fire them from the `committed` hook of
/// [`Database::transaction_then`].
#[derive(Default)]
pub(crate) struct Announcements(Vec<Box<dyn FnOnce() + Send>>);

impl Announcements {
    pub(crate) fn updated<T: Payload>(&mut self, waiter: &VersionWaiter<T>, record: &Versioned<T>) {
        let waiter = waiter.clone();
        let record = record.clone();
        self.0.push(Box::new(move || {
            waiter.publish(record.identity(), Change::Updated(record));
        }));
    }

    pub(crate) fn deleted<T: Payload>(&mut self, waiter: &VersionWaiter<T>, identity: Uuid) {
        let waiter = waiter.clone();
        self.0.push(Box::new(move || {
            waiter.publish(identity, Change::Deleted);
        }));
    }

    pub(crate) fn publish(self) {
        for announce in self.0 {
            announce();
        }
    }
}

/// Versioned storage for entity kind `T` in the chat database.
pub struct SqliteRepository<T> {
    db: Database,
    waiter: VersionWaiter<T>,
}

impl<T: Table> SqliteRepository<T> {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            waiter: VersionWaiter::new(T::ENTITY),
        }
    }

    /// The underlying database handle.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Look up one entity through a query selecting its `id`.
    ///
    /// `sql` must take exactly one parameter and return at most one row
    /// whose first column is the entity's identity.
    pub async fn find_by(&self, sql: &'static str, param: String) -> RepoResult<Option<Versioned<T>>, T> {
        Ok(self.db.execute(move |conn| lookup::<T>(conn, sql, &param)).await?)
    }
}

#[async_trait]
impl<T: Table> Repository<T> for SqliteRepository<T> {
    fn waiter(&self) -> &VersionWaiter<T> {
        &self.waiter
    }

    #[instrument(skip_all, fields(entity = T::ENTITY))]
    async fn save(&self, value: T) -> RepoResult<Versioned<T>, T> {
        let record = self.db.transaction(move |tx| stage_insert(tx, value)).await?;
        debug!(identity = %record.identity(), "saved");
        Ok(record)
    }

    async fn get(&self, identity: Uuid) -> RepoResult<Versioned<T>, T> {
        self.db
            .execute(move |conn| load_record::<T>(conn, identity))
            .await?
            .ok_or_else(|| not_found(identity))
    }

    #[instrument(skip_all, fields(entity = T::ENTITY, identity = %expected.identity()))]
    async fn update(&self, expected: &Versioned<T>, value: T) -> RepoResult<Versioned<T>, T> {
        let expected = expected.clone();
        let waiter = self.waiter.clone();
        let next = self
            .db
            .transaction_then(
                move |tx| stage_update(tx, &expected, value),
                move |next: Versioned<T>| {
                    waiter.publish(next.identity(), Change::Updated(next.clone()));
                    next
                },
            )
            .await?;
        debug!(version = %next.version(), "updated");
        Ok(next)
    }

    #[instrument(skip_all, fields(entity = T::ENTITY, identity = %expected.identity()))]
    async fn delete(&self, expected: &Versioned<T>) -> RepoResult<(), T> {
        let identity = expected.identity();
        let expected = expected.clone();
        let waiter = self.waiter.clone();
        self.db
            .transaction_then(
                move |tx| stage_delete(tx, &expected),
                move |()| {
                    waiter.publish(identity, Change::Deleted);
                },
            )
            .await?;
        debug!("deleted");
        Ok(())
    }

    #[instrument(skip_all, fields(entity = T::ENTITY, %identity))]
    async fn touch(&self, identity: Uuid) -> RepoResult<Versioned<T>, T> {
        let waiter = self.waiter.clone();
        let touched = self
            .db
            .transaction_then(
                move |tx| stage_touch::<T>(tx, identity),
                move |next: Versioned<T>| {
                    waiter.publish(identity, Change::Updated(next.clone()));
                    next
                },
            )
            .await?;
        debug!(version = %touched.version(), "touched");
        Ok(touched)
    }
}
