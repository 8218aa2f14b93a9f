//! Versioned schema for the chat tables.
//!
//! Every entity table carries `id` and `version` columns next to its payload
//! columns; child tables reference their parent with `ON DELETE CASCADE` so
//! removing a parent row removes its dependents in the same statement.
//! Applied versions are recorded in `_migrations`, making [`run_all`]
//! idempotent.

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};

/// A single migration definition.
struct Migration {
    /// Monotonically increasing version number (1, 2, 3, ...).
    version: u32,
    /// Human-readable description.
    description: &'static str,
    /// Raw SQL to execute. May contain multiple statements separated by `;`.
    sql: &'static str,
}

/// All migrations in order. Add new migrations to the end of this array.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "chat core: users, accounts, memberships, channels, events",
        sql: r#"
            CREATE TABLE users (
                id      TEXT PRIMARY KEY,
                version TEXT NOT NULL,
                name    TEXT NOT NULL UNIQUE,
                joined  INTEGER NOT NULL
            );

            CREATE TABLE accounts (
                id       TEXT PRIMARY KEY,
                version  TEXT NOT NULL,
                user     TEXT NOT NULL UNIQUE REFERENCES users(id) ON DELETE CASCADE,
                password TEXT NOT NULL
            );

            CREATE TABLE channels (
                id      TEXT PRIMARY KEY,
                version TEXT NOT NULL,
                name    TEXT NOT NULL UNIQUE
            );

            CREATE TABLE account_channels (
                account TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                channel TEXT NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
                alias   TEXT NOT NULL,
                role    TEXT NOT NULL CHECK(role IN ('banned','observer','participant','moderator','owner')),
                ordinal INTEGER NOT NULL,
                PRIMARY KEY (account, channel)
            );
            CREATE INDEX idx_account_channels_channel ON account_channels(channel);

            CREATE TABLE events (
                id      TEXT PRIMARY KEY,
                version TEXT NOT NULL,
                channel TEXT NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
                kind    TEXT NOT NULL CHECK(kind IN ('join','message')),
                time    INTEGER NOT NULL,
                sender  TEXT NOT NULL
            );

            CREATE TABLE messages (
                id      TEXT PRIMARY KEY REFERENCES events(id) ON DELETE CASCADE,
                content TEXT NOT NULL
            );

            CREATE TABLE channel_events (
                channel TEXT NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
                event   TEXT NOT NULL REFERENCES events(id) ON DELETE CASCADE,
                ordinal INTEGER NOT NULL,
                PRIMARY KEY (channel, event)
            );
        "#,
    },
    Migration {
        version: 2,
        description: "login sessions",
        sql: r#"
            CREATE TABLE chat_sessions (
                id      TEXT PRIMARY KEY,
                version TEXT NOT NULL,
                account TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                expiry  INTEGER NOT NULL
            );
            CREATE INDEX idx_chat_sessions_account ON chat_sessions(account);
        "#,
    },
];

// ── public API ───────────────────────────────────────────────────────

/// Schema version after every migration has been applied.
pub const LATEST_VERSION: u32 = 2;

/// Apply every migration newer than the recorded schema version.
///
/// Synchronous; [`Database::run_migrations`](crate::Database::run_migrations)
/// calls it on the blocking pool.
pub fn run_all(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version     INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at  INTEGER NOT NULL
        );",
    )
    .map_err(|e| failed(0, "create _migrations table", e))?;

    let current = current_version(conn)?;
    let mut applied = 0;
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        apply(conn, migration)?;
        applied += 1;
    }

    if applied == 0 {
        debug!(current_version = current, "schema is up to date");
    } else {
        info!(from = current, applied, "schema migrated");
    }
    Ok(())
}

/// Latest applied migration version, or 0 on a fresh database.
pub fn current_version(conn: &Connection) -> StoreResult<u32> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM _migrations", [], |row| row.get(0))
        .map_err(|e| failed(0, "read current version", e))
}

// ── internals ────────────────────────────────────────────────────────

fn failed(version: u32, step: &str, err: rusqlite::Error) -> StoreError {
    StoreError::Migration {
        version,
        message: format!("{step}: {err}"),
    }
}

/// Apply one migration and record it, atomically.
fn apply(conn: &Connection, migration: &Migration) -> StoreResult<()> {
    info!(version = migration.version, description = migration.description, "applying migration");

    // `run_all` only gets a shared connection; the unchecked transaction
    // still rolls back on drop if any step below fails.
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| failed(migration.version, "begin", e))?;

    if let Err(e) = tx.execute_batch(migration.sql) {
        warn!(version = migration.version, %e, "migration failed, rolling back");
        return Err(failed(migration.version, "execute", e));
    }

    tx.execute(
        "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![migration.version, migration.description, chrono::Utc::now().timestamp()],
    )
    .map_err(|e| failed(migration.version, "record", e))?;

    tx.commit().map_err(|e| failed(migration.version, "commit", e))
}

// ── tests ────────────────────────────────────────────────────────────
