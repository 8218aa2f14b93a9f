//! Public user profiles.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::password::UserName;
use crate::sqlite::{Table, from_millis, now_millis};

/// The public part of a registered user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub name: UserName,
    pub joined: DateTime<Utc>,
}

impl User {
    /// A user who joins now.
    pub fn new(name: UserName) -> Self {
        Self {
            name,
            joined: now_millis(),
        }
    }
}

impl Table for User {
    const ENTITY: &'static str = "user";
    const TABLE: &'static str = "users";

    fn insert(tx: &Transaction<'_>, id: &str, version: &str, value: &Self) -> StoreResult<()> {
        tx.execute(
            "INSERT INTO users (id, version, name, joined) VALUES (?1, ?2, ?3, ?4)",
            params![id, version, value.name.as_str(), value.joined.timestamp_millis()],
        )?;
        Ok(())
    }

    fn rewrite(tx: &Transaction<'_>, id: &str, value: &Self) -> StoreResult<()> {
        tx.execute(
            "UPDATE users SET name = ?2, joined = ?3 WHERE id = ?1",
            params![id, value.name.as_str(), value.joined.timestamp_millis()],
        )?;
        Ok(())
    }

    fn load(conn: &Connection, id: &str) -> StoreResult<Option<(String, Self)>> {
        let row = conn
            .query_row(
                "SELECT version, name, joined FROM users WHERE id = ?1",
                [id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((version, name, joined)) = row else {
            return Ok(None);
        };
        let name = UserName::parse(&name).map_err(|reason| StoreError::Corrupt {
            entity: Self::ENTITY,
            reason,
        })?;
        Ok(Some((
            version,
            User {
                name,
                joined: from_millis(Self::ENTITY, joined)?,
            },
        )))
    }
}
