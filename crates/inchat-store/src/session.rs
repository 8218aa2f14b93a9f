//! Login sessions.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreResult;
use crate::sqlite::{Table, from_millis, now_millis, parse_uuid};

/// An authenticated session for one account, valid until `expiry`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub account: Uuid,
    pub expiry: DateTime<Utc>,
}

impl Session {
    /// A session for `account` that expires `ttl` from now.
    pub fn new(account: Uuid, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let expiry = now_millis()
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self { account, expiry }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

impl Table for Session {
    const ENTITY: &'static str = "session";
    const TABLE: &'static str = "chat_sessions";

    fn insert(tx: &Transaction<'_>, id: &str, version: &str, value: &Self) -> StoreResult<()> {
        tx.execute(
            "INSERT INTO chat_sessions (id, version, account, expiry) VALUES (?1, ?2, ?3, ?4)",
            params![
                id,
                version,
                value.account.to_string(),
                value.expiry.timestamp_millis()
            ],
        )?;
        Ok(())
    }

    fn rewrite(tx: &Transaction<'_>, id: &str, value: &Self) -> StoreResult<()> {
        tx.execute(
            "UPDATE chat_sessions SET account = ?2, expiry = ?3 WHERE id = ?1",
            params![id, value.account.to_string(), value.expiry.timestamp_millis()],
        )?;
        Ok(())
    }

    fn load(conn: &Connection, id: &str) -> StoreResult<Option<(String, Self)>> {
        let row = conn
            .query_row(
                "SELECT version, account, expiry FROM chat_sessions WHERE id = ?1",
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
        let Some((version, account, expiry)) = row else {
            return Ok(None);
        };
        Ok(Some((
            version,
            Session {
                account: parse_uuid(Self::ENTITY, &account)?,
                expiry: from_millis(Self::ENTITY, expiry)?,
            },
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_is_inclusive() {
        let session = Session::new(Uuid::now_v7(), Duration::from_secs(60));
        assert!(!session.is_expired());
        assert!(!session.is_expired_at(session.expiry - chrono::Duration::milliseconds(1)));
        assert!(session.is_expired_at(session.expiry));
    }

    #[test]
    fn huge_ttl_saturates() {
        let session = Session::new(Uuid::now_v7(), Duration::from_secs(u64::MAX));
        assert!(!session.is_expired());
    }
}
