//! Channels and their ordered event lists.

use rusqlite::{Connection, OptionalExtension, Transaction, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreResult;
use crate::sqlite::{Table, parse_uuid};

/// A named chat channel. `events` holds event identities in posting order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub name: String,
    pub events: Vec<Uuid>,
}

impl Channel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            events: Vec::new(),
        }
    }

    /// Copy with `event` appended. Appending an event already present is a
    /// no-op.
    pub fn with_event(&self, event: Uuid) -> Self {
        let mut next = self.clone();
        if !next.events.contains(&event) {
            next.events.push(event);
        }
        next
    }

    /// Copy with `event` removed.
    pub fn without_event(&self, event: Uuid) -> Self {
        let mut next = self.clone();
        next.events.retain(|e| *e != event);
        next
    }
}

fn write_events(tx: &Transaction<'_>, id: &str, events: &[Uuid]) -> StoreResult<()> {
    tx.execute("DELETE FROM channel_events WHERE channel = ?1", [id])?;
    let mut stmt =
        tx.prepare("INSERT INTO channel_events (channel, event, ordinal) VALUES (?1, ?2, ?3)")?;
    for (ordinal, event) in events.iter().enumerate() {
        stmt.execute(params![id, event.to_string(), ordinal as i64])?;
    }
    Ok(())
}

impl Table for Channel {
    const ENTITY: &'static str = "channel";
    const TABLE: &'static str = "channels";

    fn insert(tx: &Transaction<'_>, id: &str, version: &str, value: &Self) -> StoreResult<()> {
        tx.execute(
            "INSERT INTO channels (id, version, name) VALUES (?1, ?2, ?3)",
            params![id, version, value.name],
        )?;
        write_events(tx, id, &value.events)
    }

    fn rewrite(tx: &Transaction<'_>, id: &str, value: &Self) -> StoreResult<()> {
        tx.execute(
            "UPDATE channels SET name = ?2 WHERE id = ?1",
            params![id, value.name],
        )?;
        write_events(tx, id, &value.events)
    }

    fn load(conn: &Connection, id: &str) -> StoreResult<Option<(String, Self)>> {
        let row = conn
            .query_row(
                "SELECT version, name FROM channels WHERE id = ?1",
                [id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        let Some((version, name)) = row else {
            return Ok(None);
        };

        let mut stmt =
            conn.prepare("SELECT event FROM channel_events WHERE channel = ?1 ORDER BY ordinal")?;
        let events = stmt
            .query_map([id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?
            .iter()
            .map(|raw| parse_uuid(Self::ENTITY, raw))
            .collect::<StoreResult<Vec<_>>>()?;

        Ok(Some((version, Channel { name, events })))
    }
}
