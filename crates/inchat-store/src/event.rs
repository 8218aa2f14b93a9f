//! Channel events: joins and messages.
//!
//! Every event has a row in `events`; message bodies live in `messages`,
//! keyed by the event id and removed with it.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::sqlite::{Table, from_millis, now_millis, parse_uuid};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    Join,
    Message { content: String },
}

/// Something that happened in a channel, attributed to the sender's alias.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub channel: Uuid,
    pub time: DateTime<Utc>,
    pub sender: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn join(channel: Uuid, sender: impl Into<String>) -> Self {
        Self {
            channel,
            time: now_millis(),
            sender: sender.into(),
            kind: EventKind::Join,
        }
    }

    pub fn message(channel: Uuid, sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            channel,
            time: now_millis(),
            sender: sender.into(),
            kind: EventKind::Message {
                content: content.into(),
            },
        }
    }

    /// Copy with the message body replaced; `None` for join events.
    pub fn with_content(&self, content: &str) -> Option<Self> {
        match self.kind {
            EventKind::Message { .. } => Some(Self {
                kind: EventKind::Message {
                    content: content.to_string(),
                },
                ..self.clone()
            }),
            EventKind::Join => None,
        }
    }

    pub fn content(&self) -> Option<&str> {
        match &self.kind {
            EventKind::Message { content } => Some(content),
            EventKind::Join => None,
        }
    }

    fn kind_str(&self) -> &'static str {
        match self.kind {
            EventKind::Join => "join",
            EventKind::Message { .. } => "message",
        }
    }
}

fn write_body(tx: &Transaction<'_>, id: &str, event: &Event) -> StoreResult<()> {
    tx.execute("DELETE FROM messages WHERE id = ?1", [id])?;
    if let Some(content) = event.content() {
        tx.execute(
            "INSERT INTO messages (id, content) VALUES (?1, ?2)",
            params![id, content],
        )?;
    }
    Ok(())
}

impl Table for Event {
    const ENTITY: &'static str = "event";
    const TABLE: &'static str = "events";

    fn insert(tx: &Transaction<'_>, id: &str, version: &str, value: &Self) -> StoreResult<()> {
        tx.execute(
            "INSERT INTO events (id, version, channel, kind, time, sender)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                version,
                value.channel.to_string(),
                value.kind_str(),
                value.time.timestamp_millis(),
                value.sender
            ],
        )?;
        write_body(tx, id, value)
    }

    fn rewrite(tx: &Transaction<'_>, id: &str, value: &Self) -> StoreResult<()> {
        tx.execute(
            "UPDATE events SET channel = ?2, kind = ?3, time = ?4, sender = ?5 WHERE id = ?1",
            params![
                id,
                value.channel.to_string(),
                value.kind_str(),
                value.time.timestamp_millis(),
                value.sender
            ],
        )?;
        write_body(tx, id, value)
    }

    fn load(conn: &Connection, id: &str) -> StoreResult<Option<(String, Self)>> {
        let row = conn
            .query_row(
                "SELECT e.version, e.channel, e.kind, e.time, e.sender, m.content
                 FROM events e LEFT JOIN messages m ON m.id = e.id
                 WHERE e.id = ?1",
                [id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                },
            )
            .optional()?;
        let Some((version, channel, kind, time, sender, content)) = row else {
            return Ok(None);
        };

        let kind = match (kind.as_str(), content) {
            ("join", _) => EventKind::Join,
            ("message", Some(content)) => EventKind::Message { content },
            (kind, _) => {
                return Err(StoreError::Corrupt {
                    entity: Self::ENTITY,
                    reason: format!("{kind} event {id} has no usable body"),
                });
            }
        };

        Ok(Some((
            version,
            Event {
                channel: parse_uuid(Self::ENTITY, &channel)?,
                time: from_millis(Self::ENTITY, time)?,
                sender,
                kind,
            },
        )))
    }
}
