//! Private account data: credentials and channel memberships.
//!
//! Memberships are child rows in `account_channels`, kept in join order by an
//! `ordinal` column and rewritten as a whole on every account update.

use std::fmt;
use std::str::FromStr;

use rusqlite::{Connection, OptionalExtension, Transaction, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::password::PasswordHash;
use crate::sqlite::{Table, parse_uuid};

/// Privilege level inside one channel, ordered from least to most.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Banned,
    Observer,
    Participant,
    Moderator,
    Owner,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Banned => "banned",
            Self::Observer => "observer",
            Self::Participant => "participant",
            Self::Moderator => "moderator",
            Self::Owner => "owner",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "banned" => Ok(Self::Banned),
            "observer" => Ok(Self::Observer),
            "participant" => Ok(Self::Participant),
            "moderator" => Ok(Self::Moderator),
            "owner" => Ok(Self::Owner),
            other => Err(format!("unknown role: {other:?}")),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One channel an account belongs to, under the alias it uses there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub alias: String,
    pub channel: Uuid,
    pub role: Role,
}

/// Login credentials plus channel memberships of one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Account {
    pub user: Uuid,
    #[serde(skip_serializing)]
    pub password: PasswordHash,
    pub channels: Vec<Membership>,
}

impl Account {
    pub fn new(user: Uuid, password: PasswordHash) -> Self {
        Self {
            user,
            password,
            channels: Vec::new(),
        }
    }

    pub fn membership(&self, channel: Uuid) -> Option<&Membership> {
        self.channels.iter().find(|m| m.channel == channel)
    }

    pub fn role_in(&self, channel: Uuid) -> Option<Role> {
        self.membership(channel).map(|m| m.role)
    }

    /// Copy of this account with `channel` joined as `alias` at `role`.
    ///
    /// An existing membership of the same channel is replaced in place.
    pub fn with_membership(&self, alias: &str, channel: Uuid, role: Role) -> Self {
        let mut next = self.clone();
        let membership = Membership {
            alias: alias.to_string(),
            channel,
            role,
        };
        match next.channels.iter_mut().find(|m| m.channel == channel) {
            Some(existing) => *existing = membership,
            None => next.channels.push(membership),
        }
        next
    }
}

fn write_memberships(tx: &Transaction<'_>, id: &str, channels: &[Membership]) -> StoreResult<()> {
    tx.execute("DELETE FROM account_channels WHERE account = ?1", [id])?;
    let mut stmt = tx.prepare(
        "INSERT INTO account_channels (account, channel, alias, role, ordinal)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for (ordinal, m) in channels.iter().enumerate() {
        stmt.execute(params![
            id,
            m.channel.to_string(),
            m.alias,
            m.role.as_str(),
            ordinal as i64
        ])?;
    }
    Ok(())
}

impl Table for Account {
    const ENTITY: &'static str = "account";
    const TABLE: &'static str = "accounts";

    fn insert(tx: &Transaction<'_>, id: &str, version: &str, value: &Self) -> StoreResult<()> {
        tx.execute(
            "INSERT INTO accounts (id, version, user, password) VALUES (?1, ?2, ?3, ?4)",
            params![id, version, value.user.to_string(), value.password.as_str()],
        )?;
        write_memberships(tx, id, &value.channels)
    }

    fn rewrite(tx: &Transaction<'_>, id: &str, value: &Self) -> StoreResult<()> {
        tx.execute(
            "UPDATE accounts SET user = ?2, password = ?3 WHERE id = ?1",
            params![id, value.user.to_string(), value.password.as_str()],
        )?;
        write_memberships(tx, id, &value.channels)
    }

    fn load(conn: &Connection, id: &str) -> StoreResult<Option<(String, Self)>> {
        let row = conn
            .query_row(
                "SELECT version, user, password FROM accounts WHERE id = ?1",
                [id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        let Some((version, user, password)) = row else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT channel, alias, role FROM account_channels
             WHERE account = ?1 ORDER BY ordinal",
        )?;
        let rows = stmt
            .query_map([id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let channels = rows
            .into_iter()
            .map(|(channel, alias, role)| {
                Ok(Membership {
                    alias,
                    channel: parse_uuid(Self::ENTITY, &channel)?,
                    role: role.parse().map_err(|reason| StoreError::Corrupt {
                        entity: Self::ENTITY,
                        reason,
                    })?,
                })
            })
            .collect::<StoreResult<Vec<_>>>()?;

        Ok(Some((
            version,
            Account {
                user: parse_uuid(Self::ENTITY, &user)?,
                password: PasswordHash::from_stored(password)?,
                channels,
            },
        )))
    }
}
