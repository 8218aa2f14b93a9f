//! Chat operations composed from the versioned repositories.
//!
//! [`ChatService`] owns one [`SqliteRepository`] per entity kind plus the
//! process-wide [`LoginThrottle`]. Operations that touch several entities
//! (registering, joining, posting, editing) read and write them inside one
//! transaction, so concurrent joins, posts and role changes never overwrite
//! each other and a failure leaves nothing half-written.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Transaction};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::account::{Account, Role};
use crate::channel::Channel;
use crate::config::ChatConfig;
use crate::db::Database;
use crate::error::{RepoError, StoreError, StoreResult};
use crate::event::Event;
use crate::password::{PasswordHash, UserName, validate_password};
use crate::record::Versioned;
use crate::repository::{Repository, delete_latest};
use crate::session::Session;
use crate::sqlite::{
    Announcements, SqliteRepository, Table, load_record, lookup, stage_delete, stage_insert, stage_touch,
    stage_update,
};
use crate::throttle::{LoginOutcome, LoginThrottle};
use crate::user::User;
use crate::waiter::VersionWaiter;

const CHANNEL_NAME_MAX: usize = 64;
const MESSAGE_MAX: usize = 4_096;

// ═══════════════════════════════════════════════════════════════════════
//  Errors
// ═══════════════════════════════════════════════════════════════════════

/// Failures of chat operations.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Input rejected before touching the store.
    #[error("invalid input: {0}")]
    Validation(String),

    /// Unknown user name or unusable credentials. Deliberately vague.
    #[error("invalid user name or password")]
    InvalidCredentials,

    #[error("{entity} {name:?} already exists")]
    Duplicate { entity: &'static str, name: String },

    /// The caller lacks the role the operation needs.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The entity was never created or has been deleted.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("session expired")]
    SessionExpired,

    /// Optimistic updates kept losing to concurrent writers.
    #[error("{entity} {id} is too busy: gave up after {attempts} attempts")]
    Contention {
        entity: &'static str,
        id: Uuid,
        attempts: u32,
    },

    /// No new version appeared before the deadline.
    #[error("no new version of {entity} {id} within {waited:?}")]
    Timeout {
        entity: &'static str,
        id: Uuid,
        waited: Duration,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type ChatResult<T> = Result<T, ChatError>;

impl<T: Table> From<RepoError<T>> for ChatError {
    fn from(err: RepoError<T>) -> Self {
        match err {
            RepoError::NotFound { entity, id } => Self::NotFound { entity, id },
            RepoError::Conflict(current) => Self::Contention {
                entity: T::ENTITY,
                id: current.identity(),
                attempts: 1,
            },
            RepoError::Timeout { id, waited } => Self::Timeout {
                entity: T::ENTITY,
                id,
                waited,
            },
            RepoError::RetriesExhausted { attempts, current } => Self::Contention {
                entity: T::ENTITY,
                id: current.identity(),
                attempts,
            },
            RepoError::Store(err) => Self::Store(err),
        }
    }
}

fn is_unique_violation(err: &StoreError) -> bool {
    matches!(
        err,
        StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

/// Map a unique-constraint failure to `duplicate`, anything else to
/// [`ChatError::Store`].
fn unique_or(err: StoreError, duplicate: impl FnOnce() -> ChatError) -> ChatError {
    if is_unique_violation(&err) {
        duplicate()
    } else {
        err.into()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Login result
// ═══════════════════════════════════════════════════════════════════════

/// Outcome of a login attempt for an existing user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LoginResult {
    /// Credentials accepted; a fresh session was created.
    Allowed { session: Versioned<Session> },
    /// Wrong password.
    Denied { failures: u32 },
    /// Too many failures; no attempt is checked before `until`.
    Blocked { until: DateTime<Utc> },
}

// ═══════════════════════════════════════════════════════════════════════
//  ChatService
// ═══════════════════════════════════════════════════════════════════════

/// The chat application's storage-facing operations.
///
/// Operations that write more than one entity run as a single transaction:
/// either every record they touch is committed or none is.
pub struct ChatService {
    config: ChatConfig,
    users: SqliteRepository<User>,
    accounts: SqliteRepository<Account>,
    channels: SqliteRepository<Channel>,
    events: SqliteRepository<Event>,
    sessions: SqliteRepository<Session>,
    throttle: LoginThrottle,
}

/// Waiter handles moved into a transaction so its commit can wake them.
#[derive(Clone)]
struct Waiters {
    accounts: VersionWaiter<Account>,
    channels: VersionWaiter<Channel>,
    events: VersionWaiter<Event>,
}

impl ChatService {
    /// Build the service over a migrated database.
    pub fn new(db: Database, config: ChatConfig) -> Self {
        Self {
            users: SqliteRepository::new(db.clone()),
            accounts: SqliteRepository::new(db.clone()),
            channels: SqliteRepository::new(db.clone()),
            events: SqliteRepository::new(db.clone()),
            sessions: SqliteRepository::new(db),
            throttle: LoginThrottle::new(config.throttle),
            config,
        }
    }

    /// Open the configured database, migrate it and build the service.
    pub async fn open(config: ChatConfig) -> ChatResult<Self> {
        let db = Database::open_and_migrate(config.database_path.clone()).await?;
        Ok(Self::new(db, config))
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    pub fn throttle(&self) -> &LoginThrottle {
        &self.throttle
    }

    pub fn channels(&self) -> &SqliteRepository<Channel> {
        &self.channels
    }

    // ── accounts & sessions ─────────────────────────────────────────

    /// Create a user with an account and log it in.
    #[instrument(skip(self, password))]
    pub async fn register(&self, username: &str, password: &str) -> ChatResult<Versioned<Session>> {
        let name = UserName::parse(username).map_err(ChatError::Validation)?;
        validate_password(password).map_err(ChatError::Validation)?;
        if self.find_user(&name).await?.is_some() {
            return Err(duplicate_user(&name));
        }

        let iterations = self.config.password_iterations;
        let secret = password.to_string();
        let hash = tokio::task::spawn_blocking(move || PasswordHash::create(&secret, iterations))
            .await
            .map_err(StoreError::from)??;

        let ttl = self.config.session_ttl();
        let user_name = name.clone();
        let session = self
            .atomically(move |tx, _| {
                let user = stage_insert(tx, User::new(user_name.clone()))
                    .map_err(|err| unique_or(err, || duplicate_user(&user_name)))?;
                let account = stage_insert(tx, Account::new(user.identity(), hash))?;
                Ok(stage_insert(tx, Session::new(account.identity(), ttl))?)
            })
            .await?;
        info!(user = %name, account = %session.value().account, "user registered");
        Ok(session)
    }

    /// Check credentials through the login throttle.
    ///
    /// Unknown user names yield [`ChatError::InvalidCredentials`] and are not
    /// counted by the throttle.
    #[instrument(skip(self, password))]
    pub async fn login(&self, username: &str, password: &str) -> ChatResult<LoginResult> {
        let name = UserName::parse(username).map_err(|_| ChatError::InvalidCredentials)?;
        let Some(user) = self.find_user(&name).await? else {
            debug!("login for unknown user");
            return Err(ChatError::InvalidCredentials);
        };
        let Some(account) = self.account_of_user(user.identity()).await? else {
            warn!(user = %user.identity(), "user has no account");
            return Err(ChatError::InvalidCredentials);
        };

        let locked = self
            .throttle
            .state(account.identity())
            .blocked_until
            .is_some_and(|until| Utc::now() < until);
        let matches = if locked {
            false
        } else {
            let hash = account.value().password.clone();
            let secret = password.to_string();
            tokio::task::spawn_blocking(move || hash.verify(&secret))
                .await
                .map_err(StoreError::from)?
        };

        match self.throttle.check_and_record(account.identity(), matches) {
            LoginOutcome::Allowed => {
                let session = self
                    .sessions
                    .save(Session::new(account.identity(), self.config.session_ttl()))
                    .await?;
                info!(user = %name, "login succeeded");
                Ok(LoginResult::Allowed { session })
            }
            LoginOutcome::Denied { failures } => Ok(LoginResult::Denied { failures }),
            LoginOutcome::Blocked { until } => Ok(LoginResult::Blocked { until }),
        }
    }

    /// Look up a live session. Expired sessions are removed on sight.
    pub async fn restore_session(&self, id: Uuid) -> ChatResult<Versioned<Session>> {
        let session = self.sessions.get(id).await?;
        if !session.value().is_expired() {
            return Ok(session);
        }
        match delete_latest(&self.sessions, session, self.config.update_attempts).await {
            Ok(()) | Err(RepoError::NotFound { .. }) => {}
            Err(err) => return Err(err.into()),
        }
        debug!(session = %id, "expired session removed");
        Err(ChatError::SessionExpired)
    }

    /// End a session. Logging out twice is not an error.
    pub async fn logout(&self, session: Versioned<Session>) -> ChatResult<()> {
        let id = session.identity();
        match delete_latest(&self.sessions, session, self.config.update_attempts).await {
            Ok(()) => {
                info!(session = %id, "logged out");
                Ok(())
            }
            Err(RepoError::NotFound { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    // ── lookups ─────────────────────────────────────────────────────

    pub async fn user(&self, id: Uuid) -> ChatResult<Versioned<User>> {
        Ok(self.users.get(id).await?)
    }

    pub async fn account(&self, id: Uuid) -> ChatResult<Versioned<Account>> {
        Ok(self.accounts.get(id).await?)
    }

    pub async fn channel(&self, id: Uuid) -> ChatResult<Versioned<Channel>> {
        Ok(self.channels.get(id).await?)
    }

    pub async fn event(&self, id: Uuid) -> ChatResult<Versioned<Event>> {
        Ok(self.events.get(id).await?)
    }

    /// The channel's events in posting order.
    ///
    /// Events deleted between reading the channel and reading the event are
    /// skipped.
    pub async fn events(&self, channel: Uuid) -> ChatResult<Vec<Versioned<Event>>> {
        let channel = self.channels.get(channel).await?;
        let mut events = Vec::with_capacity(channel.value().events.len());
        for id in &channel.value().events {
            match self.events.get(*id).await {
                Ok(event) => events.push(event),
                Err(RepoError::NotFound { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(events)
    }

    /// Resolve a channel by its unique name.
    pub async fn channel_by_name(&self, name: &str) -> ChatResult<Option<Versioned<Channel>>> {
        Ok(self
            .channels
            .find_by("SELECT id FROM channels WHERE name = ?1", name.to_string())
            .await?)
    }

    // ── channels ────────────────────────────────────────────────────

    /// Create a channel; the creator joins it as owner.
    #[instrument(skip(self, account), fields(account = %account.identity()))]
    pub async fn create_channel(&self, account: &Versioned<Account>, name: &str) -> ChatResult<Versioned<Channel>> {
        let name = name.trim().to_string();
        if name.is_empty() || name.chars().count() > CHANNEL_NAME_MAX {
            return Err(ChatError::Validation(format!(
                "channel name must be 1 to {CHANNEL_NAME_MAX} characters long"
            )));
        }
        if self.channel_by_name(&name).await?.is_some() {
            return Err(duplicate_channel(&name));
        }

        let owner = account.identity();
        let waiters = self.waiters();
        let channel = self
            .atomically(move |tx, news| {
                let channel = stage_insert(tx, Channel::new(name.as_str()))
                    .map_err(|err| unique_or(err, || duplicate_channel(&name)))?;
                stage_join(tx, news, &waiters, owner, channel, Role::Owner)
            })
            .await?;
        info!(channel = %channel.identity(), name = %channel.value().name, "channel created");
        Ok(channel)
    }

    /// Join a channel. Roles above participant are granted through
    /// [`set_role`](Self::set_role) only.
    #[instrument(skip(self, account), fields(account = %account.identity()))]
    pub async fn join_channel(&self, account: &Versioned<Account>, channel: Uuid, role: Role) -> ChatResult<Versioned<Channel>> {
        if role > Role::Participant {
            return Err(ChatError::Forbidden(format!("cannot join as {role}")));
        }
        let member = account.identity();
        let waiters = self.waiters();
        let updated = self
            .atomically(move |tx, news| {
                let current = require::<Channel>(tx, channel)?;
                stage_join(tx, news, &waiters, member, current, role)
            })
            .await?;
        info!(%channel, %role, "member joined");
        Ok(updated)
    }

    /// Post a message; needs at least participant rights.
    #[instrument(skip(self, account, content), fields(account = %account.identity()))]
    pub async fn post_message(&self, account: &Versioned<Account>, channel: Uuid, content: &str) -> ChatResult<Versioned<Channel>> {
        validate_message(content)?;
        let sender = account.identity();
        let content = content.to_string();
        let waiters = self.waiters();
        let updated = self
            .atomically(move |tx, news| {
                let (alias, role) = membership_in(tx, sender, channel)?;
                if role < Role::Participant {
                    return Err(ChatError::Forbidden(format!("{role}s cannot post")));
                }
                let current = require::<Channel>(tx, channel)?;
                let message = stage_insert(tx, Event::message(channel, alias, content))?;
                let updated = stage_update(tx, &current, current.value().with_event(message.identity()))?;
                news.updated(&waiters.channels, &updated);
                Ok(updated)
            })
            .await?;
        debug!(%channel, version = %updated.version(), "message posted");
        Ok(updated)
    }

    /// Replace the body of a message.
    ///
    /// Moderators and owners may edit any message; participants only their
    /// own.
    #[instrument(skip(self, account, content), fields(account = %account.identity()))]
    pub async fn edit_message(
        &self,
        account: &Versioned<Account>,
        channel: Uuid,
        event: Uuid,
        content: &str,
    ) -> ChatResult<Versioned<Channel>> {
        validate_message(content)?;
        let editor = account.identity();
        let content = content.to_string();
        let waiters = self.waiters();
        self.atomically(move |tx, news| {
            let target = event_in(tx, channel, event)?;
            authorize_event_change(tx, editor, &target)?;
            let Some(edited) = target.value().with_content(&content) else {
                return Err(ChatError::Validation("only messages can be edited".into()));
            };
            let edited = stage_update(tx, &target, edited)?;
            news.updated(&waiters.events, &edited);
            let touched = stage_touch::<Channel>(tx, channel)?;
            news.updated(&waiters.channels, &touched);
            Ok(touched)
        })
        .await
    }

    /// Remove an event from a channel. Same rights as
    /// [`edit_message`](Self::edit_message).
    #[instrument(skip(self, account), fields(account = %account.identity()))]
    pub async fn delete_event(&self, account: &Versioned<Account>, channel: Uuid, event: Uuid) -> ChatResult<Versioned<Channel>> {
        let remover = account.identity();
        let waiters = self.waiters();
        let touched = self
            .atomically(move |tx, news| {
                let target = event_in(tx, channel, event)?;
                authorize_event_change(tx, remover, &target)?;
                stage_delete(tx, &target)?;
                news.deleted(&waiters.events, event);
                let touched = stage_touch::<Channel>(tx, channel)?;
                news.updated(&waiters.channels, &touched);
                Ok(touched)
            })
            .await?;
        debug!(%channel, %event, "event deleted");
        Ok(touched)
    }

    /// Give the member `username` the role `role` in `channel`. Owners only.
    ///
    /// Users who have not joined the channel are refused. An owner may step
    /// down only while another owner remains.
    #[instrument(skip(self, actor), fields(actor = %actor.identity()))]
    pub async fn set_role(
        &self,
        actor: &Versioned<Account>,
        channel: Uuid,
        username: &str,
        role: Role,
    ) -> ChatResult<Versioned<Account>> {
        let name = UserName::parse(username).map_err(ChatError::Validation)?;
        let actor = actor.identity();
        let waiters = self.waiters();
        let user_name = name.clone();
        let updated = self
            .atomically(move |tx, news| {
                require::<Channel>(tx, channel)?;
                let (_, actor_role) = membership_in(tx, actor, channel)?;
                if actor_role != Role::Owner {
                    return Err(ChatError::Forbidden("only owners can change roles".into()));
                }

                let Some(user) = lookup::<User>(tx, "SELECT id FROM users WHERE name = ?1", user_name.as_str())? else {
                    return Err(ChatError::Validation(format!("no user named {user_name}")));
                };
                let Some(target) = lookup::<Account>(
                    tx,
                    "SELECT id FROM accounts WHERE user = ?1",
                    &user.identity().to_string(),
                )?
                else {
                    return Err(ChatError::Validation(format!("{user_name} has no account")));
                };
                let Some(alias) = target.value().membership(channel).map(|m| m.alias.clone()) else {
                    return Err(ChatError::Validation(format!(
                        "{user_name} is not a member of this channel"
                    )));
                };

                if target.identity() == actor && role != Role::Owner && owners_in(tx, channel)? <= 1 {
                    return Err(ChatError::Forbidden("the last owner cannot step down".into()));
                }

                let updated = stage_update(tx, &target, target.value().with_membership(&alias, channel, role))?;
                news.updated(&waiters.accounts, &updated);
                Ok(updated)
            })
            .await?;
        info!(%channel, user = %name, %role, "role changed");
        Ok(updated)
    }

    // ── waiting ─────────────────────────────────────────────────────

    /// Long-poll for a channel version other than `known`, using the
    /// configured timeout.
    pub async fn wait_next_channel_version(&self, channel: Uuid, known: Uuid) -> ChatResult<Versioned<Channel>> {
        self.wait_next_channel_version_for(channel, known, self.config.wait_timeout())
            .await
    }

    pub async fn wait_next_channel_version_for(
        &self,
        channel: Uuid,
        known: Uuid,
        timeout: Duration,
    ) -> ChatResult<Versioned<Channel>> {
        Ok(self.channels.wait_for_next_version(channel, known, timeout).await?)
    }

    // ── internals ───────────────────────────────────────────────────

    fn waiters(&self) -> Waiters {
        Waiters {
            accounts: self.accounts.waiter().clone(),
            channels: self.channels.waiter().clone(),
            events: self.events.waiter().clone(),
        }
    }

    /// Run `f` as one transaction across all chat tables. Waiters hear about
    /// the writes `f` announces once the transaction has committed; nothing
    /// is written or announced if `f` fails.
    async fn atomically<F, R>(&self, f: F) -> ChatResult<R>
    where
        F: FnOnce(&Transaction<'_>, &mut Announcements) -> ChatResult<R> + Send + 'static,
        R: Send + 'static,
    {
        self.channels
            .database()
            .transaction_then(
                move |tx| {
                    let mut news = Announcements::default();
                    let value = f(tx, &mut news)?;
                    Ok::<_, ChatError>((value, news))
                },
                |(value, news): (R, Announcements)| {
                    news.publish();
                    value
                },
            )
            .await
    }

    async fn find_user(&self, name: &UserName) -> ChatResult<Option<Versioned<User>>> {
        Ok(self
            .users
            .find_by("SELECT id FROM users WHERE name = ?1", name.to_string())
            .await?)
    }

    async fn account_of_user(&self, user: Uuid) -> ChatResult<Option<Versioned<Account>>> {
        Ok(self
            .accounts
            .find_by("SELECT id FROM accounts WHERE user = ?1", user.to_string())
            .await?)
    }
}

// ── transaction steps ───────────────────────────────────────────────

fn require<T: Table>(conn: &Connection, id: Uuid) -> ChatResult<Versioned<T>> {
    load_record::<T>(conn, id)?.ok_or(ChatError::NotFound {
        entity: T::ENTITY,
        id,
    })
}

/// Make `account` a member of `channel` with `role` and post its join
/// event. Existing members are left as they are.
fn stage_join(
    tx: &Transaction<'_>,
    news: &mut Announcements,
    waiters: &Waiters,
    account: Uuid,
    channel: Versioned<Channel>,
    role: Role,
) -> ChatResult<Versioned<Channel>> {
    let id = channel.identity();
    let member = require::<Account>(tx, account)?;
    if member.value().membership(id).is_some() {
        return Ok(channel);
    }
    let alias = require::<User>(tx, member.value().user)?.into_value().name.to_string();

    let joined = stage_update(tx, &member, member.value().with_membership(&alias, id, role))?;
    news.updated(&waiters.accounts, &joined);
    let join = stage_insert(tx, Event::join(id, alias))?;
    let updated = stage_update(tx, &channel, channel.value().with_event(join.identity()))?;
    news.updated(&waiters.channels, &updated);
    Ok(updated)
}

/// Alias and role of `account` in `channel`.
fn membership_in(conn: &Connection, account: Uuid, channel: Uuid) -> ChatResult<(String, Role)> {
    require::<Account>(conn, account)?
        .value()
        .membership(channel)
        .map(|m| (m.alias.clone(), m.role))
        .ok_or_else(|| ChatError::Forbidden("not a member of this channel".into()))
}

fn event_in(conn: &Connection, channel: Uuid, event: Uuid) -> ChatResult<Versioned<Event>> {
    let found = require::<Event>(conn, event)?;
    if found.value().channel != channel {
        return Err(ChatError::NotFound {
            entity: Event::ENTITY,
            id: event,
        });
    }
    Ok(found)
}

fn authorize_event_change(conn: &Connection, account: Uuid, event: &Versioned<Event>) -> ChatResult<()> {
    let (alias, role) = membership_in(conn, account, event.value().channel)?;
    let allowed = role >= Role::Moderator || (role >= Role::Participant && alias == event.value().sender);
    if allowed {
        Ok(())
    } else {
        Err(ChatError::Forbidden("cannot change this event".into()))
    }
}

fn owners_in(conn: &Connection, channel: Uuid) -> StoreResult<i64> {
    Ok(conn.query_row(
        "SELECT count(*) FROM account_channels WHERE channel = ?1 AND role = 'owner'",
        [channel.to_string()],
        |row| row.get(0),
    )?)
}

fn duplicate_user(name: &UserName) -> ChatError {
    ChatError::Duplicate {
        entity: User::ENTITY,
        name: name.to_string(),
    }
}

fn duplicate_channel(name: &str) -> ChatError {
    ChatError::Duplicate {
        entity: Channel::ENTITY,
        name: name.to_string(),
    }
}

fn validate_message(content: &str) -> ChatResult<()> {
    if content.trim().is_empty() {
        return Err(ChatError::Validation("message is empty".into()));
    }
    if content.chars().count() > MESSAGE_MAX {
        return Err(ChatError::Validation(format!(
            "message exceeds {MESSAGE_MAX} characters"
        )));
    }
    Ok(())
}
