//! # inchat-store
//!
//! Persistence layer for the inchat service.
//!
//! Every entity is stored as a [`Versioned<T>`]: a stable identity, an
//! opaque version token and an immutable payload. Writes are optimistic:
//! they name the version they were computed from and are refused with a
//! [`RepoError::Conflict`] carrying the current record when someone else got
//! there first. Clients long-poll for changes through
//! [`Repository::wait_for_next_version`], and logins are guarded by a
//! [`LoginThrottle`].
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  ChatService  (register, login, post, ...)   │
//! ├──────────────────────────────────────────────┤
//! │  update_with / delete_latest  (retry loop)   │
//! │  Repository<T>     VersionWaiter<T>          │
//! │  LoginThrottle     (DashMap, per account)    │
//! ├──────────────────────────────────────────────┤
//! │  SqliteRepository<T: Table> │ MemoryRepo<T>   │
//! │  Database (rusqlite WAL) + migrations        │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use inchat_store::{ChatConfig, ChatService};
//!
//! let chat = ChatService::open(ChatConfig::load("config/inchat.toml")?).await?;
//! let session = chat.register("alice", "Tr0ub4dor&3").await?;
//! let account = chat.account(session.value().account).await?;
//! let channel = chat.create_channel(&account, "general").await?;
//! let next = chat.wait_next_channel_version(channel.identity(), channel.version()).await?;
//! ```

pub mod account;
pub mod channel;
pub mod chat;
pub mod config;
pub mod db;
pub mod error;
pub mod event;
pub mod in_memory;
pub mod migration;
pub mod password;
pub mod record;
pub mod repository;
pub mod session;
pub mod sqlite;
pub mod throttle;
pub mod user;
pub mod waiter;

// ── re-exports ───────────────────────────────────────────────────────

pub use account::{Account, Membership, Role};
pub use channel::Channel;
pub use chat::{ChatError, ChatResult, ChatService, LoginResult};
pub use config::{ChatConfig, DEFAULT_CONFIG_PATH, ThrottleConfig};
pub use db::Database;
pub use error::{RepoError, RepoResult, StoreError, StoreResult};
pub use event::{Event, EventKind};
pub use in_memory::MemoryRepository;
pub use password::{PasswordHash, UserName, validate_password};
pub use record::{Payload, Versioned};
pub use repository::{DEFAULT_UPDATE_ATTEMPTS, Repository, delete_latest, update_with};
pub use session::Session;
pub use sqlite::{SqliteRepository, Table};
pub use throttle::{AttemptState, LoginOutcome, LoginThrottle};
pub use user::User;
pub use waiter::{Change, Subscription, VersionWaiter};
