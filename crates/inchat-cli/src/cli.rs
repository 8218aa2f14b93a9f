//! CLI argument definitions for inchat.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use inchat_store::Role;
use uuid::Uuid;

/// inchat -- versioned chat storage from the command line.
#[derive(Parser)]
#[command(
    name = "inchat",
    version,
    about = "inchat -- chat accounts, channels and messages",
    long_about = "Registers users, manages channels and posts messages against an inchat \
                  SQLite database. Every record is printed as JSON together with its \
                  identity and version."
)]
pub struct Cli {
    /// Configuration file (TOML, or JSON by extension).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Database file; overrides the configuration.
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a user and print its first session.
    Register {
        username: String,
        #[arg(long, short)]
        password: String,
    },

    /// Log in and print the new session, or why it was refused.
    Login {
        username: String,
        #[arg(long, short)]
        password: String,
    },

    /// End a session.
    Logout {
        /// Session identity.
        session: Uuid,
    },

    /// Create a channel owned by the session's account.
    CreateChannel {
        name: String,
        #[arg(long, short)]
        session: Uuid,
    },

    /// Join an existing channel.
    Join {
        /// Channel name or identity.
        channel: String,
        #[arg(long, short)]
        session: Uuid,
        /// Role to join with (banned, observer or participant).
        #[arg(long, default_value = "participant")]
        role: Role,
    },

    /// Post a message to a channel.
    Post {
        /// Channel name or identity.
        channel: String,
        message: String,
        #[arg(long, short)]
        session: Uuid,
    },

    /// Replace the text of a message.
    Edit {
        /// Channel name or identity.
        channel: String,
        event: Uuid,
        message: String,
        #[arg(long, short)]
        session: Uuid,
    },

    /// Remove an event from a channel.
    DeleteEvent {
        /// Channel name or identity.
        channel: String,
        event: Uuid,
        #[arg(long, short)]
        session: Uuid,
    },

    /// Change a member's role (owners only).
    SetRole {
        /// Channel name or identity.
        channel: String,
        username: String,
        role: Role,
        #[arg(long, short)]
        session: Uuid,
    },

    /// Print a channel with its events.
    Show {
        /// Channel name or identity.
        channel: String,
    },

    /// Block until the channel has a version other than `--known`.
    Wait {
        /// Channel name or identity.
        channel: String,
        /// Last version the caller has seen.
        #[arg(long)]
        known: Uuid,
        /// Seconds to wait; defaults to the configured timeout.
        #[arg(long)]
        timeout: Option<u64>,
    },
}
