//! CLI entry point for inchat.
//!
//! This binary provides the `inchat` command: each subcommand opens the
//! configured database, performs one chat operation and prints the
//! resulting records as JSON on stdout. Logs go to stderr.

mod cli;

use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use inchat_store::{
    Account, Channel, ChatConfig, ChatService, DEFAULT_CONFIG_PATH, Event, LoginResult, Versioned,
};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::cli::{Cli, Commands};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();
    init_tracing("info");

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let chat = ChatService::open(config)
        .await
        .context("failed to open chat database")?;

    match cli.command {
        Commands::Register { username, password } => cmd_register(&chat, &username, &password).await,
        Commands::Login { username, password } => cmd_login(&chat, &username, &password).await,
        Commands::Logout { session } => cmd_logout(&chat, session).await,
        Commands::CreateChannel { name, session } => cmd_create_channel(&chat, session, &name).await,
        Commands::Join { channel, session, role } => {
            let account = signed_in(&chat, session).await?;
            let channel = resolve_channel(&chat, &channel).await?;
            print_json(&chat.join_channel(&account, channel, role).await?)
        }
        Commands::Post { channel, message, session } => {
            let account = signed_in(&chat, session).await?;
            let channel = resolve_channel(&chat, &channel).await?;
            print_json(&chat.post_message(&account, channel, &message).await?)
        }
        Commands::Edit { channel, event, message, session } => {
            let account = signed_in(&chat, session).await?;
            let channel = resolve_channel(&chat, &channel).await?;
            print_json(&chat.edit_message(&account, channel, event, &message).await?)
        }
        Commands::DeleteEvent { channel, event, session } => {
            let account = signed_in(&chat, session).await?;
            let channel = resolve_channel(&chat, &channel).await?;
            print_json(&chat.delete_event(&account, channel, event).await?)
        }
        Commands::SetRole { channel, username, role, session } => {
            let account = signed_in(&chat, session).await?;
            let channel = resolve_channel(&chat, &channel).await?;
            print_json(&chat.set_role(&account, channel, &username, role).await?)
        }
        Commands::Show { channel } => cmd_show(&chat, &channel).await,
        Commands::Wait { channel, known, timeout } => cmd_wait(&chat, &channel, known, timeout).await,
    }
}

// ---------------------------------------------------------------------------
// Subcommands
// ---------------------------------------------------------------------------

async fn cmd_register(chat: &ChatService, username: &str, password: &str) -> Result<()> {
    let session = chat
        .register(username, password)
        .await
        .with_context(|| format!("failed to register {username}"))?;
    info!(session = %session.identity(), "registered");
    print_json(&session)
}

async fn cmd_login(chat: &ChatService, username: &str, password: &str) -> Result<()> {
    let result = chat.login(username, password).await?;
    print_json(&result)?;
    match result {
        LoginResult::Allowed { .. } => Ok(()),
        LoginResult::Denied { failures } => bail!("wrong password ({failures} consecutive failures)"),
        LoginResult::Blocked { until } => bail!("too many failed logins, try again after {until}"),
    }
}

async fn cmd_logout(chat: &ChatService, session: Uuid) -> Result<()> {
    let current = chat.restore_session(session).await?;
    chat.logout(current).await?;
    info!(%session, "logged out");
    Ok(())
}

async fn cmd_create_channel(chat: &ChatService, session: Uuid, name: &str) -> Result<()> {
    let account = signed_in(chat, session).await?;
    let channel = chat
        .create_channel(&account, name)
        .await
        .with_context(|| format!("failed to create channel {name}"))?;
    print_json(&channel)
}

#[derive(Serialize)]
struct ChannelView<'a> {
    channel: &'a Versioned<Channel>,
    events: &'a [Versioned<Event>],
}

async fn cmd_show(chat: &ChatService, channel: &str) -> Result<()> {
    let id = resolve_channel(chat, channel).await?;
    let current = chat.channel(id).await?;
    let events = chat.events(id).await?;
    print_json(&ChannelView {
        channel: &current,
        events: &events,
    })
}

async fn cmd_wait(chat: &ChatService, channel: &str, known: Uuid, timeout: Option<u64>) -> Result<()> {
    let id = resolve_channel(chat, channel).await?;
    let next = match timeout {
        Some(secs) => {
            chat.wait_next_channel_version_for(id, known, Duration::from_secs(secs))
                .await?
        }
        None => chat.wait_next_channel_version(id, known).await?,
    };
    print_json(&next)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Load configuration, then apply the `--database` override.
fn load_config(cli: &Cli) -> Result<ChatConfig> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.into());
    let mut config = ChatConfig::load(&path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    if let Some(database) = &cli.database {
        config.database_path = database.clone();
    }
    Ok(config)
}

/// The account behind a live session.
async fn signed_in(chat: &ChatService, session: Uuid) -> Result<Versioned<Account>> {
    let session = chat
        .restore_session(session)
        .await
        .context("not signed in")?;
    Ok(chat.account(session.value().account).await?)
}

/// Accept either a channel identity or a channel name.
async fn resolve_channel(chat: &ChatService, channel: &str) -> Result<Uuid> {
    if let Ok(id) = channel.parse::<Uuid>() {
        return Ok(id);
    }
    match chat.channel_by_name(channel).await? {
        Some(found) => Ok(found.identity()),
        None => bail!("no channel named {channel}"),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{out}");
    Ok(())
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}
