//! Runtime configuration.
//!
//! Settings are read from a TOML (or JSON, by extension) file, falling back
//! to defaults when the file is missing, and then overridden by `INCHAT_*`
//! environment variables:
//!
//! | Variable | Field |
//! |---|---|
//! | `INCHAT_DATABASE` | `database_path` |
//! | `INCHAT_SESSION_TTL_SECS` | `session_ttl_secs` |
//! | `INCHAT_WAIT_TIMEOUT_SECS` | `wait_timeout_secs` |
//! | `INCHAT_UPDATE_ATTEMPTS` | `update_attempts` |
//! | `INCHAT_PASSWORD_ITERATIONS` | `password_iterations` |
//! | `INCHAT_LOGIN_MAX_FAILURES` | `throttle.max_failures` |
//! | `INCHAT_LOGIN_COOLDOWN_SECS` | `throttle.cooldown_secs` |

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{StoreError, StoreResult};
use crate::password::DEFAULT_ITERATIONS;
use crate::repository::DEFAULT_UPDATE_ATTEMPTS;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/inchat.toml";

/// Top-level settings for the chat store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// SQLite database file.
    pub database_path: PathBuf,
    /// Lifetime of a login session.
    pub session_ttl_secs: u64,
    /// Deadline for long-poll channel waits.
    pub wait_timeout_secs: u64,
    /// Attempts made by the optimistic retry helper before giving up.
    pub update_attempts: u32,
    /// PBKDF2 iterations for newly hashed passwords.
    pub password_iterations: u32,
    /// Brute-force protection for logins.
    pub throttle: ThrottleConfig,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/inchat.db"),
            session_ttl_secs: 60 * 60 * 24,
            wait_timeout_secs: 30,
            update_attempts: DEFAULT_UPDATE_ATTEMPTS,
            password_iterations: DEFAULT_ITERATIONS,
            throttle: ThrottleConfig::default(),
        }
    }
}

/// Login throttling thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Consecutive failures that trigger a lockout.
    pub max_failures: u32,
    /// Length of a lockout; re-armed by every attempt made during it.
    pub cooldown_secs: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_failures: 10,
            cooldown_secs: 10 * 60,
        }
    }
}

impl ThrottleConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl ChatConfig {
    /// Load settings from `path`, then apply environment overrides.
    ///
    /// A missing file is not an error: defaults are used and a warning is
    /// logged. A file that exists but fails to parse is an error.
    pub fn load(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .map_err(|e| StoreError::Config(format!("failed to read {}: {e}", path.display())))?;
            let parsed = if path.extension().and_then(|s| s.to_str()) == Some("json") {
                serde_json::from_str(&content)?
            } else {
                Self::from_toml_str(&content)?
            };
            info!(path = %path.display(), "configuration loaded from file");
            parsed
        } else {
            warn!(path = %path.display(), "configuration file does not exist, using defaults");
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Parse settings from a TOML document. Absent keys keep their defaults.
    pub fn from_toml_str(content: &str) -> StoreResult<Self> {
        toml::from_str(content).map_err(|e| StoreError::Config(format!("invalid TOML: {e}")))
    }

    /// Apply `INCHAT_*` overrides looked up through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> StoreResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("INCHAT_DATABASE") {
            self.database_path = PathBuf::from(path);
        }
        override_with(&lookup, "INCHAT_SESSION_TTL_SECS", &mut self.session_ttl_secs)?;
        override_with(&lookup, "INCHAT_WAIT_TIMEOUT_SECS", &mut self.wait_timeout_secs)?;
        override_with(&lookup, "INCHAT_UPDATE_ATTEMPTS", &mut self.update_attempts)?;
        override_with(&lookup, "INCHAT_PASSWORD_ITERATIONS", &mut self.password_iterations)?;
        override_with(&lookup, "INCHAT_LOGIN_MAX_FAILURES", &mut self.throttle.max_failures)?;
        override_with(&lookup, "INCHAT_LOGIN_COOLDOWN_SECS", &mut self.throttle.cooldown_secs)?;
        Ok(())
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }
}

fn override_with<F, V>(lookup: &F, key: &str, slot: &mut V) -> StoreResult<()>
where
    F: Fn(&str) -> Option<String>,
    V: FromStr,
    V::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|e| StoreError::Config(format!("{key}={raw}: {e}")))?;
    }
    Ok(())
}
