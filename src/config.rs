use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::actor::retry::BackoffPolicy;
use crate::constants::{
    CLOCK_SKEW_TOLERANCE_MINS, DEFAULT_WATERMARK_WINDOW_MINS, IDLE_TIMEOUT_SECS,
    IMAP_AUTH_TIMEOUT_MS, INBOX_LABEL, MAX_RETRY_DELAY_SECS, TRASH_LABEL,
    WATCH_RETRY_DELAY_SECS,
};
use crate::mail::MailError;

const ENV_STORE_URL: &str = "PB_HOST";
const ENV_STORE_EMAIL: &str = "PB_EMAIL";
const ENV_ACCOUNT_EMAIL: &str = "INBOXD_EMAIL";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub account: AccountConfig,
    #[serde(default)]
    pub imap: ImapConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub watch: WatchConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Mailbox login, also the key under which the app password is stored
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapConfig {
    #[serde(default = "default_imap_server")]
    pub server: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,
    /// Remote mailbox watched for new mail
    #[serde(default = "default_inbox")]
    pub inbox: String,
    /// Remote folder that receives soft-deleted messages
    #[serde(default = "default_trash_folder")]
    pub trash_folder: String,
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            server: default_imap_server(),
            port: default_imap_port(),
            auth_timeout_ms: default_auth_timeout_ms(),
            inbox: default_inbox(),
            trash_folder: default_trash_folder(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Base URL of the PocketBase instance, e.g. `http://127.0.0.1:8090`
    #[serde(default)]
    pub url: String,
    /// Superuser identity used to authenticate against the store
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default)]
    pub backoff: BackoffKind,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_max_retry_delay_secs")]
    pub max_retry_delay_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Search window when nothing has been mirrored yet
    #[serde(default = "default_window_mins")]
    pub default_window_mins: i64,
    #[serde(default = "default_clock_skew_mins")]
    pub clock_skew_tolerance_mins: i64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffKind::default(),
            retry_delay_secs: default_retry_delay_secs(),
            max_retry_delay_secs: default_max_retry_delay_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            default_window_mins: default_window_mins(),
            clock_skew_tolerance_mins: default_clock_skew_mins(),
        }
    }
}

impl WatchConfig {
    pub fn backoff_policy(&self) -> BackoffPolicy {
        let delay = Duration::from_secs(self.retry_delay_secs);
        match self.backoff {
            BackoffKind::Fixed => BackoffPolicy::fixed(delay),
            BackoffKind::Exponential => {
                BackoffPolicy::exponential(delay, Duration::from_secs(self.max_retry_delay_secs))
            }
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn default_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.default_window_mins)
    }

    pub fn clock_skew_tolerance(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.clock_skew_tolerance_mins)
    }
}

fn default_imap_server() -> String {
    "imap.gmail.com".to_string()
}

fn default_imap_port() -> u16 {
    993
}

fn default_auth_timeout_ms() -> u64 {
    IMAP_AUTH_TIMEOUT_MS
}

fn default_inbox() -> String {
    INBOX_LABEL.to_string()
}

fn default_trash_folder() -> String {
    TRASH_LABEL.to_string()
}

fn default_retry_delay_secs() -> u64 {
    WATCH_RETRY_DELAY_SECS
}

fn default_max_retry_delay_secs() -> u64 {
    MAX_RETRY_DELAY_SECS
}

fn default_idle_timeout_secs() -> u64 {
    IDLE_TIMEOUT_SECS
}

fn default_window_mins() -> i64 {
    DEFAULT_WATERMARK_WINDOW_MINS
}

fn default_clock_skew_mins() -> i64 {
    CLOCK_SKEW_TOLERANCE_MINS
}

impl Config {
    pub fn config_dir() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .context("Could not find config directory")?
            .join("inboxd");
        Ok(dir)
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load the config file (if present) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        let mut config = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::parse(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            tracing::debug!("No config file at {}, using defaults", path.display());
            Config::default()
        };

        config.apply_overrides(|key| env::var(key).ok());
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply overrides from a variable lookup (the process environment in production).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_STORE_URL) {
            self.store.url = url;
        }
        if let Some(email) = lookup(ENV_STORE_EMAIL) {
            self.store.email = email;
        }
        if let Some(email) = lookup(ENV_ACCOUNT_EMAIL) {
            self.account.email = email;
        }
    }

    /// Check the settings needed to reach the record store.
    pub fn validate_store(&self) -> Result<(), MailError> {
        let mut missing = Vec::new();
        if self.store.url.trim().is_empty() {
            missing.push(ENV_STORE_URL);
        }
        if self.store.email.trim().is_empty() {
            missing.push(ENV_STORE_EMAIL);
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(MailError::Configuration(format!(
                "record store settings missing: {}",
                missing.join(", ")
            )))
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        let dir = Self::config_dir()?;

        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }
}
