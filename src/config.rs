//! Runtime Configuration (C7, ambient): wires adapters and the state store
//! into one `RuntimeConfig` the rest of the kernel depends on, resolved from
//! environment variables first and a TOML overlay second, mirroring the
//! env-var-first resolution the teacher's own `Config::load` used.

use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::adapter::Adapter;
use crate::adapters::{DiscordAdapter, GitHubAdapter, GoogleChatAdapter, LinearAdapter, SlackAdapter, TeamsAdapter};
use crate::dispatcher::{DEFAULT_DEDUPE_TTL, DEFAULT_LEASE_TTL};
use crate::error::{ConfigError, Result};
use crate::state::{InMemoryStateStore, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Silent,
}

impl LogLevel {
    /// An `EnvFilter` directive string for this level, honored only when
    /// `RUST_LOG` itself is unset.
    pub fn as_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Silent => "off",
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

/// Runtime configuration assembled once at process start and shared behind
/// an `Arc` by everything downstream: the HTTP webhook surface, the
/// dispatcher, and any handlers that need to enumerate adapters.
pub struct RuntimeConfig {
    pub user_name: String,
    pub adapters: HashMap<String, Arc<dyn Adapter>>,
    pub state: Arc<dyn StateStore>,
    pub log_level: LogLevel,
    pub dedupe_ttl: Duration,
    pub lease_ttl: Duration,
}

/// The subset of `RuntimeConfig` expressible as TOML, for overlaying onto
/// environment-derived defaults. Adapter credentials always come from the
/// environment — see module docs — so this overlay is limited to the
/// ambient knobs: log level and the dedup/lease TTLs.
#[derive(Debug, Default, Deserialize)]
struct FileOverlay {
    user_name: Option<String>,
    log_level: Option<LogLevel>,
    dedupe_ttl_secs: Option<u64>,
    lease_ttl_secs: Option<u64>,
}

impl RuntimeConfig {
    /// Builds a `RuntimeConfig` from environment variables, constructing one
    /// adapter per platform whose credentials are present. A platform with
    /// no credentials set is silently omitted rather than treated as an
    /// error — operators may run with any subset of the six.
    pub fn from_env() -> Result<Self> {
        let user_name = env::var("BOT_USER_NAME").unwrap_or_else(|_| "bot".to_string());
        let mut adapters: HashMap<String, Arc<dyn Adapter>> = HashMap::new();

        if let (Ok(token), Ok(secret)) = (env::var("SLACK_BOT_TOKEN"), env::var("SLACK_SIGNING_SECRET")) {
            let mut adapter = SlackAdapter::new(token, secret, user_name.clone());
            if let Ok(id) = env::var("SLACK_BOT_USER_ID") {
                adapter = adapter.with_bot_user_id(id);
            }
            adapters.insert("slack".to_string(), Arc::new(adapter));
        }

        if let (Ok(app_id), Ok(password)) = (env::var("TEAMS_APP_ID"), env::var("TEAMS_APP_PASSWORD")) {
            let adapter = TeamsAdapter::new(app_id, password, user_name.clone());
            adapters.insert("teams".to_string(), Arc::new(adapter));
        }

        if let Ok(token) = env::var("GCHAT_SERVICE_ACCOUNT_TOKEN") {
            let adapter = GoogleChatAdapter::new(token, user_name.clone());
            adapters.insert("gchat".to_string(), Arc::new(adapter));
        }

        if let (Ok(token), Ok(public_key)) = (env::var("DISCORD_BOT_TOKEN"), env::var("DISCORD_PUBLIC_KEY")) {
            let mut adapter = DiscordAdapter::new(token, &public_key, user_name.clone())?;
            if let Ok(id) = env::var("DISCORD_BOT_USER_ID") {
                adapter = adapter.with_bot_user_id(id);
            }
            adapters.insert("discord".to_string(), Arc::new(adapter));
        }

        if let (Ok(token), Ok(secret)) = (env::var("GITHUB_TOKEN"), env::var("GITHUB_WEBHOOK_SECRET")) {
            let mut adapter = GitHubAdapter::new(token, secret, user_name.clone());
            if let Ok(id) = env::var("GITHUB_BOT_USER_ID") {
                adapter = adapter.with_bot_user_id(id);
            }
            adapters.insert("github".to_string(), Arc::new(adapter));
        }

        if let (Ok(api_key), Ok(secret)) = (env::var("LINEAR_API_KEY"), env::var("LINEAR_WEBHOOK_SECRET")) {
            let mut adapter = LinearAdapter::new(api_key, secret, user_name.clone());
            if let Ok(id) = env::var("LINEAR_BOT_USER_ID") {
                adapter = adapter.with_bot_user_id(id);
            }
            adapters.insert("linear".to_string(), Arc::new(adapter));
        }

        if adapters.is_empty() {
            return Err(ConfigError::MissingKey(
                "no adapter credentials found in the environment (checked SLACK_*, TEAMS_*, GCHAT_*, DISCORD_*, GITHUB_*, LINEAR_*)".into(),
            )
            .into());
        }

        let log_level = match env::var("LOG_LEVEL").ok().as_deref() {
            Some("debug") => LogLevel::Debug,
            Some("info") => LogLevel::Info,
            Some("warn") => LogLevel::Warn,
            Some("error") => LogLevel::Error,
            Some("silent") => LogLevel::Silent,
            _ => LogLevel::default(),
        };

        Ok(Self {
            user_name,
            adapters,
            state: Arc::new(InMemoryStateStore::new()),
            log_level,
            dedupe_ttl: DEFAULT_DEDUPE_TTL,
            lease_ttl: DEFAULT_LEASE_TTL,
        })
    }

    /// Overlays a TOML file's ambient settings (log level, TTLs, display
    /// name) onto a config already built by `from_env`. Adapter credentials
    /// are never read from file — see module docs.
    pub fn apply_file_overlay(mut self, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Load {
            path: path.display().to_string(),
            source,
        })?;
        let overlay: FileOverlay = toml::from_str(&contents).map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if let Some(user_name) = overlay.user_name {
            self.user_name = user_name;
        }
        if let Some(log_level) = overlay.log_level {
            self.log_level = log_level;
        }
        if let Some(secs) = overlay.dedupe_ttl_secs {
            self.dedupe_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = overlay.lease_ttl_secs {
            self.lease_ttl = Duration::from_secs(secs);
        }
        Ok(self)
    }

    /// Convenience combining `from_env` with an optional overlay file at the
    /// platform config directory (`~/.config/chatkernel/config.toml` on
    /// Linux), silently skipped when absent.
    pub fn from_file() -> Result<Self> {
        let base = Self::from_env()?;
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(base);
        };
        let path = config_dir.join("chatkernel").join("config.toml");
        if path.exists() {
            base.apply_file_overlay(path)
        } else {
            Ok(base)
        }
    }
}
