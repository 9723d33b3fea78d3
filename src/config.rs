//! Configuration loading and validation.
//!
//! Everything comes from one TOML file, with a handful of environment
//! overrides for secrets so tokens can stay out of the config on disk.
//! Validation is fail-fast: a config the process cannot act on is a fatal
//! startup error, never a degraded run.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::credentials::CredentialMaterial;
use crate::diff::DiffConfig;
use crate::fetcher::FetcherConfig;
use crate::scheduler::SchedulerConfig;
use crate::types::{MonitorKind, Target};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("target '{username}' has weight 0; weights must be at least 1")]
    InvalidWeight { username: String },
    #[error("duplicate target '{username}'")]
    DuplicateTarget { username: String },
    #[error("no targets configured")]
    NoTargets,
    #[error("no credentials configured")]
    NoCredentials,
    #[error("credential '{label}' has an empty auth_token or ct0")]
    EmptyCredential { label: String },
    #[error("telegram bot_token is empty (set it in config or BIRDWATCH_BOT_TOKEN)")]
    EmptyBotToken,
}

fn default_tick_interval_secs() -> u64 {
    60
}
fn default_fetch_timeout_secs() -> u64 {
    30
}
fn default_max_deferred_ticks() -> u32 {
    5
}
fn default_error_suspend_threshold() -> u32 {
    3
}
fn default_max_backoff_secs() -> u64 {
    3600
}
fn default_cold_start_stagger_ms() -> u64 {
    250
}
fn default_auth_failure_threshold() -> u32 {
    3
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_weight() -> u32 {
    1
}
fn default_removal_confirmation_polls() -> u32 {
    2
}
fn default_tweet_freshness_secs() -> i64 {
    300
}
fn default_telegram_rate_limit() -> u32 {
    20
}
fn default_health_buffer() -> usize {
    256
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_max_deferred_ticks")]
    pub max_deferred_ticks: u32,
    #[serde(default = "default_error_suspend_threshold")]
    pub error_suspend_threshold: u32,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_cold_start_stagger_ms")]
    pub cold_start_stagger_ms: u64,
    #[serde(default = "default_removal_confirmation_polls")]
    pub removal_confirmation_polls: u32,
    #[serde(default = "default_tweet_freshness_secs")]
    pub tweet_freshness_secs: i64,
    #[serde(default = "default_auth_failure_threshold")]
    pub auth_failure_threshold: u32,
    #[serde(default = "default_health_buffer")]
    pub health_event_buffer: usize,
    /// Snapshot database path; omit to run purely in memory.
    #[serde(default)]
    pub database_path: Option<String>,
    /// Where the scheduler persists its state on graceful shutdown.
    #[serde(default)]
    pub schedule_state_path: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub api: ApiConfig,
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
    #[serde(default)]
    pub credentials: Vec<CredentialConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub rate_limit_per_minute: u32,
    pub tweet_window: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        let f = FetcherConfig::default();
        Self {
            base_url: f.base_url,
            timeout_secs: f.timeout_secs,
            rate_limit_per_minute: f.rate_limit_per_minute,
            tweet_window: f.tweet_window,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    /// Chat that receives health alerts and control commands.
    pub maintainer_chat_id: i64,
    /// Require the maintainer to send the startup token before polling begins.
    #[serde(default)]
    pub require_startup_ack: bool,
    #[serde(default)]
    pub daily_summary: bool,
    #[serde(default = "default_telegram_rate_limit")]
    pub rate_limit_per_minute: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub username: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Monitor kinds beyond profile, which is always on.
    #[serde(default)]
    pub kinds: Vec<MonitorKind>,
    /// Defaults to the maintainer chat when omitted.
    #[serde(default)]
    pub chat_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CredentialConfig {
    pub label: String,
    pub auth_token: String,
    pub ct0: String,
}

impl AppConfig {
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        // No logging here: the subscriber is not installed until after the
        // config (and its log level) has been read.
        let mut config: AppConfig = toml::from_str(&contents)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var("BIRDWATCH_BOT_TOKEN") {
            if !token.is_empty() {
                self.telegram.bot_token = token;
            }
        }
        if let Ok(path) = std::env::var("BIRDWATCH_DATABASE_PATH") {
            if !path.is_empty() {
                self.database_path = Some(path);
            }
        }
        if let Ok(level) = std::env::var("BIRDWATCH_LOG_LEVEL") {
            if !level.is_empty() {
                self.log_level = level;
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.targets.is_empty() {
            return Err(ConfigError::NoTargets);
        }
        let mut seen = std::collections::HashSet::new();
        for target in &self.targets {
            if target.weight == 0 {
                return Err(ConfigError::InvalidWeight {
                    username: target.username.clone(),
                });
            }
            if !seen.insert(target.username.to_lowercase()) {
                return Err(ConfigError::DuplicateTarget {
                    username: target.username.clone(),
                });
            }
        }
        if self.credentials.is_empty() {
            return Err(ConfigError::NoCredentials);
        }
        for credential in &self.credentials {
            if credential.auth_token.is_empty() || credential.ct0.is_empty() {
                return Err(ConfigError::EmptyCredential {
                    label: credential.label.clone(),
                });
            }
        }
        if self.telegram.bot_token.is_empty() {
            return Err(ConfigError::EmptyBotToken);
        }
        Ok(())
    }

    pub fn targets(&self) -> Vec<Target> {
        self.targets
            .iter()
            .map(|t| {
                Target::new(
                    t.username.clone(),
                    t.kinds.iter().copied(),
                    t.weight,
                    t.chat_id.unwrap_or(self.telegram.maintainer_chat_id),
                )
            })
            .collect()
    }

    pub fn credential_materials(&self) -> Vec<CredentialMaterial> {
        self.credentials
            .iter()
            .map(|c| CredentialMaterial {
                label: c.label.clone(),
                auth_token: c.auth_token.clone(),
                ct0: c.ct0.clone(),
            })
            .collect()
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick_interval_secs: self.tick_interval_secs,
            fetch_timeout_secs: self.fetch_timeout_secs,
            max_deferred_ticks: self.max_deferred_ticks,
            error_suspend_threshold: self.error_suspend_threshold,
            max_backoff_secs: self.max_backoff_secs,
            cold_start_stagger_ms: self.cold_start_stagger_ms,
            state_path: self.schedule_state_path.clone(),
        }
    }

    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            base_url: self.api.base_url.clone(),
            timeout_secs: self.api.timeout_secs,
            rate_limit_per_minute: self.api.rate_limit_per_minute,
            tweet_window: self.api.tweet_window,
        }
    }

    pub fn diff_config(&self) -> DiffConfig {
        DiffConfig {
            removal_confirmation_polls: self.removal_confirmation_polls,
            tweet_freshness_secs: self.tweet_freshness_secs,
        }
    }
}

/// Install the global tracing subscriber. `RUST_LOG` wins over the config
/// level when set.
pub fn init_logging(log_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
