//! NudgeClaw configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{NudgeClawError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NudgeClawConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub nudge: NudgeConfig,
    #[serde(default)]
    pub daily_check: DailyCheckConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
}

impl NudgeClawConfig {
    /// Load config from the default path (~/.nudgeclaw/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| NudgeClawError::Config(format!("Failed to read config: {e}")))?;
        Self::parse(&content)
    }

    /// Parse config from TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| NudgeClawError::Config(format!("Failed to parse config: {e}")))
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| NudgeClawError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Apply environment overrides for secrets that should not live in the file.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(secret) = std::env::var("NUDGECLAW_TRIGGER_SECRET") {
            self.gateway.trigger_secret = secret;
        }
        if let Ok(token) = std::env::var("NUDGECLAW_TELEGRAM_BOT_TOKEN") {
            self.channels.telegram_bot_token = token;
        }
        if self.generator.api_key.is_empty() {
            if let Ok(key) = std::env::var("OPENAI_API_KEY") {
                self.generator.api_key = key;
            }
        }
        self
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the NudgeClaw home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".nudgeclaw")
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.nudgeclaw/scheduler.db".into() }

impl DatabaseConfig {
    /// Database path with `~` expanded.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

/// Retry strategy applied when a handler fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Release the lease and retry on the very next cycle.
    #[default]
    Immediate,
    /// Push `next_run_at` out exponentially with each consecutive failure.
    Backoff,
}

/// Dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
    /// Tick period of the built-in loop; 0 disables it (external trigger only).
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    #[serde(default)]
    pub retry: RetryStrategy,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_lease_ms() -> u64 { 5 * 60 * 1000 }
fn default_max_batch() -> usize { 50 }
fn default_tick_secs() -> u64 { 60 }
fn default_backoff_base_ms() -> u64 { 60 * 1000 }
fn default_backoff_max_ms() -> u64 { 6 * 60 * 60 * 1000 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lease_ms: default_lease_ms(),
            max_batch: default_max_batch(),
            tick_secs: default_tick_secs(),
            retry: RetryStrategy::default(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

/// Nudge escalation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NudgeConfig {
    /// Ascending hour thresholds for levels 1..=5.
    #[serde(default = "default_thresholds")]
    pub thresholds_hours: Vec<f64>,
    #[serde(default = "default_locale")]
    pub default_locale: String,
    /// Stop nudging after this many unanswered nudges (None = never stop).
    #[serde(default)]
    pub max_consecutive_nudges: Option<u32>,
    /// From this level on, ask the message generator instead of the template pool.
    #[serde(default)]
    pub generate_from_level: Option<u8>,
    #[serde(default = "default_nudge_interval_ms")]
    pub nudge_interval_ms: u64,
}

fn default_thresholds() -> Vec<f64> { vec![2.0, 6.0, 12.0, 24.0, 48.0] }
fn default_locale() -> String { "en".into() }
fn default_nudge_interval_ms() -> u64 { 60 * 60 * 1000 }

impl Default for NudgeConfig {
    fn default() -> Self {
        Self {
            thresholds_hours: default_thresholds(),
            default_locale: default_locale(),
            max_consecutive_nudges: None,
            generate_from_level: None,
            nudge_interval_ms: default_nudge_interval_ms(),
        }
    }
}

/// Daily check-in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyCheckConfig {
    #[serde(default = "default_daily_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_prompt_hint")]
    pub prompt_hint: String,
}

fn default_daily_interval_ms() -> u64 { 24 * 60 * 60 * 1000 }
fn default_prompt_hint() -> String {
    "Write a short, warm daily check-in asking how the user's day is going.".into()
}

impl Default for DailyCheckConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_daily_interval_ms(),
            prompt_hint: default_prompt_hint(),
        }
    }
}

/// Gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Shared secret expected in `X-Trigger-Secret`; empty disables the check.
    #[serde(default)]
    pub trigger_secret: String,
}

fn default_port() -> u16 { 3000 }
fn default_host() -> String { "127.0.0.1".into() }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            trigger_secret: String::new(),
        }
    }
}

/// OpenAI-compatible message generator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String { "https://api.openai.com/v1".into() }
fn default_model() -> String { "gpt-4o-mini".into() }
fn default_timeout_secs() -> u64 { 30 }

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: String::new(),
            model: default_model(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Delivery channel credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub telegram_bot_token: String,
}
