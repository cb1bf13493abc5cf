//! Configuration loader and validator for the transaction notification bot.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub telegram: Telegram,
    pub provider: Provider,
    pub categorizer: Categorizer,
}

/// Scheduler and delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// How often the scheduler looks for due users.
    pub tick_interval_ms: u64,
    /// Days re-read before the last processed window end.
    pub lookback_days: i64,
    /// Days fetched on a user's first poll.
    pub initial_lookback_days: i64,
    /// Attempts per external call before giving up.
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_seconds: u64,
    pub call_timeout_seconds: u64,
    pub default_poll_interval_secs: i64,
}

/// Telegram bot settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Telegram {
    pub bot_token: String,
}

/// Finance provider API settings. Tokens are stored per user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Provider {
    pub base_url: String,
}

/// OpenAI-compatible chat completions endpoint used for category suggestions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Categorizer {
    pub enabled: bool,
    pub base_url: String,
    pub model: String,
    #[serde(default)]
    pub api_key: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.app.max_attempts,
            base_delay: Duration::from_millis(self.app.base_backoff_ms),
            max_delay: Duration::from_secs(self.app.max_backoff_seconds),
            call_timeout: Duration::from_secs(self.app.call_timeout_seconds),
        }
    }

    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/txwatch.db", self.app.resolved_data_dir()))
    }
}

impl App {
    /// `data_dir` with a leading `~/` expanded to `$HOME`.
    pub fn resolved_data_dir(&self) -> String {
        match self.data_dir.strip_prefix("~/") {
            Some(rest) => match std::env::var("HOME") {
                Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
                Err(_) => self.data_dir.clone(),
            },
            None => self.data_dir.clone(),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.tick_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.tick_interval_ms must be > 0"));
    }
    if cfg.app.lookback_days < 0 || cfg.app.initial_lookback_days < 0 {
        return Err(ConfigError::Invalid("app lookback days must be >= 0"));
    }
    if cfg.app.max_attempts == 0 {
        return Err(ConfigError::Invalid("app.max_attempts must be > 0"));
    }
    if cfg.app.call_timeout_seconds == 0 {
        return Err(ConfigError::Invalid("app.call_timeout_seconds must be > 0"));
    }
    if cfg.app.default_poll_interval_secs <= 0 {
        return Err(ConfigError::Invalid(
            "app.default_poll_interval_secs must be > 0",
        ));
    }

    if cfg.telegram.bot_token.trim().is_empty() {
        return Err(ConfigError::Invalid("telegram.bot_token must be non-empty"));
    }

    if cfg.provider.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("provider.base_url must be non-empty"));
    }

    if cfg.categorizer.enabled {
        if cfg.categorizer.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "categorizer.base_url must be non-empty when enabled",
            ));
        }
        if cfg.categorizer.model.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "categorizer.model must be non-empty when enabled",
            ));
        }
    }

    Ok(())
}

/// Returns the canonical example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  tick_interval_ms: 60000
  lookback_days: 15
  initial_lookback_days: 15
  max_attempts: 3
  base_backoff_ms: 500
  max_backoff_seconds: 30
  call_timeout_seconds: 20
  default_poll_interval_secs: 3600

telegram:
  bot_token: "YOUR_TELEGRAM_BOT_TOKEN"

provider:
  base_url: "https://dev.lunchmoney.app/"

categorizer:
  enabled: true
  base_url: "https://api.deepinfra.com/v1/openai"
  model: "meta-llama/Llama-4-Scout-17B-16E-Instruct"
  api_key: "YOUR_CATEGORIZER_API_KEY"
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.retry_policy().max_attempts, 3);
        assert_eq!(cfg.app.tick_interval(), Duration::from_secs(60));
    }

    #[test]
    fn invalid_bot_token() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.telegram.bot_token = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("telegram.bot_token")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_app_bounds() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.max_attempts = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.tick_interval_ms = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.call_timeout_seconds = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn categorizer_checked_only_when_enabled() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.categorizer.model = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("categorizer.model")),
            _ => panic!("wrong error"),
        }

        cfg.categorizer.enabled = false;
        validate(&cfg).unwrap();
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.provider.base_url, "https://dev.lunchmoney.app/");
    }
}
