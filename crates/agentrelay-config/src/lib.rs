//! Environment-variable configuration for agentrelay.
//!
//! The design's §6 fixes configuration to a flat table of environment
//! variables rather than a config file, which diverges from
//! `shipper_config`'s `.shipper.toml`-based loader — but the *shape* is
//! kept: a typed struct with defaults, a single loader function, and
//! validation performed once at construction rather than scattered through
//! call sites.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use agentrelay_retry::RetryStrategyConfig;
use agentrelay_types::ErrorKind;
use anyhow::Result;

/// Which AI coding agent CLI flavor to launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Claude,
    Codex,
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "claude" => Ok(Provider::Claude),
            "codex" => Ok(Provider::Codex),
            other => Err(format!("unknown PROVIDER: {other} (expected claude or codex)")),
        }
    }
}

/// Dispatcher tuning knobs, validated as a group (see [`load`]).
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherConfig {
    pub workers: u32,
    pub queue_size: u32,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl DispatcherConfig {
    /// Converts into the retry strategy the dispatcher's backoff loop
    /// consumes.
    pub fn to_retry_strategy(&self) -> RetryStrategyConfig {
        RetryStrategyConfig {
            strategy: agentrelay_retry::RetryStrategyType::Exponential,
            max_attempts: self.max_attempts,
            base_delay: self.initial_backoff,
            max_delay: self.max_backoff,
            multiplier: self.backoff_multiplier,
            jitter: 0.0,
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_size: 16,
            max_attempts: 3,
            initial_backoff: Duration::from_secs(15),
            max_backoff: Duration::from_secs(300),
            backoff_multiplier: 2.0,
        }
    }
}

/// The fully resolved, validated application configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub port: u16,
    pub github_app_id: String,
    pub github_private_key: String,
    pub github_webhook_secret: String,
    pub github_api_base: String,
    pub provider: Provider,
    pub anthropic_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub codex_model: Option<String>,
    pub claude_model: Option<String>,
    pub trigger_keyword: String,
    pub dispatcher: DispatcherConfig,
}

fn non_empty(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn required(name: &str) -> Result<String> {
    non_empty(name)
        .ok_or_else(|| anyhow::anyhow!(ErrorKind::ConfigInvalid(format!("{name} is required"))))
}

fn parse_env<T: FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match non_empty(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!(ErrorKind::ConfigInvalid(format!("invalid {name}: {e}")))),
    }
}

/// Loads and validates configuration from the process environment.
///
/// Validation rejects zero/negative dispatcher values and
/// `DISPATCHER_RETRY_MAX_SECONDS < DISPATCHER_RETRY_SECONDS`, per the
/// design's §6.
pub fn load() -> Result<AppConfig> {
    let port: u16 = parse_env("PORT", 8000)?;

    let github_app_id = required("GITHUB_APP_ID")?;
    let github_private_key = required("GITHUB_PRIVATE_KEY")?;
    let github_webhook_secret = required("GITHUB_WEBHOOK_SECRET")?;
    let github_api_base = non_empty("GITHUB_API_BASE")
        .unwrap_or_else(|| "https://api.github.com".to_string());

    let provider_raw = non_empty("PROVIDER").unwrap_or_else(|| "claude".to_string());
    let provider: Provider = provider_raw
        .parse()
        .map_err(|e| anyhow::anyhow!(ErrorKind::ConfigInvalid(e)))?;

    let anthropic_api_key = non_empty("ANTHROPIC_API_KEY");
    if provider == Provider::Claude && anthropic_api_key.is_none() {
        return Err(anyhow::anyhow!(ErrorKind::ConfigInvalid(
            "ANTHROPIC_API_KEY is required when PROVIDER=claude".to_string()
        )));
    }

    let openai_api_key = non_empty("OPENAI_API_KEY");
    let openai_base_url = non_empty("OPENAI_BASE_URL");
    let codex_model = non_empty("CODEX_MODEL");
    let claude_model = non_empty("CLAUDE_MODEL");
    let trigger_keyword = non_empty("TRIGGER_KEYWORD").unwrap_or_else(|| "/code".to_string());

    let workers: u32 = parse_env("DISPATCHER_WORKERS", 4)?;
    let queue_size: u32 = parse_env("DISPATCHER_QUEUE_SIZE", 16)?;
    let max_attempts: u32 = parse_env("DISPATCHER_MAX_ATTEMPTS", 3)?;
    let retry_seconds: u64 = parse_env("DISPATCHER_RETRY_SECONDS", 15)?;
    let retry_max_seconds: u64 = parse_env("DISPATCHER_RETRY_MAX_SECONDS", 300)?;
    let backoff_multiplier: f64 = parse_env("DISPATCHER_BACKOFF_MULTIPLIER", 2.0)?;

    if workers == 0 {
        return Err(anyhow::anyhow!(ErrorKind::ConfigInvalid(
            "DISPATCHER_WORKERS must be positive".to_string()
        )));
    }
    if queue_size == 0 {
        return Err(anyhow::anyhow!(ErrorKind::ConfigInvalid(
            "DISPATCHER_QUEUE_SIZE must be positive".to_string()
        )));
    }
    if max_attempts == 0 {
        return Err(anyhow::anyhow!(ErrorKind::ConfigInvalid(
            "DISPATCHER_MAX_ATTEMPTS must be positive".to_string()
        )));
    }
    if retry_seconds == 0 {
        return Err(anyhow::anyhow!(ErrorKind::ConfigInvalid(
            "DISPATCHER_RETRY_SECONDS must be positive".to_string()
        )));
    }
    if backoff_multiplier < 1.0 {
        return Err(anyhow::anyhow!(ErrorKind::ConfigInvalid(
            "DISPATCHER_BACKOFF_MULTIPLIER must be >= 1".to_string()
        )));
    }
    if retry_max_seconds < retry_seconds {
        return Err(anyhow::anyhow!(ErrorKind::ConfigInvalid(
            "DISPATCHER_RETRY_MAX_SECONDS must be >= DISPATCHER_RETRY_SECONDS".to_string()
        )));
    }

    Ok(AppConfig {
        port,
        github_app_id,
        github_private_key,
        github_webhook_secret,
        github_api_base,
        provider,
        anthropic_api_key,
        openai_api_key,
        openai_base_url,
        codex_model,
        claude_model,
        trigger_keyword,
        dispatcher: DispatcherConfig {
            workers,
            queue_size,
            max_attempts,
            initial_backoff: Duration::from_secs(retry_seconds),
            max_backoff: Duration::from_secs(retry_max_seconds),
            backoff_multiplier,
        },
    })
}
