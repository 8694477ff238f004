//! Backoff strategies and non-retryable error classification.
//!
//! Grounded on the teacher's `shipper::retry` module: the same
//! strategy-enum-plus-config shape, the same exponential-with-jitter math,
//! generalized so the dispatcher's `BackoffMultiplier` is a runtime value
//! instead of a hardcoded `2`. The classification routine mirrors
//! `shipper::engine::classify_cargo_failure`'s substring-matching technique,
//! applied to agent subprocess output instead of cargo output.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which backoff curve to apply between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategyType {
    Immediate,
    #[default]
    Exponential,
    Linear,
    Constant,
}

fn default_multiplier() -> f64 {
    2.0
}

/// Fully-resolved backoff parameters, validated at construction by the
/// dispatcher's config loader (see `agentrelay-config`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryStrategyConfig {
    #[serde(default)]
    pub strategy: RetryStrategyType,
    pub max_attempts: u32,
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Fraction of the computed delay to randomize, in `[0.0, 1.0]`.
    #[serde(default)]
    pub jitter: f64,
}

impl Default for RetryStrategyConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategyType::Exponential,
            max_attempts: 3,
            base_delay: Duration::from_secs(15),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Helper {
        Human(String),
        Millis(u64),
    }

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        match Helper::deserialize(d)? {
            Helper::Millis(ms) => Ok(Duration::from_millis(ms)),
            Helper::Human(s) => humantime::parse_duration(&s).map_err(serde::de::Error::custom),
        }
    }
}

/// Computes the delay before the given 1-based `attempt`, capped at
/// `config.max_delay` and without jitter applied (see [`apply_jitter`]).
pub fn calculate_delay(config: &RetryStrategyConfig, attempt: u32) -> Duration {
    if config.strategy == RetryStrategyType::Immediate {
        return Duration::ZERO;
    }

    let attempt = attempt.max(1);
    let raw = match config.strategy {
        RetryStrategyType::Immediate => unreachable!(),
        RetryStrategyType::Exponential => {
            let exp = (attempt - 1).min(16);
            let factor = config.multiplier.powi(exp as i32);
            Duration::from_secs_f64(config.base_delay.as_secs_f64() * factor)
        }
        RetryStrategyType::Linear => config.base_delay.saturating_mul(attempt),
        RetryStrategyType::Constant => config.base_delay,
    };

    raw.min(config.max_delay)
}

/// Applies up to `jitter` fractional randomization to `delay`, still capped
/// at `max_delay`.
pub fn apply_jitter(delay: Duration, jitter: f64, max_delay: Duration) -> Duration {
    if jitter <= 0.0 || delay.is_zero() {
        return delay;
    }
    let factor = 1.0 + (rand::random::<f64>() * 2.0 - 1.0) * jitter.clamp(0.0, 1.0);
    let jittered = Duration::from_secs_f64((delay.as_secs_f64() * factor).max(0.0));
    jittered.min(max_delay)
}

/// Computes the dispatcher's next backoff delay, jitter included.
pub fn next_backoff(config: &RetryStrategyConfig, attempt: u32) -> Duration {
    let base = calculate_delay(config, attempt);
    apply_jitter(base, config.jitter, config.max_delay)
}

/// Sentinel wrapper marking an error chain as non-retryable. See
/// [`is_non_retryable`] and the design note on sentinel-wrapping over type
/// hierarchies.
#[derive(Debug)]
pub struct NonRetryable(pub anyhow::Error);

impl std::fmt::Display for NonRetryable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for NonRetryable {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

/// Wraps `err` so [`is_non_retryable`] reports `true` for it and for
/// anything produced by `.context(...)` on top of it.
pub fn non_retryable(err: anyhow::Error) -> anyhow::Error {
    anyhow::Error::new(NonRetryable(err))
}

/// Walks the error chain looking for a [`NonRetryable`] sentinel.
pub fn is_non_retryable(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.downcast_ref::<NonRetryable>().is_some())
        || err.downcast_ref::<NonRetryable>().is_some()
}

const AUTH_PATTERNS: &[&str] = &["401", "403 forbidden", "permission denied", "unauthorized"];
const TRANSIENT_PATTERNS: &[&str] = &[
    "connection reset",
    "connection refused",
    "timeout",
    "timed out",
    "temporary failure",
    "rate limit",
    "too many requests",
    "dns",
    "tls handshake",
    "server error",
    "502",
    "503",
    "504",
];

/// Outcome of classifying a subprocess failure: whether the dispatcher
/// should retry it, and the combined output excerpt used for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub retryable: bool,
    pub reason: &'static str,
}

/// Classifies an agent subprocess failure from its combined stdout/stderr,
/// per the `shipper::engine::classify_cargo_failure` substring-matching
/// technique, specialized to the patterns the design calls out in §4.3.
pub fn classify_agent_failure(exit_code: i32, combined_output: &str) -> Classification {
    let haystack = combined_output.to_lowercase();

    if AUTH_PATTERNS.iter().any(|p| haystack.contains(p)) {
        return Classification {
            retryable: false,
            reason: "authorization failure",
        };
    }

    if TRANSIENT_PATTERNS.iter().any(|p| haystack.contains(p)) {
        return Classification {
            retryable: true,
            reason: "transient failure",
        };
    }

    let _ = exit_code;
    Classification {
        retryable: true,
        reason: "unclassified failure",
    }
}

/// Produces a human-readable remediation hint for a failure, appended as a
/// `Hint`-level log entry regardless of retry classification.
pub fn extract_hint(combined_output: &str) -> String {
    let haystack = combined_output.to_lowercase();

    if AUTH_PATTERNS.iter().any(|p| haystack.contains(p)) {
        return "check that the GitHub App installation token has write access and has not expired; verify credentials".to_string();
    }

    if TRANSIENT_PATTERNS.iter().any(|p| haystack.contains(p)) {
        return "transient network condition; the dispatcher will retry with backoff".to_string();
    }

    "no specific remediation identified; inspect the agent's full output".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_is_always_zero() {
        let cfg = RetryStrategyConfig {
            strategy: RetryStrategyType::Immediate,
            ..Default::default()
        };
        assert_eq!(calculate_delay(&cfg, 1), Duration::ZERO);
        assert_eq!(calculate_delay(&cfg, 50), Duration::ZERO);
    }

    #[test]
    fn exponential_doubles_with_multiplier_two() {
        let cfg = RetryStrategyConfig {
            strategy: RetryStrategyType::Exponential,
            max_attempts: 5,
            base_delay: Duration::from_secs(15),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.0,
        };
        assert_eq!(calculate_delay(&cfg, 1), Duration::from_secs(15));
        assert_eq!(calculate_delay(&cfg, 2), Duration::from_secs(30));
        assert_eq!(calculate_delay(&cfg, 3), Duration::from_secs(60));
    }

    #[test]
    fn exponential_caps_at_max_delay() {
        let cfg = RetryStrategyConfig {
            strategy: RetryStrategyType::Exponential,
            max_attempts: 20,
            base_delay: Duration::from_secs(15),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.0,
        };
        assert_eq!(calculate_delay(&cfg, 10), Duration::from_secs(60));
    }

    #[test]
    fn backoff_is_monotonic_until_cap() {
        let cfg = RetryStrategyConfig::default();
        let mut prev = Duration::ZERO;
        for attempt in 1..=cfg.max_attempts {
            let d = calculate_delay(&cfg, attempt);
            assert!(d >= prev);
            prev = d;
        }
    }

    #[test]
    fn constant_ignores_attempt_number() {
        let cfg = RetryStrategyConfig {
            strategy: RetryStrategyType::Constant,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            ..Default::default()
        };
        assert_eq!(calculate_delay(&cfg, 1), calculate_delay(&cfg, 9));
    }

    #[test]
    fn jitter_zero_is_a_no_op() {
        let d = Duration::from_secs(10);
        assert_eq!(apply_jitter(d, 0.0, Duration::from_secs(100)), d);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_secs(10);
        for _ in 0..200 {
            let jittered = apply_jitter(base, 0.5, Duration::from_secs(100));
            assert!(jittered.as_secs_f64() >= base.as_secs_f64() * 0.5);
            assert!(jittered.as_secs_f64() <= base.as_secs_f64() * 1.5 + 0.001);
        }
    }

    #[test]
    fn non_retryable_survives_context_wrapping() {
        let base = anyhow::anyhow!("401 Unauthorized");
        let sentinel = non_retryable(base);
        let wrapped = sentinel.context("installation token request failed");
        assert!(is_non_retryable(&wrapped));
    }

    #[test]
    fn plain_errors_are_not_non_retryable() {
        let err = anyhow::anyhow!("connection reset");
        assert!(!is_non_retryable(&err));
    }

    #[test]
    fn classify_auth_pattern_is_non_retryable() {
        let c = classify_agent_failure(1, "Error: 401 Unauthorized\n");
        assert!(!c.retryable);
    }

    #[test]
    fn classify_transient_pattern_is_retryable() {
        let c = classify_agent_failure(1, "fatal: connection reset by peer");
        assert!(c.retryable);
    }

    #[test]
    fn classify_unknown_defaults_retryable() {
        let c = classify_agent_failure(1, "panic: index out of bounds");
        assert!(c.retryable);
    }

    #[test]
    fn hint_mentions_credentials_for_auth_failures() {
        let hint = extract_hint("403 Forbidden");
        assert!(hint.contains("credentials"));
    }

    #[test]
    fn duration_codec_round_trips_through_millis() {
        let cfg = RetryStrategyConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: RetryStrategyConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, back);
    }

    #[test]
    fn duration_codec_accepts_human_strings() {
        let json = r#"{"strategy":"exponential","max_attempts":3,"base_delay":"15s","max_delay":"5m","multiplier":2.0,"jitter":0.0}"#;
        let cfg: RetryStrategyConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.base_delay, Duration::from_secs(15));
        assert_eq!(cfg.max_delay, Duration::from_secs(300));
    }
}
