//! Orchestrator configuration.
//!
//! Loaded from an optional TOML file and then overridden by `DILIGENCE_*`
//! environment variables. Per-submission overrides (see
//! [`crate::service::SubmitOptions`]) are more specific and take precedence
//! over anything configured here.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use diligence_state::AgentKind;

/// Longest accepted session deadline (30 days).
pub const MAX_SESSION_DEADLINE_MS: u64 = 30 * 24 * 60 * 60 * 1_000;

/// Longest accepted writer lease (one day).
pub const MAX_LEASE_TTL_MS: u64 = 24 * 60 * 60 * 1_000;

/// Largest concurrency ceiling a semaphore can hold.
pub const MAX_CONCURRENCY: usize = Semaphore::MAX_PERMITS;

/// Errors produced while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },

    #[error("{field} out of range: {value} (expected {expected})")]
    OutOfRange {
        field: &'static str,
        value: String,
        expected: String,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    fn out_of_range(field: &'static str, value: impl ToString, expected: impl Into<String>) -> Self {
        ConfigError::OutOfRange {
            field,
            value: value.to_string(),
            expected: expected.into(),
        }
    }
}

/// Check a session deadline, from config or a per-submission override.
pub fn check_session_deadline(deadline_ms: u64) -> Result<u64, ConfigError> {
    if deadline_ms == 0 || deadline_ms > MAX_SESSION_DEADLINE_MS {
        return Err(ConfigError::out_of_range(
            "session_deadline_ms",
            deadline_ms,
            format!("1..={MAX_SESSION_DEADLINE_MS}"),
        ));
    }
    Ok(deadline_ms)
}

/// Absolute deadline `deadline_ms` after `now`.
pub fn deadline_after(
    now: chrono::DateTime<chrono::Utc>,
    deadline_ms: u64,
) -> Result<chrono::DateTime<chrono::Utc>, ConfigError> {
    let deadline_ms = check_session_deadline(deadline_ms)?;
    i64::try_from(deadline_ms)
        .ok()
        .and_then(chrono::Duration::try_milliseconds)
        .and_then(|delta| now.checked_add_signed(delta))
        .ok_or_else(|| {
            ConfigError::out_of_range(
                "session_deadline_ms",
                deadline_ms,
                "a deadline representable as a timestamp",
            )
        })
}

/// Check a concurrency ceiling, from config or a per-submission override.
pub fn check_concurrency(field: &'static str, value: usize) -> Result<usize, ConfigError> {
    if value == 0 || value > MAX_CONCURRENCY {
        return Err(ConfigError::out_of_range(
            field,
            value,
            format!("1..={MAX_CONCURRENCY}"),
        ));
    }
    Ok(value)
}

fn check_unit(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::out_of_range(field, value, "a number in 0..=1"));
    }
    Ok(())
}

/// Bounded exponential backoff for transient agent failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            backoff_multiplier: 2.0,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `next_attempt` (2-based: the first retry is attempt 2).
    pub fn backoff_for(&self, next_attempt: u32) -> Duration {
        let exponent = next_attempt.saturating_sub(2) as i32;
        let raw = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// Weights of the hybrid ranking function.
///
/// `score = similarity_weight * similarity + boost_weight * boost`, where the
/// boost is the structured-match fraction for rows and a recency decay for
/// dated text chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingConfig {
    pub similarity_weight: f64,
    pub boost_weight: f64,
    /// Half-life of the recency boost; `None` disables it.
    pub recency_half_life_days: Option<f64>,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            similarity_weight: 0.7,
            boost_weight: 0.3,
            recency_half_life_days: Some(180.0),
        }
    }
}

/// Top-level configuration for the orchestration core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Ceiling on agent invocations in flight across all sessions.
    pub global_max_concurrent: usize,
    /// Ceiling on agent invocations in flight within one session.
    pub session_max_concurrent: usize,
    pub retrieval_timeout_ms: u64,
    pub agent_timeout_ms: u64,
    /// Overrides `agent_timeout_ms` for specific agent kinds.
    pub agent_timeout_overrides_ms: HashMap<AgentKind, u64>,
    pub session_deadline_ms: u64,
    /// Writer lease lifetime; the scheduler renews it at a third of this.
    pub lease_ttl_ms: u64,
    pub retry: RetryPolicy,
    pub ranking: RankingConfig,
    pub top_k: usize,
    pub max_context_tokens: usize,
    pub reserved_context_tokens: usize,
    /// Minimum ranking score for evidence to count as relevant to a question.
    pub min_relevance: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            global_max_concurrent: 16,
            session_max_concurrent: 4,
            retrieval_timeout_ms: 5_000,
            agent_timeout_ms: 60_000,
            agent_timeout_overrides_ms: HashMap::new(),
            session_deadline_ms: 600_000,
            lease_ttl_ms: 30_000,
            retry: RetryPolicy::default(),
            ranking: RankingConfig::default(),
            top_k: 8,
            max_context_tokens: 8_000,
            reserved_context_tokens: 1_000,
            min_relevance: 0.05,
        }
    }
}

impl OrchestratorConfig {
    /// Load from `path` (if given), apply environment overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Apply `DILIGENCE_*` overrides read through `lookup`.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        fn parse<T: std::str::FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv {
                    key: key.to_string(),
                    value,
                })
        }

        macro_rules! env_override {
            ($key:literal, $field:expr) => {
                if let Some(value) = lookup($key) {
                    $field = parse($key, value)?;
                }
            };
        }

        env_override!("DILIGENCE_GLOBAL_MAX_CONCURRENT", self.global_max_concurrent);
        env_override!("DILIGENCE_SESSION_MAX_CONCURRENT", self.session_max_concurrent);
        env_override!("DILIGENCE_RETRIEVAL_TIMEOUT_MS", self.retrieval_timeout_ms);
        env_override!("DILIGENCE_AGENT_TIMEOUT_MS", self.agent_timeout_ms);
        env_override!("DILIGENCE_SESSION_DEADLINE_MS", self.session_deadline_ms);
        env_override!("DILIGENCE_MAX_ATTEMPTS", self.retry.max_attempts);
        env_override!("DILIGENCE_INITIAL_BACKOFF_MS", self.retry.initial_backoff_ms);
        env_override!("DILIGENCE_TOP_K", self.top_k);
        env_override!("DILIGENCE_MAX_CONTEXT_TOKENS", self.max_context_tokens);
        env_override!("DILIGENCE_MIN_RELEVANCE", self.min_relevance);
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_concurrency("global_max_concurrent", self.global_max_concurrent)?;
        check_concurrency("session_max_concurrent", self.session_max_concurrent)?;
        check_session_deadline(self.session_deadline_ms)?;
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::out_of_range(
                "retry.max_attempts",
                self.retry.max_attempts,
                "at least 1",
            ));
        }
        let multiplier = self.retry.backoff_multiplier;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(ConfigError::out_of_range(
                "retry.backoff_multiplier",
                multiplier,
                "a finite number >= 1",
            ));
        }
        if !(3..=MAX_LEASE_TTL_MS).contains(&self.lease_ttl_ms) {
            return Err(ConfigError::out_of_range(
                "lease_ttl_ms",
                self.lease_ttl_ms,
                format!("3..={MAX_LEASE_TTL_MS}"),
            ));
        }
        if self.top_k == 0 {
            return Err(ConfigError::out_of_range("top_k", self.top_k, "at least 1"));
        }
        if self.reserved_context_tokens >= self.max_context_tokens {
            return Err(ConfigError::Invalid(format!(
                "reserved_context_tokens ({}) must be less than max_context_tokens ({})",
                self.reserved_context_tokens, self.max_context_tokens
            )));
        }
        check_unit("ranking.similarity_weight", self.ranking.similarity_weight)?;
        check_unit("ranking.boost_weight", self.ranking.boost_weight)?;
        if self.ranking.similarity_weight + self.ranking.boost_weight == 0.0 {
            return Err(ConfigError::Invalid(
                "ranking weights must not both be zero".to_string(),
            ));
        }
        if let Some(half_life) = self.ranking.recency_half_life_days {
            if !half_life.is_finite() || half_life <= 0.0 {
                return Err(ConfigError::out_of_range(
                    "ranking.recency_half_life_days",
                    half_life,
                    "a positive number",
                ));
            }
        }
        check_unit("min_relevance", self.min_relevance)?;
        Ok(())
    }

    pub fn retrieval_timeout(&self) -> Duration {
        Duration::from_millis(self.retrieval_timeout_ms)
    }

    /// Invocation timeout for `kind`; a per-kind override wins over the default.
    pub fn agent_timeout(&self, kind: AgentKind) -> Duration {
        let ms = self
            .agent_timeout_overrides_ms
            .get(&kind)
            .copied()
            .unwrap_or(self.agent_timeout_ms);
        Duration::from_millis(ms)
    }

    pub fn session_deadline(&self) -> Duration {
        Duration::from_millis(self.session_deadline_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }
}
