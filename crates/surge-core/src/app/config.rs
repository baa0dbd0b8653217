//! Run configuration.
//!
//! Loaded from a JSON file; every section and field is optional and falls
//! back to the defaults below. `validate()` runs after loading so a bad file
//! fails before any artifact is claimed.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Settings for one `Dispatch` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub initial_concurrency: usize,
    pub increment_factor: f64,
    pub decrement_factor: f64,

    /// Consecutive successes required before the limit may grow.
    pub success_threshold: u64,

    /// Attempts per descriptor inside one dispatch (including the first).
    pub max_local_retries: u32,

    /// Base of the linear backoff between local attempts.
    pub retry_base_delay_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            min_concurrency: 100,
            max_concurrency: 1500,
            initial_concurrency: 1000,
            increment_factor: 1.2,
            decrement_factor: 0.7,
            success_threshold: 1000,
            max_local_retries: 3,
            retry_base_delay_ms: 500,
        }
    }
}

impl DispatchConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_concurrency == 0 {
            return Err(ConfigError::Invalid("min_concurrency must be at least 1".into()));
        }
        if !(self.min_concurrency <= self.initial_concurrency
            && self.initial_concurrency <= self.max_concurrency)
        {
            return Err(ConfigError::Invalid(format!(
                "expected min <= initial <= max concurrency, got {} / {} / {}",
                self.min_concurrency, self.initial_concurrency, self.max_concurrency
            )));
        }
        if !(self.increment_factor > 1.0 && self.increment_factor.is_finite()) {
            return Err(ConfigError::Invalid(format!(
                "increment_factor must be > 1, got {}",
                self.increment_factor
            )));
        }
        if !(self.decrement_factor > 0.0 && self.decrement_factor < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "decrement_factor must be in (0, 1), got {}",
                self.decrement_factor
            )));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::Invalid("success_threshold must be at least 1".into()));
        }
        if self.max_local_retries == 0 {
            return Err(ConfigError::Invalid("max_local_retries must be at least 1".into()));
        }
        Ok(())
    }
}

/// Locations used by the claim protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaimConfig {
    /// Where new artifacts are dropped by producers.
    pub trigger_prefix: String,

    /// Private per-worker copies live under `<processing_prefix><worker_id>/`.
    pub processing_prefix: String,

    /// Artifacts that failed processing, kept for manual review.
    pub review_prefix: String,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            trigger_prefix: "incoming/".into(),
            processing_prefix: "processing/".into(),
            review_prefix: "review/".into(),
        }
    }
}

impl ClaimConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let prefixes = [
            &self.trigger_prefix,
            &self.processing_prefix,
            &self.review_prefix,
        ];
        if prefixes.iter().any(|p| p.is_empty()) {
            return Err(ConfigError::Invalid("claim prefixes must be non-empty".into()));
        }
        for (i, a) in prefixes.iter().enumerate() {
            for b in prefixes.iter().skip(i + 1) {
                if a.starts_with(b.as_str()) || b.starts_with(a.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "claim prefixes must not overlap: {a:?} / {b:?}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Pipeline-level retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationPolicy {
    /// Failed stage attempts before an item becomes a terminal failure.
    pub max_attempts: u32,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Rows per store transaction when applying outcomes.
    pub chunk_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { chunk_size: 500 }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SurgeConfig {
    pub dispatch: DispatchConfig,
    pub claim: ClaimConfig,
    pub escalation: EscalationPolicy,
    pub store: StoreConfig,
}

impl SurgeConfig {
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
        let config = Self::from_json(&content)?;

        debug!(?config, "configuration loaded");
        Ok(config)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: SurgeConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.dispatch.validate()?;
        self.claim.validate()?;
        if self.escalation.max_attempts == 0 {
            return Err(ConfigError::Invalid("escalation.max_attempts must be at least 1".into()));
        }
        if self.store.chunk_size == 0 {
            return Err(ConfigError::Invalid("store.chunk_size must be at least 1".into()));
        }
        Ok(())
    }
}
