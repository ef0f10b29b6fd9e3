//! Run configuration: backend panel, consensus policy and sampling settings.
//!
//! `RunConfig` is an immutable value built once at startup and threaded through
//! the coordinator, orchestrator and backend adapters. Nothing here is global.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

// =============================================================================
// Backends
// =============================================================================

/// One scoring backend in the judge panel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    pub backend_id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Independent samples drawn per criterion (>= 1).
    pub n_samples: u32,
    /// Identity/version of the backend, e.g. an OpenRouter model id.
    pub identity: String,
    #[serde(default)]
    pub temperature: f32,
}

fn default_enabled() -> bool {
    true
}

impl BackendConfig {
    pub fn new(backend_id: impl Into<String>, identity: impl Into<String>, n_samples: u32) -> Self {
        Self {
            backend_id: backend_id.into(),
            enabled: true,
            n_samples,
            identity: identity.into(),
            temperature: 0.0,
        }
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

// =============================================================================
// Consensus policy
// =============================================================================

/// Breakpoints on cross-backend standard deviation.
///
/// `std < strong_below` is STRONG, `< good_below` GOOD, `< partial_below`
/// PARTIAL, anything else LOW. A criterion is flagged for review when
/// `std > flag_threshold`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ConsensusPolicy {
    #[serde(default = "default_strong_below")]
    pub strong_below: f64,
    #[serde(default = "default_good_below")]
    pub good_below: f64,
    #[serde(default = "default_partial_below")]
    pub partial_below: f64,
    #[serde(default = "default_partial_below")]
    pub flag_threshold: f64,
}

fn default_strong_below() -> f64 {
    0.5
}

fn default_good_below() -> f64 {
    1.0
}

fn default_partial_below() -> f64 {
    1.5
}

impl Default for ConsensusPolicy {
    fn default() -> Self {
        Self {
            strong_below: default_strong_below(),
            good_below: default_good_below(),
            partial_below: default_partial_below(),
            flag_threshold: default_partial_below(),
        }
    }
}

// =============================================================================
// Sampling
// =============================================================================

/// Upper bound on `transport_retries`.
pub const MAX_TRANSPORT_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SamplingSettings {
    /// Deadline for a single backend call attempt.
    #[serde(default = "default_sample_timeout_ms")]
    pub sample_timeout_ms: u64,
    /// Extra attempts granted to a sample after a retryable transport failure.
    #[serde(default = "default_transport_retries")]
    pub transport_retries: u32,
    /// First backoff wait. Doubles per retry, capped at `sample_timeout_ms`.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Global cap on in-flight backend calls.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

fn default_sample_timeout_ms() -> u64 {
    30_000
}

fn default_transport_retries() -> u32 {
    1
}

fn default_retry_base_delay_ms() -> u64 {
    250
}

fn default_max_concurrency() -> usize {
    8
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self {
            sample_timeout_ms: default_sample_timeout_ms(),
            transport_retries: default_transport_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

impl SamplingSettings {
    pub fn sample_timeout(&self) -> Duration {
        Duration::from_millis(self.sample_timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

// =============================================================================
// RunConfig
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub consensus: ConsensusPolicy,
    #[serde(default)]
    pub sampling: SamplingSettings,
}

impl RunConfig {
    pub fn new(backends: Vec<BackendConfig>) -> Self {
        Self {
            backends,
            ..Default::default()
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigurationError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| ConfigurationError::Decode(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn enabled_backends(&self) -> impl Iterator<Item = &BackendConfig> {
        self.backends.iter().filter(|b| b.enabled)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let mut seen: HashSet<&str> = HashSet::new();
        for backend in &self.backends {
            let invalid = |reason: &str| ConfigurationError::InvalidBackend {
                backend_id: backend.backend_id.clone(),
                reason: reason.to_string(),
            };
            if backend.backend_id.trim().is_empty() {
                return Err(invalid("backend_id must not be empty"));
            }
            if !seen.insert(backend.backend_id.as_str()) {
                return Err(invalid("duplicate backend_id"));
            }
            if backend.n_samples == 0 {
                return Err(invalid("n_samples must be >= 1"));
            }
            if backend.identity.trim().is_empty() {
                return Err(invalid("identity must not be empty"));
            }
            if !(0.0..=2.0).contains(&backend.temperature) {
                return Err(invalid("temperature must be in [0, 2]"));
            }
        }

        let c = &self.consensus;
        let breakpoints = [c.strong_below, c.good_below, c.partial_below];
        if breakpoints.iter().any(|b| !b.is_finite() || *b <= 0.0) {
            return Err(ConfigurationError::InvalidRunConfig(
                "consensus breakpoints must be finite and positive".into(),
            ));
        }
        if !(c.strong_below < c.good_below && c.good_below < c.partial_below) {
            return Err(ConfigurationError::InvalidRunConfig(
                "consensus breakpoints must be strictly increasing".into(),
            ));
        }
        if !c.flag_threshold.is_finite() || c.flag_threshold <= 0.0 {
            return Err(ConfigurationError::InvalidRunConfig(
                "flag_threshold must be finite and positive".into(),
            ));
        }

        if self.sampling.sample_timeout_ms == 0 {
            return Err(ConfigurationError::InvalidRunConfig(
                "sample_timeout_ms must be >= 1".into(),
            ));
        }
        if self.sampling.transport_retries > MAX_TRANSPORT_RETRIES {
            return Err(ConfigurationError::InvalidRunConfig(format!(
                "transport_retries must be <= {MAX_TRANSPORT_RETRIES}"
            )));
        }
        if self.sampling.retry_base_delay_ms > self.sampling.sample_timeout_ms {
            return Err(ConfigurationError::InvalidRunConfig(
                "retry_base_delay_ms must not exceed sample_timeout_ms".into(),
            ));
        }
        if self.sampling.max_concurrency == 0 {
            return Err(ConfigurationError::InvalidRunConfig(
                "max_concurrency must be >= 1".into(),
            ));
        }
        Ok(())
    }

    /// Apply `CONSENSUS_*` environment overrides. Unparseable values are ignored.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Some(ms) = env_parse::<u64>("CONSENSUS_SAMPLE_TIMEOUT_MS") {
            self.sampling.sample_timeout_ms = ms;
        }
        if let Some(n) = env_parse::<usize>("CONSENSUS_MAX_CONCURRENCY") {
            self.sampling.max_concurrency = n;
        }
        if let Some(n) = env_parse::<u32>("CONSENSUS_TRANSPORT_RETRIES") {
            self.sampling.transport_retries = n;
        }
        if let Some(t) = env_parse::<f64>("CONSENSUS_FLAG_THRESHOLD") {
            self.consensus.flag_threshold = t;
        }
        self
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}
