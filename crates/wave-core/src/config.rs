//! Engine configuration
//!
//! Loop bounds, review threshold, worker slots and delegation limits.
//! Every field has a default, so a TOML file only needs the keys it changes.

use crate::delegation::DelegationPolicy;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default cap on agent steps per review attempt
pub const DEFAULT_MAX_ITERATIONS: u32 = 100;
/// Consecutive step errors that make a unit fail
pub const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 3;
/// Default review-gate attempts
pub const DEFAULT_MAX_REVIEW_ATTEMPTS: u32 = 3;
/// Default passing score for the review gate
pub const DEFAULT_PASS_THRESHOLD: f64 = 0.75;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Agent steps per agent-loop pass
    pub max_iterations: u32,
    /// Consecutive failing steps before the unit fails
    pub max_consecutive_errors: u32,
    /// Review-gate attempts before accepting with a warning
    pub max_review_attempts: u32,
    /// Score at or above which a review passes
    pub pass_threshold: f64,
    /// Wave size used when the caller does not pass one
    pub default_concurrency_limit: usize,
    /// Concurrent units per user in the worker pool
    pub worker_slots_per_user: usize,
    /// Maximum delegation depth below a unit's root thread
    pub max_delegation_depth: usize,
    /// Maximum delegated sub-tasks per unit
    pub max_subtasks: usize,
    /// Re-read interval while the orchestrator waits for a wave, in case a
    /// wake-up was lost across a restart
    pub wave_poll_interval_ms: u64,
    /// System prompt handed to every agent step
    pub system_prompt: String,
}

impl EngineConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With agent-loop bound
    #[inline]
    #[must_use]
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    /// With review-gate bound
    #[inline]
    #[must_use]
    pub fn with_max_review_attempts(mut self, max: u32) -> Self {
        self.max_review_attempts = max;
        self
    }

    /// With pass threshold
    #[inline]
    #[must_use]
    pub fn with_pass_threshold(mut self, threshold: f64) -> Self {
        self.pass_threshold = threshold;
        self
    }

    /// With per-user worker slots
    #[inline]
    #[must_use]
    pub fn with_worker_slots(mut self, slots: usize) -> Self {
        self.worker_slots_per_user = slots;
        self
    }

    /// With wave wait poll interval
    #[inline]
    #[must_use]
    pub fn with_wave_poll_interval(mut self, interval: Duration) -> Self {
        self.wave_poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Wave wait poll interval
    #[inline]
    #[must_use]
    pub fn wave_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wave_poll_interval_ms)
    }

    /// Delegation limits for a unit's tree
    #[inline]
    #[must_use]
    pub fn delegation_policy(&self) -> DelegationPolicy {
        DelegationPolicy {
            max_depth: self.max_delegation_depth,
            max_subtasks: self.max_subtasks,
        }
    }

    /// Parse from TOML and validate
    ///
    /// # Errors
    /// `ConfigError::Parse` on malformed TOML, `ConfigError::InvalidValue`
    /// when a bound is out of range.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    ///
    /// # Errors
    /// `ConfigError::Io` when the file cannot be read, plus everything
    /// [`EngineConfig::from_toml_str`] returns.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Check bounds
    ///
    /// # Errors
    /// `ConfigError::InvalidValue` naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn positive(key: &'static str, value: u64) -> Result<(), ConfigError> {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key,
                    reason: "must be at least 1".to_string(),
                });
            }
            Ok(())
        }

        positive("max_iterations", u64::from(self.max_iterations))?;
        positive(
            "max_consecutive_errors",
            u64::from(self.max_consecutive_errors),
        )?;
        positive("max_review_attempts", u64::from(self.max_review_attempts))?;
        positive(
            "default_concurrency_limit",
            self.default_concurrency_limit as u64,
        )?;
        positive("worker_slots_per_user", self.worker_slots_per_user as u64)?;
        positive("wave_poll_interval_ms", self.wave_poll_interval_ms)?;

        if !(0.0..=1.0).contains(&self.pass_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "pass_threshold",
                reason: format!("{} is outside [0, 1]", self.pass_threshold),
            });
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_consecutive_errors: DEFAULT_MAX_CONSECUTIVE_ERRORS,
            max_review_attempts: DEFAULT_MAX_REVIEW_ATTEMPTS,
            pass_threshold: DEFAULT_PASS_THRESHOLD,
            default_concurrency_limit: 5,
            worker_slots_per_user: 5,
            max_delegation_depth: 2,
            max_subtasks: 8,
            wave_poll_interval_ms: 2_000,
            system_prompt: "You are a meticulous research agent. Save every finding with the \
                            value-saving tool and cite your sources."
                .to_string(),
        }
    }
}
