//! Pipeline configuration
//!
//! Service credentials come from the environment (with `.env` support);
//! dispatch tunables carry defaults matching the reference deployment and
//! can be overridden per orchestrator instance.

use std::time::Duration;

use crate::error::{AuditError, PipelineResult};

/// Credentials and endpoint for the external pricing service
#[derive(Debug, Clone)]
pub struct PricingConfig {
    pub api_url: String,
    pub api_key: String,
}

impl PricingConfig {
    /// Load from `PRICING_API_URL` / `PRICING_API_KEY`, reading `.env` first
    pub fn from_env() -> PipelineResult<Self> {
        dotenv::dotenv().ok();
        Ok(Self {
            api_url: require_env("PRICING_API_URL")?,
            api_key: require_env("PRICING_API_KEY")?,
        })
    }
}

fn require_env(name: &str) -> PipelineResult<String> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(AuditError::Config {
            field: name.to_string(),
        }),
    }
}

/// Retry and timeout policy for a single pricing call
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following `attempt` (1-based): base doubled
    /// per attempt, capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.backoff_base.saturating_mul(1u32 << exponent);
        delay.min(self.backoff_cap)
    }
}

/// Dispatch-loop tunables for the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Materials per upstream call. The reference deployment uses 1 to keep
    /// the blast radius of a failed call small.
    pub group_size: usize,
    /// Groups processed concurrently within one wave
    pub wave_concurrency: usize,
    /// Start offset between groups of the same wave
    pub stagger_step: Duration,
    /// Pause between consecutive waves
    pub wave_pause: Duration,
    /// Task-lookup attempts before giving up (persistence may lag creation)
    pub lookup_attempts: u32,
    pub lookup_delay: Duration,
    /// Delete attempts for the cancel-then-delete flow
    pub delete_attempts: u32,
    pub delete_delay: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            group_size: 1,
            wave_concurrency: 30,
            stagger_step: Duration::from_secs(1),
            wave_pause: Duration::from_millis(200),
            lookup_attempts: 3,
            lookup_delay: Duration::from_millis(300),
            delete_attempts: 3,
            delete_delay: Duration::from_millis(300),
        }
    }
}
