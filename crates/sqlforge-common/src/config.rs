//! Engine configuration (SPEC_FULL.md §A "Configuration").
//!
//! Loading the YAML file itself, and expanding environment variables inside
//! it, is an external collaborator's job (spec.md §1 Non-goals); this crate
//! only owns the already-parsed shape, the way `dbt-fusion`'s
//! `AdapterConfig` / Feather-Flow's `Config` separate "what the values are"
//! from "how they got loaded".

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model_types::MaterializationKind;

/// Retry/backoff constants for transient driver failures (spec §4.7, §9
/// Open Question #2): "initial 1s, factor 2, jitter ±20%, cap N retries".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub backoff_factor: f64,
    pub jitter_fraction: f64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            backoff_factor: 2.0,
            jitter_fraction: 0.2,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Backoff duration before the given attempt (0-indexed), before jitter.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let secs = self.initial_backoff.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        Duration::from_secs_f64(secs)
    }
}

/// Top-level engine configuration: pool sizing, retry behaviour, default
/// materialisation, declared variables, and the target environment name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Name of the environment this run targets (keys the state store,
    /// spec §3 StateEntry: "(environment, model_name)").
    pub environment: String,
    /// Bounded connection pool size (spec §4.7, §5).
    pub pool_size: u32,
    pub retry_policy: RetryPolicy,
    pub default_materialization: MaterializationKind,
    /// `$variable` values available for substitution (spec §4.1, §4.9).
    pub variables: BTreeMap<String, String>,
    /// Abort the run on the first model failure instead of continuing to
    /// the next batch (spec §4.9 "unless `fail_fast` is set").
    pub fail_fast: bool,
    /// Bound on parallel chunk workers within a single CDC materialisation
    /// (spec §4.8, §5: "default 10").
    pub max_parallel_cdc_chunks: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            environment: "dev".to_string(),
            pool_size: 4,
            retry_policy: RetryPolicy::default(),
            default_materialization: MaterializationKind::View,
            variables: BTreeMap::new(),
            fail_fast: false,
            max_parallel_cdc_chunks: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_backoff_grows_exponentially() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_secs(4));
    }

    #[test]
    fn default_config_is_sane() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.pool_size, 4);
        assert!(!cfg.fail_fast);
    }
}
