use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Scoring strategy for candidate arms
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Upper confidence bound
    #[default]
    Ucb1,
    /// Explore at random with probability epsilon
    EpsilonGreedy,
}

/// Bandit feedback and cooldown settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BanditConfig {
    #[serde(default)]
    pub default_strategy: StrategyKind,
    /// Exploration probability for epsilon-greedy
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    /// Exploration weight for UCB1
    #[serde(default = "default_exploration")]
    pub exploration: f64,
    /// Consecutive failures before an arm enters cooldown
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown", deserialize_with = "duration_str::deserialize_duration")]
    pub cooldown: Duration,
    /// TTL of arm snapshots in the shared cache
    #[serde(default = "default_cache_ttl", deserialize_with = "duration_str::deserialize_duration")]
    pub cache_ttl: Duration,
    /// Optimistic update attempts for one feedback record
    #[serde(default = "default_max_update_retries")]
    pub max_update_retries: u32,
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            default_strategy: StrategyKind::default(),
            epsilon: default_epsilon(),
            exploration: default_exploration(),
            failure_threshold: default_failure_threshold(),
            cooldown: default_cooldown(),
            cache_ttl: default_cache_ttl(),
            max_update_retries: default_max_update_retries(),
        }
    }
}

const fn default_epsilon() -> f64 {
    0.1
}

const fn default_exploration() -> f64 {
    std::f64::consts::SQRT_2
}

const fn default_failure_threshold() -> u32 {
    3
}

const fn default_cooldown() -> Duration {
    Duration::from_secs(60)
}

const fn default_cache_ttl() -> Duration {
    Duration::from_secs(30)
}

const fn default_max_update_retries() -> u32 {
    5
}
