use std::time::Duration;

use conduit_config::{BanditConfig, StrategyKind};
use jiff::Timestamp;
use serde::{Deserialize, Serialize};

/// Tuning attached to an arm
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ArmParams {
    pub strategy: StrategyKind,
    pub epsilon: f64,
    pub exploration: f64,
    /// Consecutive failures that start a cooldown
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
}

impl ArmParams {
    pub fn from_config(config: &BanditConfig) -> Self {
        Self {
            strategy: config.default_strategy,
            epsilon: config.epsilon,
            exploration: config.exploration,
            failure_threshold: config.failure_threshold,
            cooldown_ms: u64::try_from(config.cooldown.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Apply per-candidate overrides
    #[must_use]
    pub fn with_overrides(
        mut self,
        strategy: Option<&str>,
        failure_threshold: Option<u32>,
        cooldown: Option<Duration>,
    ) -> Self {
        if let Some(strategy) = strategy.and_then(strategy_from_name) {
            self.strategy = strategy;
        }
        if let Some(threshold) = failure_threshold {
            self.failure_threshold = threshold;
        }
        if let Some(cooldown) = cooldown {
            self.cooldown_ms = u64::try_from(cooldown.as_millis()).unwrap_or(u64::MAX);
        }
        self
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Parse a strategy name as written in configuration
pub fn strategy_from_name(name: &str) -> Option<StrategyKind> {
    match name {
        "ucb1" => Some(StrategyKind::Ucb1),
        "epsilon_greedy" => Some(StrategyKind::EpsilonGreedy),
        _ => None,
    }
}

/// Outcome of one upstream call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Feedback {
    pub success: bool,
    pub latency_ms: u64,
    pub cost_micros: i64,
    /// Reward in `[0, 1]`
    pub reward: f64,
}

impl Feedback {
    pub fn success(latency_ms: u64) -> Self {
        Self {
            success: true,
            latency_ms,
            cost_micros: 0,
            reward: 1.0,
        }
    }

    pub fn failure(latency_ms: u64) -> Self {
        Self {
            success: false,
            latency_ms,
            cost_micros: 0,
            reward: 0.0,
        }
    }
}

/// Persisted statistics for one candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmState {
    pub candidate_id: String,
    pub params: ArmParams,
    pub trials: u64,
    pub successes: u64,
    /// Current run of failures, reduced by one per success
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_reward: f64,
    pub last_reward: f64,
    pub mean_latency_ms: f64,
    pub total_cost_micros: i64,
    pub cooldown_until: Option<Timestamp>,
    /// Optimistic concurrency version
    pub version: u64,
    pub updated_at: Timestamp,
}

impl ArmState {
    pub fn new(candidate_id: impl Into<String>, params: ArmParams, now: Timestamp) -> Self {
        Self {
            candidate_id: candidate_id.into(),
            params,
            trials: 0,
            successes: 0,
            consecutive_failures: 0,
            total_failures: 0,
            total_reward: 0.0,
            last_reward: 0.0,
            mean_latency_ms: 0.0,
            total_cost_micros: 0,
            cooldown_until: None,
            version: 0,
            updated_at: now,
        }
    }

    pub fn is_in_cooldown(&self, now: Timestamp) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }

    /// Average reward, `None` before the first trial
    #[allow(clippy::cast_precision_loss)]
    pub fn mean_reward(&self) -> Option<f64> {
        (self.trials > 0).then(|| self.total_reward / self.trials as f64)
    }

    /// Fold one outcome into the statistics and bump the version
    #[allow(clippy::cast_precision_loss)]
    pub fn apply(&mut self, feedback: &Feedback, now: Timestamp) {
        self.trials += 1;
        self.total_reward += feedback.reward.clamp(0.0, 1.0);
        self.last_reward = feedback.reward;
        self.total_cost_micros = self.total_cost_micros.saturating_add(feedback.cost_micros);
        self.mean_latency_ms += (feedback.latency_ms as f64 - self.mean_latency_ms) / self.trials as f64;

        if feedback.success {
            self.successes += 1;
            self.consecutive_failures = self.consecutive_failures.saturating_sub(1);
            self.cooldown_until = None;
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.total_failures += 1;

            if self.consecutive_failures >= self.params.failure_threshold {
                let cooldown = jiff::SignedDuration::from_millis(
                    i64::try_from(self.params.cooldown_ms).unwrap_or(i64::MAX),
                );
                self.cooldown_until = Some(now.checked_add(cooldown).unwrap_or(now));
            }
        }

        self.version += 1;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ArmParams {
        ArmParams {
            strategy: StrategyKind::Ucb1,
            epsilon: 0.1,
            exploration: 1.0,
            failure_threshold: 3,
            cooldown_ms: 60_000,
        }
    }

    #[test]
    fn threshold_failures_start_cooldown() {
        let now = Timestamp::now();
        let mut arm = ArmState::new("a", params(), now);

        arm.apply(&Feedback::failure(100), now);
        arm.apply(&Feedback::failure(100), now);
        assert!(!arm.is_in_cooldown(now));

        arm.apply(&Feedback::failure(100), now);
        assert!(arm.is_in_cooldown(now));
        assert_eq!(arm.consecutive_failures, 3);
        assert_eq!(arm.version, 3);

        let later = now + jiff::SignedDuration::from_secs(61);
        assert!(!arm.is_in_cooldown(later));
    }

    #[test]
    fn success_decrements_failures_and_clears_cooldown() {
        let now = Timestamp::now();
        let mut arm = ArmState::new("a", params(), now);

        for _ in 0..3 {
            arm.apply(&Feedback::failure(10), now);
        }
        arm.apply(&Feedback::success(10), now);

        assert_eq!(arm.consecutive_failures, 2);
        assert!(arm.cooldown_until.is_none());

        arm.apply(&Feedback::success(10), now);
        arm.apply(&Feedback::success(10), now);
        arm.apply(&Feedback::success(10), now);
        assert_eq!(arm.consecutive_failures, 0);
    }

    #[test]
    fn statistics_accumulate() {
        let now = Timestamp::now();
        let mut arm = ArmState::new("a", params(), now);
        assert_eq!(arm.mean_reward(), None);

        arm.apply(&Feedback::success(100), now);
        arm.apply(&Feedback::failure(300), now);

        assert_eq!(arm.trials, 2);
        assert_eq!(arm.successes, 1);
        assert!((arm.mean_latency_ms - 200.0).abs() < f64::EPSILON);
        assert!((arm.mean_reward().unwrap() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn overrides_replace_defaults() {
        let params = params().with_overrides(Some("epsilon_greedy"), Some(1), Some(Duration::from_secs(5)));
        assert_eq!(params.strategy, StrategyKind::EpsilonGreedy);
        assert_eq!(params.failure_threshold, 1);
        assert_eq!(params.cooldown(), Duration::from_secs(5));

        let unchanged = ArmParams::from_config(&BanditConfig::default()).with_overrides(Some("bogus"), None, None);
        assert_eq!(unchanged.strategy, StrategyKind::Ucb1);
    }
}
