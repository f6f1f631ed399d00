use std::cmp::Ordering;
use std::collections::HashMap;

use conduit_config::StrategyKind;
use jiff::Timestamp;
use rand::Rng;
use rand::seq::SliceRandom;

use crate::arm::{ArmParams, ArmState};

/// Order candidates for an attempt, best first
///
/// Candidates outside cooldown are scored by `params.strategy`. Ties keep
/// the configured order. When every candidate is cooling down, only the one
/// whose cooldown ends first is returned.
pub fn rank_candidates<R: Rng + ?Sized>(
    candidate_ids: &[String],
    states: &HashMap<String, ArmState>,
    params: &ArmParams,
    now: Timestamp,
    rng: &mut R,
) -> Vec<String> {
    let (available, cooling): (Vec<&String>, Vec<&String>) = candidate_ids
        .iter()
        .partition(|id| !states.get(id.as_str()).is_some_and(|arm| arm.is_in_cooldown(now)));

    if available.is_empty() {
        return cooling
            .into_iter()
            .min_by_key(|id| states.get(id.as_str()).and_then(|arm| arm.cooldown_until))
            .map(|id| vec![id.clone()])
            .unwrap_or_default();
    }

    let mut ranked: Vec<String> = available.into_iter().cloned().collect();

    match params.strategy {
        StrategyKind::Ucb1 => {
            let total: u64 = ranked
                .iter()
                .filter_map(|id| states.get(id).map(|arm| arm.trials))
                .sum();
            sort_by_score(&mut ranked, |id| ucb1_score(states.get(id), total, params.exploration));
        }
        StrategyKind::EpsilonGreedy => {
            if rng.random::<f64>() < params.epsilon {
                ranked.shuffle(rng);
            } else {
                // Untried arms are treated optimistically
                sort_by_score(&mut ranked, |id| {
                    states.get(id).and_then(ArmState::mean_reward).unwrap_or(1.0)
                });
            }
        }
    }

    ranked
}

fn sort_by_score(ids: &mut [String], score: impl Fn(&str) -> f64) {
    let mut scored: Vec<(f64, String)> = ids.iter().map(|id| (score(id), id.clone())).collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

    for (slot, (_, id)) in ids.iter_mut().zip(scored) {
        *slot = id;
    }
}

#[allow(clippy::cast_precision_loss)]
fn ucb1_score(arm: Option<&ArmState>, total_trials: u64, exploration: f64) -> f64 {
    let Some(arm) = arm.filter(|arm| arm.trials > 0) else {
        return f64::INFINITY;
    };

    let mean = arm.total_reward / arm.trials as f64;
    let total = total_trials.max(1) as f64;
    mean + exploration * (total.ln() / arm.trials as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::arm::Feedback;

    fn params(strategy: StrategyKind) -> ArmParams {
        ArmParams {
            strategy,
            epsilon: 0.0,
            exploration: 0.5,
            failure_threshold: 2,
            cooldown_ms: 60_000,
        }
    }

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    fn arm_with(id: &str, successes: u32, failures: u32, now: Timestamp) -> ArmState {
        let mut arm = ArmState::new(id, params(StrategyKind::Ucb1), now);
        arm.params.failure_threshold = u32::MAX;
        for _ in 0..successes {
            arm.apply(&Feedback::success(10), now);
        }
        for _ in 0..failures {
            arm.apply(&Feedback::failure(10), now);
        }
        arm
    }

    #[test]
    fn untried_arms_keep_configured_order() {
        let now = Timestamp::now();
        let mut rng = StdRng::seed_from_u64(7);

        let ranked = rank_candidates(
            &ids(&["a", "b", "c"]),
            &HashMap::new(),
            &params(StrategyKind::Ucb1),
            now,
            &mut rng,
        );

        assert_eq!(ranked, ids(&["a", "b", "c"]));
    }

    #[test]
    fn ucb_prefers_better_arm() {
        let now = Timestamp::now();
        let mut rng = StdRng::seed_from_u64(7);
        let states = HashMap::from([
            ("a".to_string(), arm_with("a", 2, 8, now)),
            ("b".to_string(), arm_with("b", 9, 1, now)),
        ]);

        let ranked = rank_candidates(&ids(&["a", "b"]), &states, &params(StrategyKind::Ucb1), now, &mut rng);

        assert_eq!(ranked, ids(&["b", "a"]));
    }

    #[test]
    fn greedy_exploits_when_epsilon_is_zero() {
        let now = Timestamp::now();
        let mut rng = StdRng::seed_from_u64(7);
        let states = HashMap::from([
            ("a".to_string(), arm_with("a", 1, 3, now)),
            ("b".to_string(), arm_with("b", 3, 1, now)),
        ]);

        let ranked = rank_candidates(
            &ids(&["a", "b"]),
            &states,
            &params(StrategyKind::EpsilonGreedy),
            now,
            &mut rng,
        );

        assert_eq!(ranked, ids(&["b", "a"]));
    }

    #[test]
    fn cooling_arms_are_excluded() {
        let now = Timestamp::now();
        let mut rng = StdRng::seed_from_u64(7);
        let mut cooling = ArmState::new("a", params(StrategyKind::Ucb1), now);
        cooling.apply(&Feedback::failure(10), now);
        cooling.apply(&Feedback::failure(10), now);
        assert!(cooling.is_in_cooldown(now));

        let states = HashMap::from([("a".to_string(), cooling)]);
        let ranked = rank_candidates(&ids(&["a", "b"]), &states, &params(StrategyKind::Ucb1), now, &mut rng);

        assert_eq!(ranked, ids(&["b"]));
    }

    #[test]
    fn all_cooling_returns_soonest_expiry() {
        let now = Timestamp::now();
        let mut rng = StdRng::seed_from_u64(7);

        let mut a = ArmState::new("a", params(StrategyKind::Ucb1), now);
        a.cooldown_until = Some(now + jiff::SignedDuration::from_secs(30));
        let mut b = ArmState::new("b", params(StrategyKind::Ucb1), now);
        b.cooldown_until = Some(now + jiff::SignedDuration::from_secs(10));

        let states = HashMap::from([("a".to_string(), a), ("b".to_string(), b)]);
        let ranked = rank_candidates(&ids(&["a", "b"]), &states, &params(StrategyKind::Ucb1), now, &mut rng);

        assert_eq!(ranked, ids(&["b"]));
    }
}
