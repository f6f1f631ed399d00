use std::collections::HashMap;
use std::sync::Arc;

use conduit_cache::{CacheLayer, compute_cache_key};
use conduit_config::BanditConfig;
use jiff::Timestamp;
use mini_moka::sync::Cache;

use crate::arm::{ArmParams, ArmState, Feedback};
use crate::error::BanditError;
use crate::repository::ArmRepository;

/// Upper bound on arms kept in the process-local fallback
const LOCAL_CAPACITY: u64 = 10_000;

/// Version domain bumped by every arm write
const ARM_DOMAIN: &str = "arms";

/// Bandit arm state with a shared cache in front of the repository
///
/// Reads go to the shared cache first, then the repository for misses.
/// Concurrent readers missing the same candidate set share one repository
/// load, cached under the arm domain version so that any later arm write
/// retires it. A process-local copy of every arm seen is kept only as a
/// fallback for when both are unreachable.
pub struct BanditState {
    repository: Arc<dyn ArmRepository>,
    cache: CacheLayer,
    local: Cache<String, ArmState>,
    config: BanditConfig,
}

impl std::fmt::Debug for BanditState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BanditState")
            .field("local_arms", &self.local.entry_count())
            .finish_non_exhaustive()
    }
}

fn cache_key(candidate_id: &str) -> String {
    format!("arm:{candidate_id}")
}

impl BanditState {
    pub fn new(repository: Arc<dyn ArmRepository>, cache: &CacheLayer, config: BanditConfig) -> Self {
        Self {
            repository,
            cache: cache.scoped("bandit"),
            local: Cache::new(LOCAL_CAPACITY),
            config,
        }
    }

    /// Parameters applied to arms without overrides
    pub fn default_params(&self) -> ArmParams {
        ArmParams::from_config(&self.config)
    }

    async fn remember(&self, arm: &ArmState) {
        self.local.insert(arm.candidate_id.clone(), arm.clone());

        if let Err(e) = self
            .cache
            .set(&cache_key(&arm.candidate_id), arm, Some(self.config.cache_ttl))
            .await
        {
            tracing::debug!(candidate = %arm.candidate_id, error = %e, "failed to cache arm state");
        }
    }

    /// Arm for a candidate, creating it with `params` when absent
    pub async fn ensure_state(&self, candidate_id: &str, params: ArmParams) -> Result<ArmState, BanditError> {
        if let Some(arm) = self.repository.load(candidate_id).await? {
            return Ok(arm);
        }

        let arm = self
            .repository
            .insert_if_absent(ArmState::new(candidate_id, params, Timestamp::now()))
            .await?;
        self.remember(&arm).await;

        Ok(arm)
    }

    /// Fold an outcome into the candidate's arm
    ///
    /// Retries on version conflicts. When the repository is unreachable the
    /// outcome is still applied to the local fallback copy so cooldowns keep
    /// working in this process, and the repository error is returned.
    pub async fn record_feedback(
        &self,
        candidate_id: &str,
        feedback: Feedback,
        params: ArmParams,
    ) -> Result<ArmState, BanditError> {
        let attempts = self.config.max_update_retries.max(1);

        for _ in 0..attempts {
            let current = match self.ensure_state(candidate_id, params).await {
                Ok(arm) => arm,
                Err(e) => {
                    self.apply_locally(candidate_id, &feedback, params);
                    return Err(e);
                }
            };

            let mut next = current.clone();
            next.params = params;
            next.apply(&feedback, Timestamp::now());

            match self.repository.update_if_version(&next, current.version).await {
                Ok(true) => {
                    if next.is_in_cooldown(Timestamp::now()) && !current.is_in_cooldown(Timestamp::now()) {
                        tracing::warn!(
                            candidate = candidate_id,
                            failures = next.consecutive_failures,
                            cooldown_ms = params.cooldown_ms,
                            "candidate entered cooldown"
                        );
                    }
                    self.remember(&next).await;
                    if let Err(e) = self.cache.bump_version(ARM_DOMAIN).await {
                        tracing::debug!(candidate = candidate_id, error = %e, "failed to retire cached arm loads");
                    }
                    return Ok(next);
                }
                Ok(false) => {
                    tracing::debug!(candidate = candidate_id, "arm version conflict, retrying");
                }
                Err(e) => {
                    self.apply_locally(candidate_id, &feedback, params);
                    return Err(e);
                }
            }
        }

        Err(BanditError::Conflict {
            candidate_id: candidate_id.to_string(),
            attempts,
        })
    }

    fn apply_locally(&self, candidate_id: &str, feedback: &Feedback, params: ArmParams) {
        let now = Timestamp::now();
        let mut arm = self
            .local
            .get(&candidate_id.to_string())
            .unwrap_or_else(|| ArmState::new(candidate_id, params, now));
        arm.params = params;
        arm.apply(feedback, now);
        self.local.insert(candidate_id.to_string(), arm);
    }

    /// Known arms for the given candidates
    ///
    /// Never fails: cache and repository errors degrade to the local
    /// fallback. Candidates without any recorded state are absent.
    pub async fn get_states_map(&self, candidate_ids: &[String]) -> HashMap<String, ArmState> {
        let keys: Vec<String> = candidate_ids.iter().map(|id| cache_key(id)).collect();
        let cached: HashMap<String, ArmState> = self.cache.get_many(&keys).await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "arm cache unavailable");
            HashMap::new()
        });

        let mut states: HashMap<String, ArmState> = cached
            .into_values()
            .map(|arm| (arm.candidate_id.clone(), arm))
            .collect();

        let misses: Vec<String> = candidate_ids
            .iter()
            .filter(|id| !states.contains_key(id.as_str()))
            .cloned()
            .collect();

        if misses.is_empty() {
            return states;
        }

        match self.load_misses(&misses).await {
            Ok(loaded) => {
                for arm in loaded.into_values() {
                    self.remember(&arm).await;
                    states.insert(arm.candidate_id.clone(), arm);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "arm repository unavailable, using local state");
                for id in misses {
                    if let Some(arm) = self.local.get(&id) {
                        states.insert(id, arm);
                    }
                }
            }
        }

        states
    }

    /// Repository load for arms the cache missed, single-flight per candidate set
    async fn load_misses(&self, misses: &[String]) -> Result<HashMap<String, ArmState>, BanditError> {
        let version = match self.cache.current_version(ARM_DOMAIN).await {
            Ok(version) => version,
            Err(e) => {
                tracing::debug!(error = %e, "arm cache version unavailable, loading directly");
                return self.repository.load_many(misses).await;
            }
        };

        let key = format!("load:{}", compute_cache_key(&misses));
        self.cache
            .get_or_load(&key, Some(self.config.cache_ttl), Some(version), || {
                self.repository.load_many(misses)
            })
            .await
    }

    pub fn is_in_cooldown(arm: &ArmState, now: Timestamp) -> bool {
        arm.is_in_cooldown(now)
    }
}
