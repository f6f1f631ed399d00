use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::arm::ArmState;
use crate::error::BanditError;

/// Durable arm storage, the source of truth for bandit statistics
#[async_trait]
pub trait ArmRepository: Send + Sync {
    async fn load(&self, candidate_id: &str) -> Result<Option<ArmState>, BanditError>;

    async fn load_many(&self, candidate_ids: &[String]) -> Result<HashMap<String, ArmState>, BanditError>;

    /// Insert `state` unless the arm exists. Returns the stored arm.
    async fn insert_if_absent(&self, state: ArmState) -> Result<ArmState, BanditError>;

    /// Replace the arm only if its stored version is `expected_version`
    async fn update_if_version(&self, state: &ArmState, expected_version: u64) -> Result<bool, BanditError>;
}

/// Arm repository held in process memory
#[derive(Debug, Default)]
pub struct MemoryArmRepository {
    arms: DashMap<String, ArmState>,
}

impl MemoryArmRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArmRepository for MemoryArmRepository {
    async fn load(&self, candidate_id: &str) -> Result<Option<ArmState>, BanditError> {
        Ok(self.arms.get(candidate_id).map(|arm| arm.clone()))
    }

    async fn load_many(&self, candidate_ids: &[String]) -> Result<HashMap<String, ArmState>, BanditError> {
        Ok(candidate_ids
            .iter()
            .filter_map(|id| self.arms.get(id).map(|arm| (id.clone(), arm.clone())))
            .collect())
    }

    async fn insert_if_absent(&self, state: ArmState) -> Result<ArmState, BanditError> {
        let entry = self.arms.entry(state.candidate_id.clone()).or_insert(state);
        Ok(entry.clone())
    }

    async fn update_if_version(&self, state: &ArmState, expected_version: u64) -> Result<bool, BanditError> {
        let Some(mut stored) = self.arms.get_mut(&state.candidate_id) else {
            return Ok(false);
        };

        if stored.version != expected_version {
            return Ok(false);
        }

        *stored = state.clone();
        Ok(true)
    }
}
