/// Errors returned by bandit state operations
#[derive(Debug, thiserror::Error)]
pub enum BanditError {
    /// Arm repository failed
    #[error("arm repository error: {0}")]
    Repository(String),

    /// Concurrent writers kept winning the version race
    #[error("gave up updating arm {candidate_id} after {attempts} conflicting attempts")]
    Conflict {
        /// Arm being updated
        candidate_id: String,
        /// Attempts made
        attempts: u32,
    },
}
