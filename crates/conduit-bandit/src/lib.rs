//! Per-candidate bandit state
//!
//! Every upstream outcome is folded into the candidate's [`ArmState`].
//! Consecutive failures past a threshold put the arm into cooldown, and
//! [`rank_candidates`] orders candidates from these statistics.

#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

mod arm;
mod error;
mod repository;
mod select;
mod state;

pub use arm::{ArmParams, ArmState, Feedback, strategy_from_name};
pub use error::BanditError;
pub use repository::{ArmRepository, MemoryArmRepository};
pub use select::rank_candidates;
pub use state::BanditState;
