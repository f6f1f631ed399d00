//! Request pipeline for the conduit gateway
//!
//! An [`Orchestrator`] runs [`conduit_core::Step`]s in dependency order over
//! a per-request context. [`Engine`] wires the standard pipeline:
//! validation, routing, template rendering, billing reservation, the
//! upstream call and billing commit.

#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

mod candidates;
mod engine;
mod error;
mod finalizer;
mod orchestrator;
pub mod steps;
#[cfg(test)]
mod testing;

pub use candidates::{StaticCandidateSource, secrets_from_config};
pub use engine::{Engine, EngineParts, EngineResponse, FailedRequest, ResponseBody};
pub use error::WorkflowError;
pub use finalizer::BillingFinalizer;
pub use orchestrator::Orchestrator;
