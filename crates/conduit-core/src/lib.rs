//! Request context, step contract and error model shared by the conduit crates

#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

mod candidate;
mod collaborators;
mod context;
mod error;
mod events;
pub mod keys;
mod step;
mod template;

pub use candidate::{
    AsyncTaskConfig, AuthConfig, AuthScheme, Candidate, MICROS_PER_UNIT, Micros, Pricing, ResultShape,
    RoutingParams, TransformConfig, micros_from_decimal,
};
pub use collaborators::{CandidateSource, HistoryRecord, HistorySink, SecretStore, StaticSecretStore};
pub use context::{
    BillingAccumulator, Blackboard, Capability, Channel, Context, ContextKey, RequestIdentity, RequestPayload,
    UpstreamSummary,
};
pub use error::{ErrorCode, ErrorSource, GatewayError, HttpError, IntoGatewayError, best_effort};
pub use events::{EventStage, EventState, LogStatusSink, StatusEvent, StatusReporter, StatusSink};
pub use step::{FailureAction, Step, StepResult, StepStatus};
pub use template::render_body;
