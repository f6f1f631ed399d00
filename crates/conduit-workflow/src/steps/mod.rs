//! Built-in pipeline steps

mod billing;
mod routing;
mod template;
mod validation;

pub use billing::{BillingCommitStep, BillingReserveStep};
pub use routing::RoutingStep;
pub use template::TemplateStep;
pub use validation::ValidationStep;

use conduit_core::{Candidate, Context, ErrorCode, GatewayError, keys};

/// Candidate currently selected by routing, or a `no_candidates` error
fn selected(ctx: &Context) -> Result<&Candidate, GatewayError> {
    keys::current_candidate(ctx)
        .ok_or_else(|| GatewayError::gateway(ErrorCode::NoCandidates, "no candidate selected for the request"))
}

/// Whether the upstream call for the selected candidate will be streamed
fn streams(ctx: &Context, candidate: &Candidate) -> bool {
    ctx.request.stream && ctx.identity.capability.supports_streaming() && candidate.transform.async_task.is_none()
}
