use async_trait::async_trait;
use conduit_core::keys::{RENDERED_BODY, RenderedBody};
use conduit_core::{Context, GatewayError, Step, StepResult, render_body};

use super::selected;

/// Renders the request body for the selected candidate
#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateStep;

#[async_trait]
impl Step for TemplateStep {
    fn name(&self) -> &'static str {
        "template"
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["routing"]
    }

    async fn execute(&self, ctx: &mut Context) -> Result<StepResult, GatewayError> {
        let candidate = selected(ctx)?;
        let rendered = RenderedBody {
            candidate_id: candidate.id.clone(),
            body: render_body(candidate, &ctx.request)?,
        };

        let result = StepResult::success().with_metadata("candidate", rendered.candidate_id.clone());
        ctx.blackboard.insert(&RENDERED_BODY, rendered);
        Ok(result)
    }
}
