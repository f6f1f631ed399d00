use async_trait::async_trait;
use conduit_core::{Channel, Context, ErrorCode, GatewayError, Step, StepResult};

/// Rejects requests the pipeline cannot serve
///
/// Only checks what later steps rely on. Protocol schema checks belong to
/// the HTTP layer.
#[derive(Debug, Default, Clone, Copy)]
pub struct ValidationStep;

fn invalid(message: impl Into<String>) -> GatewayError {
    GatewayError::client(ErrorCode::InvalidRequest, message)
}

#[async_trait]
impl Step for ValidationStep {
    fn name(&self) -> &'static str {
        "validation"
    }

    async fn execute(&self, ctx: &mut Context) -> Result<StepResult, GatewayError> {
        let capability = ctx.identity.capability;

        if ctx.request.model.trim().is_empty() {
            return Err(invalid("model is required"));
        }

        if !ctx.request.body.is_object() {
            return Err(invalid("request body must be a JSON object"));
        }

        if ctx.request.stream && !capability.supports_streaming() {
            return Err(invalid(format!("{capability} responses cannot be streamed")));
        }

        if ctx.identity.channel == Channel::External && ctx.identity.tenant_id.is_none() {
            return Err(invalid("external requests must identify a tenant"));
        }

        Ok(StepResult::success())
    }
}

#[cfg(test)]
mod tests {
    use conduit_core::{Capability, RequestIdentity, RequestPayload};
    use serde_json::{Value, json};

    use super::*;

    fn context(channel: Channel, capability: Capability, body: Value, stream: bool) -> Context {
        let mut identity = RequestIdentity::new(channel, capability);
        identity.tenant_id = Some("t1".to_string());
        Context::new(
            identity,
            RequestPayload {
                model: "gpt-4o".to_string(),
                body,
                stream,
            },
        )
    }

    #[tokio::test]
    async fn accepts_well_formed_requests() {
        let mut ctx = context(Channel::External, Capability::Chat, json!({"messages": []}), true);
        assert!(ValidationStep.execute(&mut ctx).await.is_ok());
    }

    #[tokio::test]
    async fn rejects_streaming_for_batch_capabilities() {
        let mut ctx = context(Channel::Internal, Capability::Embedding, json!({"input": "x"}), true);
        let err = ValidationStep.execute(&mut ctx).await.unwrap_err();

        assert_eq!(err.code, ErrorCode::InvalidRequest);
        assert!(err.message.contains("embedding"));
    }

    #[tokio::test]
    async fn rejects_non_object_bodies_and_missing_model() {
        let mut ctx = context(Channel::Internal, Capability::Chat, json!(["not", "an", "object"]), false);
        assert!(ValidationStep.execute(&mut ctx).await.is_err());

        let mut ctx = context(Channel::Internal, Capability::Chat, json!({}), false);
        ctx.request.model = "  ".to_string();
        let err = ValidationStep.execute(&mut ctx).await.unwrap_err();
        assert_eq!(err.message, "model is required");
    }

    #[tokio::test]
    async fn external_traffic_needs_a_tenant() {
        let mut ctx = context(Channel::External, Capability::Chat, json!({}), false);
        ctx.identity.tenant_id = None;
        assert!(ValidationStep.execute(&mut ctx).await.is_err());

        ctx.identity.channel = Channel::Internal;
        assert!(ValidationStep.execute(&mut ctx).await.is_ok());
    }
}
