//! Workflow step that calls the selected candidate

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use conduit_bandit::{BanditState, Feedback};
use conduit_config::UpstreamConfig;
use conduit_core::keys::{
    BILLING_PENDING, RENDERED_BODY, ROUTING_AFFINITY_KEY, ROUTING_CANDIDATES, ROUTING_INDEX, RenderedBody,
    UPSTREAM_RESPONSE, UPSTREAM_STREAM, UpstreamResponse, current_candidate,
};
use conduit_core::{
    AuthScheme, BillingAccumulator, Candidate, Context, ContextKey, ErrorCode, FailureAction, GatewayError, Micros,
    SecretStore, Step, StepResult, render_body,
};
use http::header::{AUTHORIZATION, CONTENT_TYPE, HeaderName};
use http::{HeaderMap, HeaderValue};
use secrecy::ExposeSecret;
use serde_json::Value;

use crate::affinity::AffinityTracker;
use crate::circuit::CircuitBreaker;
use crate::client::{OutboundRequest, SafeClient};
use crate::error::UpstreamError;
use crate::poll::await_task;
use crate::sse::extract_usage;
use crate::stream::{
    CancelRegistry, CancelWatch, CompletionContext, StreamCompletionHook, StreamLimits, StreamOutcome, StreamUsage,
    meter_stream,
};

/// Executions of the upstream step for this request, across candidates
pub const UPSTREAM_ATTEMPTS: ContextKey<u32> = ContextKey::new("upstream", "attempts");

/// Rough token count for a JSON payload
pub fn estimate_tokens(value: &Value) -> u64 {
    let len = serde_json::to_vec(value).map_or(0, |bytes| bytes.len());
    u64::try_from(len).unwrap_or(u64::MAX).div_ceil(4).max(1)
}

struct IgnoreCompletion;

#[async_trait]
impl StreamCompletionHook for IgnoreCompletion {
    async fn on_complete(&self, context: CompletionContext, usage: StreamUsage) {
        tracing::debug!(trace_id = %context.trace_id, outcome = usage.outcome.as_str(), "stream completion not handled");
    }
}

/// Why a call counted as failed, detached from the error that said so
struct CallFailure {
    message: String,
    outcome: &'static str,
    trips_breaker: bool,
}

impl From<&UpstreamError> for CallFailure {
    fn from(e: &UpstreamError) -> Self {
        Self {
            message: e.to_string(),
            outcome: e.outcome(),
            trips_breaker: e.is_breaker_failure(),
        }
    }
}

impl From<&GatewayError> for CallFailure {
    fn from(e: &GatewayError) -> Self {
        Self {
            message: e.message.clone(),
            outcome: e.code.as_str(),
            trips_breaker: matches!(
                e.code,
                ErrorCode::UpstreamTimeout
                    | ErrorCode::UpstreamNetwork
                    | ErrorCode::UpstreamServerError
                    | ErrorCode::UpstreamRateLimited
            ),
        }
    }
}

/// One finished call to a candidate
struct CallOutcome {
    trace_id: String,
    candidate: Candidate,
    affinity_key: Option<String>,
    status: Option<u16>,
    latency: Duration,
    cost_micros: Micros,
    failure: Option<CallFailure>,
}

/// Breaker, bandit and affinity state fed by every finished call
#[derive(Clone)]
struct RoutingFeedback {
    breaker: Arc<CircuitBreaker>,
    bandit: Arc<BanditState>,
    affinity: Option<Arc<AffinityTracker>>,
}

impl RoutingFeedback {
    async fn record(&self, call: CallOutcome) {
        let candidate = &call.candidate;
        let latency_ms = u64::try_from(call.latency.as_millis()).unwrap_or(u64::MAX);
        let breaker_key = candidate.breaker_key();

        let feedback = match &call.failure {
            None => {
                self.breaker.record_success(&breaker_key).await;
                Feedback {
                    cost_micros: call.cost_micros,
                    ..Feedback::success(latency_ms)
                }
            }
            Some(failure) => {
                if failure.trips_breaker {
                    self.breaker.record_failure(&breaker_key).await;
                }
                tracing::warn!(
                    trace_id = %call.trace_id,
                    candidate = %candidate.id,
                    latency_ms,
                    error = %failure.message,
                    "upstream call failed"
                );
                Feedback::failure(latency_ms)
            }
        };

        let params = self.bandit.default_params().with_overrides(
            candidate.routing.strategy.as_deref(),
            candidate.routing.failure_threshold,
            candidate.routing.cooldown,
        );
        if let Err(e) = self.bandit.record_feedback(&candidate.id, feedback, params).await {
            tracing::warn!(candidate = %candidate.id, error = %e, "failed to record bandit feedback");
        }

        if let (Some(affinity), Some(key)) = (&self.affinity, &call.affinity_key) {
            match call.failure {
                None => affinity.record_success(key, &candidate.id).await,
                Some(_) => affinity.record_failure(key, &candidate.id).await,
            }
        }

        conduit_telemetry::metrics::record_upstream_call(
            &candidate.provider,
            call.failure.as_ref().map_or("success", |f| f.outcome),
            call.status,
            call.latency,
        );
    }
}

/// Feeds a stream's final outcome to routing state, then settles it
///
/// Client cancellation and disconnects say nothing against the upstream and
/// count as successes.
struct StreamFeedback {
    feedback: RoutingFeedback,
    candidate: Candidate,
    affinity_key: Option<String>,
    status: Option<u16>,
    started: Instant,
    inner: Arc<dyn StreamCompletionHook>,
}

#[async_trait]
impl StreamCompletionHook for StreamFeedback {
    async fn on_complete(&self, context: CompletionContext, usage: StreamUsage) {
        let outcome = CallOutcome {
            trace_id: context.trace_id.clone(),
            candidate: self.candidate.clone(),
            affinity_key: self.affinity_key.clone(),
            status: self.status,
            latency: self.started.elapsed(),
            cost_micros: context.pricing.cost(usage.input_tokens, usage.output_tokens),
            failure: match &usage.outcome {
                StreamOutcome::Failed(error) => Some(CallFailure::from(error)),
                StreamOutcome::Completed | StreamOutcome::Cancelled | StreamOutcome::Disconnected => None,
            },
        };

        self.inner.on_complete(context, usage).await;
        self.feedback.record(outcome).await;
    }
}

/// Calls the current candidate, buffered, streamed or as an async task
pub struct UpstreamCallStep {
    client: Arc<SafeClient>,
    feedback: RoutingFeedback,
    secrets: Arc<dyn SecretStore>,
    cancel: Option<Arc<CancelRegistry>>,
    hook: Arc<dyn StreamCompletionHook>,
    limits: StreamLimits,
    max_retries: u32,
    cancel_check_interval: Duration,
}

impl UpstreamCallStep {
    pub fn new(
        client: Arc<SafeClient>,
        breaker: Arc<CircuitBreaker>,
        bandit: Arc<BanditState>,
        secrets: Arc<dyn SecretStore>,
        config: &UpstreamConfig,
    ) -> Self {
        Self {
            client,
            feedback: RoutingFeedback {
                breaker,
                bandit,
                affinity: None,
            },
            secrets,
            cancel: None,
            hook: Arc::new(IgnoreCompletion),
            limits: StreamLimits::from_config(config),
            max_retries: config.max_retries,
            cancel_check_interval: config.cancel_check_interval,
        }
    }

    #[must_use]
    pub fn with_affinity(mut self, affinity: Arc<AffinityTracker>) -> Self {
        self.feedback.affinity = Some(affinity);
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, registry: Arc<CancelRegistry>) -> Self {
        self.cancel = Some(registry);
        self
    }

    /// Hook that settles streamed responses once they end
    #[must_use]
    pub fn with_completion_hook(mut self, hook: Arc<dyn StreamCompletionHook>) -> Self {
        self.hook = hook;
        self
    }

    /// Body rendered for this candidate, re-rendering after a fallback
    fn body_for(ctx: &mut Context, candidate: &Candidate) -> Result<Value, GatewayError> {
        if let Some(rendered) = ctx.blackboard.get(&RENDERED_BODY)
            && rendered.candidate_id == candidate.id
        {
            return Ok(rendered.body.clone());
        }

        let body = render_body(candidate, &ctx.request)?;
        ctx.blackboard.insert(
            &RENDERED_BODY,
            RenderedBody {
                candidate_id: candidate.id.clone(),
                body: body.clone(),
            },
        );
        Ok(body)
    }

    async fn auth_headers(&self, candidate: &Candidate) -> Result<HeaderMap, GatewayError> {
        let mut headers = HeaderMap::new();
        let Some(secret_ref) = candidate.auth.secret_ref.as_deref() else {
            return Ok(headers);
        };

        let (name, value) = match &candidate.auth.scheme {
            AuthScheme::None => return Ok(headers),
            AuthScheme::Bearer => (AUTHORIZATION, "Bearer "),
            AuthScheme::Header { name } => (
                HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                    GatewayError::internal(format!("invalid auth header name for {}", candidate.id))
                })?,
                "",
            ),
        };

        let secret = self
            .secrets
            .resolve(&candidate.provider, secret_ref)
            .await?
            .ok_or_else(|| UpstreamError::SecretMissing {
                provider: candidate.provider.clone(),
                secret_ref: secret_ref.to_string(),
            })?;

        let mut value = HeaderValue::from_str(&format!("{value}{}", secret.expose_secret()))
            .map_err(|_| GatewayError::internal(format!("credential for {} is not a valid header", candidate.id)))?;
        value.set_sensitive(true);
        headers.insert(name, value);
        Ok(headers)
    }

    async fn call_buffered(
        &self,
        ctx: &mut Context,
        candidate: &Candidate,
        body: &Value,
        headers: HeaderMap,
    ) -> Result<(), UpstreamError> {
        let request = OutboundRequest::post_json(candidate.upstream_url.clone(), headers.clone(), body)?;
        let response = self.client.send(&request).await?;

        let status = response.status().as_u16();
        ctx.upstream.status = Some(status);
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = self.client.read_body(response).await?;

        if !(200..300).contains(&status) {
            return Err(UpstreamError::from_status(status, &bytes));
        }

        let mut value: Value = serde_json::from_slice(&bytes)
            .map_err(|e| UpstreamError::InvalidResponse(format!("response is not JSON: {e}")))?;
        if let Some(task) = &candidate.transform.async_task {
            value = await_task(&self.client, &value, task, &headers).await?;
        }

        let usage = extract_usage(&value);
        let input_tokens = usage.input_tokens.unwrap_or_else(|| estimate_tokens(body));
        let output_tokens = usage.output_tokens.unwrap_or(0);
        ctx.billing = BillingAccumulator {
            input_tokens,
            output_tokens,
            cost_micros: candidate.pricing.cost(input_tokens, output_tokens),
            estimated: usage.input_tokens.is_none(),
        };

        ctx.blackboard.insert(
            &UPSTREAM_RESPONSE,
            UpstreamResponse {
                status,
                content_type,
                body: value,
            },
        );
        Ok(())
    }

    async fn call_streaming(
        &self,
        ctx: &mut Context,
        candidate: &Candidate,
        body: &Value,
        headers: HeaderMap,
        started: Instant,
    ) -> Result<(), UpstreamError> {
        let request = OutboundRequest::post_json(candidate.upstream_url.clone(), headers, body)?;
        let response = self.client.send(&request).await?;

        let status = response.status();
        ctx.upstream.status = Some(status.as_u16());
        if !status.is_success() {
            let bytes = self.client.read_body(response).await?;
            return Err(UpstreamError::from_status(status.as_u16(), &bytes));
        }

        let identity = &ctx.identity;
        let estimated_input_tokens = estimate_tokens(body);
        let context = CompletionContext {
            trace_id: identity.trace_id.clone(),
            capability: identity.capability,
            tenant_id: identity.tenant_id.clone(),
            user_id: identity.user_id.clone(),
            candidate_id: candidate.id.clone(),
            provider: candidate.provider.clone(),
            model: candidate.model.clone(),
            pricing: candidate.pricing,
            pending: ctx.blackboard.get(&BILLING_PENDING).cloned(),
            estimated_input_tokens,
        };
        let watch = self.cancel.as_ref().map(|registry| {
            let key = CancelRegistry::key(identity.capability, identity.user_id.as_deref(), &identity.trace_id);
            CancelWatch::new(Arc::clone(registry), key, self.cancel_check_interval)
        });

        let hook = Arc::new(StreamFeedback {
            feedback: self.feedback.clone(),
            candidate: candidate.clone(),
            affinity_key: ctx.blackboard.get(&ROUTING_AFFINITY_KEY).cloned(),
            status: ctx.upstream.status,
            started,
            inner: Arc::clone(&self.hook),
        });
        let stream = meter_stream(response.bytes_stream(), context, hook, self.limits, watch);
        ctx.blackboard.insert(&UPSTREAM_STREAM, stream);
        ctx.billing = BillingAccumulator {
            input_tokens: estimated_input_tokens,
            output_tokens: 0,
            cost_micros: 0,
            estimated: true,
        };
        Ok(())
    }
}

#[async_trait]
impl Step for UpstreamCallStep {
    fn name(&self) -> &'static str {
        "upstream_call"
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["template"]
    }

    async fn execute(&self, ctx: &mut Context) -> Result<StepResult, GatewayError> {
        let candidate = current_candidate(ctx)
            .cloned()
            .ok_or_else(|| GatewayError::gateway(ErrorCode::NoCandidates, "no candidate selected"))?;

        let attempts = ctx.blackboard.get(&UPSTREAM_ATTEMPTS).copied().unwrap_or(0) + 1;
        ctx.blackboard.insert(&UPSTREAM_ATTEMPTS, attempts);
        ctx.upstream.retry_count = attempts - 1;
        ctx.upstream.candidate_id = Some(candidate.id.clone());
        ctx.upstream.provider = Some(candidate.provider.clone());
        ctx.upstream.model = Some(candidate.model.clone());
        ctx.upstream.url = Some(candidate.upstream_url.to_string());
        ctx.upstream.status = None;

        let body = Self::body_for(ctx, &candidate)?;
        let headers = self.auth_headers(&candidate).await?;
        self.feedback.breaker.check(&candidate.breaker_key()).await?;

        let streaming = ctx.request.stream
            && ctx.identity.capability.supports_streaming()
            && candidate.transform.async_task.is_none();

        let started = Instant::now();
        let result = if streaming {
            self.call_streaming(ctx, &candidate, &body, headers, started).await
        } else {
            self.call_buffered(ctx, &candidate, &body, headers).await
        };
        let latency = started.elapsed();
        ctx.upstream.latency = Some(latency);

        // a stream that started reports its outcome when it ends
        if !streaming || result.is_err() {
            let outcome = CallOutcome {
                trace_id: ctx.trace_id().to_string(),
                candidate: candidate.clone(),
                affinity_key: ctx.blackboard.get(&ROUTING_AFFINITY_KEY).cloned(),
                status: ctx.upstream.status,
                latency,
                cost_micros: ctx.billing.cost_micros,
                failure: result.as_ref().err().map(CallFailure::from),
            };
            self.feedback.record(outcome).await;
        }
        result?;

        Ok(StepResult::success()
            .with_metadata("candidate", candidate.id)
            .with_metadata("streaming", streaming))
    }

    fn on_failure(&self, _ctx: &Context, error: &GatewayError, attempt: u32) -> FailureAction {
        match error.code {
            ErrorCode::UpstreamTimeout
            | ErrorCode::UpstreamNetwork
            | ErrorCode::UpstreamServerError
            | ErrorCode::UpstreamRateLimited => {
                if attempt < self.max_retries {
                    FailureAction::Retry
                } else {
                    FailureAction::Degrade
                }
            }
            ErrorCode::SecretMissing
            | ErrorCode::CircuitOpen
            | ErrorCode::InvalidUpstreamResponse
            | ErrorCode::AsyncTaskFailed
            | ErrorCode::AsyncTaskTimeout => FailureAction::Degrade,
            _ => FailureAction::Abort,
        }
    }

    async fn on_degrade(&self, ctx: &mut Context, error: &GatewayError) -> StepResult {
        let total = ctx.blackboard.get(&ROUTING_CANDIDATES).map_or(0, Vec::len);
        let index = ctx.blackboard.get(&ROUTING_INDEX).copied().unwrap_or(0);
        let next = index + 1;

        let Some(target) = ctx
            .blackboard
            .get(&ROUTING_CANDIDATES)
            .and_then(|candidates| candidates.get(next))
            .map(|c| c.id.clone())
        else {
            return StepResult::failed(format!("all {total} candidates failed, last error: {}", error.message));
        };

        tracing::info!(
            trace_id = %ctx.trace_id(),
            to = %target,
            error = %error.code,
            "falling back to next candidate"
        );
        ctx.blackboard.insert(&ROUTING_INDEX, next);
        StepResult::degraded(format!("switched to {target}")).with_metadata("candidate", target)
    }
}

impl std::fmt::Debug for UpstreamCallStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamCallStep")
            .field("max_retries", &self.max_retries)
            .field("affinity", &self.feedback.affinity.is_some())
            .field("cancellation", &self.cancel.is_some())
            .finish_non_exhaustive()
    }
}
