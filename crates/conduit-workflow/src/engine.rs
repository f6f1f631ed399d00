use std::fmt;
use std::sync::Arc;

use conduit_bandit::{ArmRepository, BanditState, MemoryArmRepository};
use conduit_billing::{LedgerStore, MemoryLedgerStore, QuotaLedger};
use conduit_cache::CacheLayer;
use conduit_config::{Config, StoreConfig};
use conduit_core::keys::{ByteStream, UPSTREAM_RESPONSE, UPSTREAM_STREAM};
use conduit_core::{
    BillingAccumulator, CandidateSource, Capability, Context, GatewayError, HistorySink, LogStatusSink,
    RequestIdentity, RequestPayload, SecretStore, StatusReporter, StatusSink, Step, UpstreamSummary,
};
use conduit_store::{MemoryStore, RedisStore, SharedStore};
use conduit_upstream::{AffinityTracker, CancelRegistry, CircuitBreaker, SafeClient, UpstreamCallStep};
use serde_json::{Value, json};

use crate::candidates::{StaticCandidateSource, secrets_from_config};
use crate::error::WorkflowError;
use crate::finalizer::BillingFinalizer;
use crate::orchestrator::Orchestrator;
use crate::steps::{BillingCommitStep, BillingReserveStep, RoutingStep, TemplateStep, ValidationStep};

/// Collaborators the engine is assembled from
pub struct EngineParts {
    pub store: Arc<dyn SharedStore>,
    pub ledger_store: Arc<dyn LedgerStore>,
    pub arms: Arc<dyn ArmRepository>,
    pub candidates: Arc<dyn CandidateSource>,
    pub secrets: Arc<dyn SecretStore>,
    pub history: Option<Arc<dyn HistorySink>>,
    pub status: Option<Arc<dyn StatusSink>>,
}

impl fmt::Debug for EngineParts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineParts")
            .field("store", &self.store.backend())
            .field("history", &self.history.is_some())
            .field("status", &self.status.is_some())
            .finish_non_exhaustive()
    }
}

/// Response body handed back to the caller
pub enum ResponseBody {
    Json(Value),
    /// SSE bytes, billed when the stream ends
    Stream(ByteStream),
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(value) => f.debug_tuple("Json").field(value).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Successful pipeline run
#[derive(Debug)]
pub struct EngineResponse {
    pub trace_id: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: ResponseBody,
    pub billing: BillingAccumulator,
    pub upstream: UpstreamSummary,
}

/// Failed pipeline run
#[derive(Debug, Clone)]
pub struct FailedRequest {
    pub trace_id: String,
    pub error: GatewayError,
    pub upstream: UpstreamSummary,
}

impl FailedRequest {
    /// Client-facing error body
    pub fn to_json(&self) -> Value {
        json!({
            "error": {
                "code": self.error.code.as_str(),
                "message": self.error.message,
                "source": self.error.source,
                "trace_id": self.trace_id,
            }
        })
    }
}

impl fmt::Display for FailedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request {} failed: {}", self.trace_id, self.error)
    }
}

impl std::error::Error for FailedRequest {}

/// The request pipeline with its shared state
///
/// One engine serves many concurrent requests. Each request gets its own
/// [`Context`]; circuit, bandit, affinity and quota state is shared through
/// the store.
pub struct Engine {
    orchestrator: Orchestrator,
    ledger: Arc<QuotaLedger>,
    cancel: Arc<CancelRegistry>,
    store: Arc<dyn SharedStore>,
}

impl Engine {
    /// Build an engine over the configured store, with in-memory ledger and arm storage
    ///
    /// Configured tenants are seeded into the ledger.
    pub async fn from_config(config: &Config) -> Result<Self, WorkflowError> {
        let store: Arc<dyn SharedStore> = match &config.store {
            StoreConfig::Memory => Arc::new(MemoryStore::new()),
            StoreConfig::Redis(redis) => Arc::new(RedisStore::connect(redis.url.as_str(), redis.key_prefix.clone()).await?),
        };

        let parts = EngineParts {
            store,
            ledger_store: Arc::new(MemoryLedgerStore::new()),
            arms: Arc::new(MemoryArmRepository::new()),
            candidates: Arc::new(StaticCandidateSource::from_routes(&config.routes)?),
            secrets: Arc::new(secrets_from_config(config)?),
            history: None,
            status: Some(Arc::new(LogStatusSink)),
        };

        let engine = Self::assemble(config, parts)?;
        engine.ledger.seed_tenants().await?;
        Ok(engine)
    }

    /// Wire the pipeline from explicit collaborators
    ///
    /// Must be called within a Tokio runtime when a status sink is given.
    pub fn assemble(config: &Config, parts: EngineParts) -> Result<Self, WorkflowError> {
        let store = parts.store;
        let cache = CacheLayer::new(Arc::clone(&store), config.cache.clone());
        let bandit = Arc::new(BanditState::new(parts.arms, &cache, config.bandit.clone()));
        let ledger = Arc::new(QuotaLedger::new(
            parts.ledger_store,
            Some(Arc::clone(&store)),
            config.billing.clone(),
        ));

        let client = SafeClient::new(&config.upstream)?;

        let breaker = Arc::new(CircuitBreaker::new(Arc::clone(&store), &config.circuit_breaker));
        let cancel = Arc::new(CancelRegistry::new(Arc::clone(&store)));
        let affinity = Arc::new(AffinityTracker::new(Arc::clone(&store), config.upstream.affinity.clone()));
        let finalizer = Arc::new(BillingFinalizer::new(Arc::clone(&ledger), parts.history));

        let upstream = UpstreamCallStep::new(Arc::new(client), breaker, Arc::clone(&bandit), parts.secrets, &config.upstream)
            .with_affinity(Arc::clone(&affinity))
            .with_cancellation(Arc::clone(&cancel))
            .with_completion_hook(finalizer);

        let steps: Vec<Arc<dyn Step>> = vec![
            Arc::new(ValidationStep),
            Arc::new(RoutingStep::new(parts.candidates, bandit).with_affinity(affinity)),
            Arc::new(TemplateStep),
            Arc::new(BillingReserveStep::new(Arc::clone(&ledger))),
            Arc::new(upstream),
            Arc::new(BillingCommitStep::new(Arc::clone(&ledger))),
        ];

        let mut orchestrator = Orchestrator::new(steps)?;
        if let Some(sink) = parts.status {
            orchestrator = orchestrator.with_status_reporter(StatusReporter::new(sink));
        }

        tracing::debug!(
            steps = ?orchestrator.step_names(),
            store = store.backend(),
            "assembled request pipeline"
        );

        Ok(Self {
            orchestrator,
            ledger,
            cancel,
            store,
        })
    }

    #[must_use]
    pub fn with_orchestrator(mut self, configure: impl FnOnce(Orchestrator) -> Orchestrator) -> Self {
        self.orchestrator = configure(self.orchestrator);
        self
    }

    /// Run one request through the pipeline
    pub async fn execute(
        &self,
        identity: RequestIdentity,
        request: RequestPayload,
    ) -> Result<EngineResponse, FailedRequest> {
        let mut ctx = Context::new(identity, request);

        if let Err(error) = self.orchestrator.run(&mut ctx).await {
            return Err(FailedRequest {
                trace_id: ctx.identity.trace_id,
                error,
                upstream: ctx.upstream,
            });
        }

        let (status, content_type, body) = if let Some(stream) = ctx.blackboard.remove(&UPSTREAM_STREAM) {
            let status = ctx.upstream.status.unwrap_or(200);
            (status, Some("text/event-stream".to_string()), ResponseBody::Stream(stream))
        } else if let Some(response) = ctx.blackboard.remove(&UPSTREAM_RESPONSE) {
            (response.status, response.content_type, ResponseBody::Json(response.body))
        } else {
            return Err(FailedRequest {
                trace_id: ctx.identity.trace_id,
                error: GatewayError::internal("pipeline finished without a response"),
                upstream: ctx.upstream,
            });
        };

        Ok(EngineResponse {
            trace_id: ctx.identity.trace_id,
            status,
            content_type,
            body,
            billing: ctx.billing,
            upstream: ctx.upstream,
        })
    }

    /// Ask an in-flight stream to stop
    pub async fn cancel(
        &self,
        capability: Capability,
        user_id: Option<&str>,
        request_id: &str,
    ) -> Result<(), WorkflowError> {
        self.cancel.cancel(capability, user_id, request_id).await?;
        tracing::info!(%capability, request_id, "cancellation requested");
        Ok(())
    }

    pub const fn ledger(&self) -> &Arc<QuotaLedger> {
        &self.ledger
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.orchestrator.step_names()
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("orchestrator", &self.orchestrator)
            .field("store", &self.store.backend())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use conduit_core::{Channel, ErrorCode};

    use super::*;

    #[tokio::test]
    async fn builds_the_standard_pipeline() {
        let engine = Engine::from_config(&Config::default()).await.unwrap();

        assert_eq!(
            engine.step_names(),
            vec![
                "validation",
                "routing",
                "template",
                "billing.reserve",
                "upstream_call",
                "billing.commit"
            ]
        );
    }

    #[tokio::test]
    async fn unknown_models_fail_with_a_structured_error() {
        let engine = Engine::from_config(&Config::default()).await.unwrap();
        let identity = RequestIdentity::new(Channel::Internal, Capability::Chat);
        let request = RequestPayload {
            model: "missing".to_string(),
            body: json!({"messages": []}),
            stream: false,
        };

        let failed = engine.execute(identity, request).await.unwrap_err();

        assert_eq!(failed.error.code, ErrorCode::NoCandidates);
        let body = failed.to_json();
        assert_eq!(body["error"]["code"], "no_candidates");
        assert_eq!(body["error"]["source"], "client");
        assert_eq!(body["error"]["trace_id"], failed.trace_id.as_str());
    }
}
