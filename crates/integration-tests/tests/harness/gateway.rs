//! Engine wired over in-memory collaborators

use std::sync::Arc;
use std::time::Duration;

use conduit_bandit::{ArmRepository, ArmState, MemoryArmRepository};
use conduit_billing::{MemoryLedgerStore, QuotaLedger};
use conduit_config::Config;
use conduit_core::{Capability, Channel, RequestIdentity, RequestPayload};
use conduit_store::MemoryStore;
use conduit_workflow::{Engine, EngineParts, EngineResponse, FailedRequest, StaticCandidateSource, secrets_from_config};
use serde_json::{Value, json};

/// A request pipeline sharing nothing with other tests
pub struct TestGateway {
    engine: Engine,
    arms: Arc<MemoryArmRepository>,
}

impl TestGateway {
    pub async fn start(config: &Config) -> Self {
        let arms = Arc::new(MemoryArmRepository::new());
        let parts = EngineParts {
            store: Arc::new(MemoryStore::new()),
            ledger_store: Arc::new(MemoryLedgerStore::new()),
            arms: arms.clone(),
            candidates: Arc::new(StaticCandidateSource::from_routes(&config.routes).expect("routes are valid")),
            secrets: Arc::new(secrets_from_config(config).expect("secrets are valid")),
            history: None,
            status: None,
        };

        let engine = Engine::assemble(config, parts)
            .expect("engine assembles")
            .with_orchestrator(|o| o.with_retry_backoff(Duration::ZERO));
        engine.ledger().seed_tenants().await.expect("tenants seed");

        Self { engine, arms }
    }

    pub async fn chat(&self, tenant: Option<&str>, model: &str, stream: bool) -> Result<EngineResponse, FailedRequest> {
        let mut identity = RequestIdentity::new(Channel::Internal, Capability::Chat);
        identity.tenant_id = tenant.map(str::to_owned);
        identity.user_id = Some("user-1".to_owned());

        let request = RequestPayload {
            model: model.to_owned(),
            body: chat_body(stream),
            stream,
        };

        self.engine.execute(identity, request).await
    }

    pub fn ledger(&self) -> &Arc<QuotaLedger> {
        self.engine.ledger()
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Persisted routing statistics for a candidate
    pub async fn arm(&self, candidate_id: &str) -> Option<ArmState> {
        self.arms.load(candidate_id).await.expect("memory arms are readable")
    }
}

pub fn chat_body(stream: bool) -> Value {
    json!({
        "messages": [{"role": "user", "content": "Hello"}],
        "stream": stream
    })
}

/// Buffered OpenAI-style completion with reported usage
pub fn completion(content: &str, prompt_tokens: u64, completion_tokens: u64) -> Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": prompt_tokens, "completion_tokens": completion_tokens}
    })
}
