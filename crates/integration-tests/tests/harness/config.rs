//! Programmatic configuration builder for integration tests

use conduit_config::{AuthSchemeConfig, CandidateConfig, Config, RouteConfig, TenantSeed};
use secrecy::SecretString;
use url::Url;
use wiremock::MockServer;

/// Builder for constructing test configurations
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Loopback upstreams allowed, one retry per candidate
    pub fn new() -> Self {
        let mut config = Config::default();
        config.upstream.url_policy.allow_private_networks = true;
        config.upstream.max_retries = 1;
        config
            .secrets
            .insert("openai/primary".to_owned(), SecretString::from("sk-test"));

        Self { config }
    }

    /// Add a chat route whose candidates point at mock servers, in order
    pub fn with_chat_route(mut self, model: &str, candidates: &[(&str, &MockServer)]) -> Self {
        let candidates = candidates
            .iter()
            .map(|(id, server)| candidate(id, server))
            .collect();

        self.config.routes.push(RouteConfig {
            capability: "chat".to_owned(),
            model: model.to_owned(),
            candidates,
        });
        self
    }

    /// Seed a tenant with a balance in currency units
    pub fn with_tenant(mut self, id: &str, balance: f64) -> Self {
        self.config.billing.tenants.push(TenantSeed {
            id: id.to_owned(),
            balance,
            credit_limit: 0.0,
            daily_requests: None,
            monthly_requests: None,
            rpm_limit: None,
            tpm_limit: None,
        });
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.config.circuit_breaker.failure_threshold = threshold;
        self
    }

    pub fn build(self) -> Config {
        self.config.validate().expect("test config is valid");
        self.config
    }
}

/// Candidate priced at 1 per million input and 2 per million output tokens
fn candidate(id: &str, server: &MockServer) -> CandidateConfig {
    CandidateConfig {
        id: Some(id.to_owned()),
        provider: "openai".to_owned(),
        model: format!("{id}-model"),
        url: Url::parse(&format!("{}/{id}/v1/chat/completions", server.uri())).expect("valid URL"),
        credential_id: id.to_owned(),
        secret_ref: Some("primary".to_owned()),
        auth: AuthSchemeConfig::Bearer,
        input_price: 1.0,
        output_price: 2.0,
        strategy: None,
        failure_threshold: None,
        cooldown: None,
        body_template: None,
        async_task: None,
    }
}
