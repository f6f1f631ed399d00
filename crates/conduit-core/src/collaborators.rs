//! Interfaces to systems the gateway consumes but does not own

use std::collections::HashMap;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::Serialize;

use crate::candidate::Candidate;
use crate::context::Capability;
use crate::error::GatewayError;

/// Supplies the routable candidates for a model alias
#[async_trait]
pub trait CandidateSource: Send + Sync {
    /// Candidates for a capability and public model name, in configured order
    async fn candidates(&self, capability: Capability, model: &str) -> Result<Vec<Candidate>, GatewayError>;
}

/// Resolves upstream credentials
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Secret for a provider and reference, `None` when it does not exist
    async fn resolve(&self, provider: &str, secret_ref: &str) -> Result<Option<SecretString>, GatewayError>;
}

/// Secret store over a fixed map, keyed by `provider/secret_ref`
#[derive(Default)]
pub struct StaticSecretStore {
    secrets: HashMap<String, SecretString>,
}

impl StaticSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_secret(mut self, provider: &str, secret_ref: &str, value: SecretString) -> Self {
        self.insert(provider, secret_ref, value);
        self
    }

    pub fn insert(&mut self, provider: &str, secret_ref: &str, value: SecretString) {
        self.secrets.insert(format!("{provider}/{secret_ref}"), value);
    }
}

impl std::fmt::Debug for StaticSecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticSecretStore")
            .field("secrets", &self.secrets.len())
            .finish()
    }
}

#[async_trait]
impl SecretStore for StaticSecretStore {
    async fn resolve(&self, provider: &str, secret_ref: &str) -> Result<Option<SecretString>, GatewayError> {
        Ok(self.secrets.get(&format!("{provider}/{secret_ref}")).cloned())
    }
}

/// Assistant output captured from a finished stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryRecord {
    pub trace_id: String,
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    pub model: String,
    pub content: String,
    pub tool_calls: Vec<String>,
}

/// Destination for conversation history
#[async_trait]
pub trait HistorySink: Send + Sync {
    async fn record(&self, record: HistoryRecord) -> Result<(), GatewayError>;
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;

    use super::*;

    #[tokio::test]
    async fn static_store_resolves_by_provider_and_ref() {
        let store = StaticSecretStore::new().with_secret("openai", "primary", SecretString::from("sk-test"));

        let found = store.resolve("openai", "primary").await.unwrap();
        assert_eq!(found.map(|s| s.expose_secret().to_string()), Some("sk-test".to_string()));

        assert!(store.resolve("anthropic", "primary").await.unwrap().is_none());
    }
}
