//! Prompt-prefix affinity
//!
//! Requests sharing a prompt prefix are steered back to the candidate that
//! last served that prefix, so provider-side prompt caches stay warm.

use std::sync::Arc;

use conduit_config::AffinityConfig;
use conduit_core::Capability;
use conduit_store::SharedStore;
use serde_json::Value;

pub struct AffinityTracker {
    store: Arc<dyn SharedStore>,
    config: AffinityConfig,
}

impl AffinityTracker {
    pub fn new(store: Arc<dyn SharedStore>, config: AffinityConfig) -> Self {
        Self { store, config }
    }

    /// Affinity key for a request, `None` when affinity is disabled
    pub fn key_for(&self, capability: Capability, model: &str, body: &Value) -> Option<String> {
        if !self.config.enabled {
            return None;
        }

        let bytes = serde_json::to_vec(body).ok()?;
        let prefix = &bytes[..bytes.len().min(self.config.prefix_bytes)];
        Some(format!("{capability}:{model}:{}", conduit_cache::hash_bytes(prefix)))
    }

    fn store_key(key: &str) -> String {
        format!("affinity:{key}")
    }

    /// Candidate that last served this prefix
    pub async fn preferred(&self, key: &str) -> Option<String> {
        match self.store.get(&Self::store_key(key)).await {
            Ok(candidate) => candidate,
            Err(e) => {
                tracing::debug!(error = %e, "affinity lookup failed");
                None
            }
        }
    }

    pub async fn record_success(&self, key: &str, candidate_id: &str) {
        if let Err(e) = self
            .store
            .set(&Self::store_key(key), candidate_id, Some(self.config.ttl))
            .await
        {
            tracing::debug!(candidate = %candidate_id, error = %e, "failed to record affinity");
        }
    }

    /// Forget the mapping if it still points at the failed candidate
    pub async fn record_failure(&self, key: &str, candidate_id: &str) {
        if let Err(e) = self.store.compare_and_delete(&Self::store_key(key), candidate_id).await {
            tracing::debug!(candidate = %candidate_id, error = %e, "failed to clear affinity");
        }
    }
}

impl std::fmt::Debug for AffinityTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AffinityTracker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use conduit_store::MemoryStore;
    use serde_json::json;

    use super::*;

    fn tracker(prefix_bytes: usize) -> AffinityTracker {
        AffinityTracker::new(
            Arc::new(MemoryStore::new()),
            AffinityConfig {
                prefix_bytes,
                ..AffinityConfig::default()
            },
        )
    }

    #[test]
    fn shared_prefixes_share_keys() {
        let tracker = tracker(16);
        let a = json!({"messages": [{"role": "system", "content": "You are helpful. Question A"}]});
        let b = json!({"messages": [{"role": "system", "content": "You are helpful. Question B"}]});

        let key_a = tracker.key_for(Capability::Chat, "gpt-4o", &a).unwrap();
        assert_eq!(tracker.key_for(Capability::Chat, "gpt-4o", &b), Some(key_a.clone()));
        assert_ne!(tracker.key_for(Capability::Chat, "claude", &a), Some(key_a));
    }

    #[test]
    fn disabled_affinity_has_no_key() {
        let tracker = AffinityTracker::new(
            Arc::new(MemoryStore::new()),
            AffinityConfig {
                enabled: false,
                ..AffinityConfig::default()
            },
        );
        assert!(tracker.key_for(Capability::Chat, "m", &json!({})).is_none());
    }

    #[tokio::test]
    async fn failure_only_clears_matching_candidate() {
        let tracker = tracker(64);

        tracker.record_success("k", "openai/primary").await;
        tracker.record_failure("k", "anthropic/primary").await;
        assert_eq!(tracker.preferred("k").await.as_deref(), Some("openai/primary"));

        tracker.record_failure("k", "openai/primary").await;
        assert!(tracker.preferred("k").await.is_none());
    }
}
