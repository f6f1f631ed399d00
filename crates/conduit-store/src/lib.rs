//! Shared key/value store used for caches, locks, quota mirrors and
//! circuit breaker state
//!
//! [`RedisStore`] is the production backend. [`MemoryStore`] provides the
//! same semantics in-process for single-node deployments and tests.

#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

mod error;
mod memory;
mod redis_store;
pub mod script;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use script::{AtomicScript, COMPARE_AND_DELETE, ScriptState};

/// Key/value store shared by every gateway instance
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Backend name for logs
    fn backend(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Values for several keys, in key order
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Set only if the key does not exist. Returns whether the value was written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Returns whether a key was removed
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Increment an integer value, creating it at zero first
    async fn incr(&self, key: &str, by: i64) -> Result<i64, StoreError>;

    /// Returns whether the key existed
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// All fields of a hash, empty when the key does not exist
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    async fn hash_set_all(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Run a script atomically with respect to every other store operation
    async fn run_script(
        &self,
        script: &AtomicScript,
        keys: &[String],
        args: &[String],
    ) -> Result<Vec<String>, StoreError>;

    /// Delete `key` only if it still holds `expected`
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let reply = self
            .run_script(&COMPARE_AND_DELETE, &[key.to_string()], &[expected.to_string()])
            .await?;

        Ok(reply.first().is_some_and(|v| v == "1"))
    }
}
