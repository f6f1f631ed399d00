use serde::Deserialize;
use url::Url;

/// Shared store backend
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    /// In-process store (single instance only)
    #[default]
    Memory,
    /// Redis-backed store (distributed)
    Redis(RedisStoreConfig),
}

/// Redis connection settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisStoreConfig {
    /// Redis connection URL
    pub url: Url,
    /// Prefix applied to every key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_key_prefix() -> String {
    "conduit:".to_owned()
}
