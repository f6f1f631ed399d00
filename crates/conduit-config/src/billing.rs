use std::time::Duration;

use serde::Deserialize;

/// Quota ledger settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BillingConfig {
    /// Let balances go below the credit limit instead of rejecting
    #[serde(default)]
    pub allow_negative: bool,
    /// Lifetime of the per-trace idempotency lock
    #[serde(default = "default_lock_ttl", deserialize_with = "duration_str::deserialize_duration")]
    pub lock_ttl: Duration,
    /// Output tokens assumed when reserving for a stream
    #[serde(default = "default_estimated_output_tokens")]
    pub estimated_output_tokens: u64,
    /// Optimistic-lock attempts on the relational fallback
    #[serde(default = "default_max_cas_retries")]
    pub max_cas_retries: u32,
    /// Lifetime of the quota mirror in the shared store
    #[serde(default = "default_mirror_ttl", deserialize_with = "duration_str::deserialize_duration")]
    pub mirror_ttl: Duration,
    /// Tenants created at startup
    #[serde(default)]
    pub tenants: Vec<TenantSeed>,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            allow_negative: false,
            lock_ttl: default_lock_ttl(),
            estimated_output_tokens: default_estimated_output_tokens(),
            max_cas_retries: default_max_cas_retries(),
            mirror_ttl: default_mirror_ttl(),
            tenants: Vec::new(),
        }
    }
}

/// Initial quota for a tenant, amounts in currency units
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TenantSeed {
    pub id: String,
    #[serde(default)]
    pub balance: f64,
    #[serde(default)]
    pub credit_limit: f64,
    #[serde(default)]
    pub daily_requests: Option<u64>,
    #[serde(default)]
    pub monthly_requests: Option<u64>,
    #[serde(default)]
    pub rpm_limit: Option<u32>,
    #[serde(default)]
    pub tpm_limit: Option<u32>,
}

const fn default_lock_ttl() -> Duration {
    Duration::from_secs(30)
}

const fn default_estimated_output_tokens() -> u64 {
    1024
}

const fn default_max_cas_retries() -> u32 {
    5
}

const fn default_mirror_ttl() -> Duration {
    Duration::from_secs(300)
}
