#![allow(clippy::must_use_candidate)]

pub mod bandit;
pub mod billing;
pub mod cache;
mod env;
mod loader;
pub mod routes;
pub mod store;
pub mod telemetry;
pub mod upstream;

use indexmap::IndexMap;
use secrecy::SecretString;
use serde::Deserialize;

pub use bandit::*;
pub use billing::*;
pub use cache::*;
pub use routes::*;
pub use store::*;
pub use telemetry::{ExportProtocol, ExporterConfig, LogFormat, TelemetryConfig};
pub use upstream::*;

/// Top-level conduit configuration
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Shared store backend
    #[serde(default)]
    pub store: StoreConfig,
    /// Read-through cache tuning
    #[serde(default)]
    pub cache: CacheConfig,
    /// Upstream circuit breaker
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Upstream HTTP client
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Candidate feedback and cooldown
    #[serde(default)]
    pub bandit: BanditConfig,
    /// Quota ledger
    #[serde(default)]
    pub billing: BillingConfig,
    /// Static candidate routes
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    /// Upstream credentials keyed by `provider/secret_ref`
    #[serde(default)]
    pub secrets: IndexMap<String, SecretString>,
    /// Logging and OTLP export
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}
