use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// Monetary amount in millionths of the billing currency unit
pub type Micros = i64;

/// Micro-units in one whole currency unit
pub const MICROS_PER_UNIT: Micros = 1_000_000;

/// Convert a decimal currency amount into micro-units, rounding half away from zero
#[allow(clippy::cast_possible_truncation)]
pub fn micros_from_decimal(amount: f64) -> Micros {
    (amount * 1_000_000.0).round() as Micros
}

/// Per-candidate token pricing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pricing {
    /// Price of one million input tokens, in micro-units
    pub input_per_mtok: Micros,
    /// Price of one million output tokens, in micro-units
    pub output_per_mtok: Micros,
}

impl Pricing {
    /// Cost of a token usage, rounded up to the next micro-unit
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> Micros {
        let total = i128::from(input_tokens) * i128::from(self.input_per_mtok)
            + i128::from(output_tokens) * i128::from(self.output_per_mtok);
        let micros = (total + 999_999).div_euclid(1_000_000);
        Micros::try_from(micros).unwrap_or(Micros::MAX)
    }
}

/// How credentials are attached to upstream requests
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthScheme {
    /// `Authorization: Bearer <secret>`
    #[default]
    Bearer,
    /// Secret placed verbatim in a named header
    Header { name: String },
    /// No credentials
    None,
}

/// Credential lookup and attachment for a candidate
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Reference resolved through the secret store
    pub secret_ref: Option<String>,
    #[serde(default)]
    pub scheme: AuthScheme,
}

/// Shape the final result of an async task is normalized into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultShape {
    /// Value at the result path, unchanged
    #[default]
    Raw,
    /// List of URLs
    UrlList,
    /// List of base64 payloads
    Base64List,
}

/// Submit-then-poll protocol for providers that run work asynchronously
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncTaskConfig {
    /// Status endpoint, with `{task_id}` substituted
    pub status_url: String,
    /// Dotted path to the task id in the submit response
    pub task_id_path: String,
    /// Dotted path to the task status in the poll response
    pub status_path: String,
    pub success_values: Vec<String>,
    pub failure_values: Vec<String>,
    /// Dotted path to the final result in the poll response
    pub result_path: String,
    /// Dotted path to a failure message in the poll response
    pub error_path: Option<String>,
    pub result_shape: ResultShape,
    pub poll_interval: Duration,
    pub timeout: Duration,
}

/// Request transformation applied before calling a candidate
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TransformConfig {
    /// JSON object merged over the request body
    pub body_template: Option<Value>,
    /// Async submit/poll protocol, when the provider requires it
    pub async_task: Option<AsyncTaskConfig>,
}

/// Selection parameters for a candidate's bandit arm
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RoutingParams {
    /// Strategy override, otherwise the bandit default applies
    pub strategy: Option<String>,
    /// Consecutive failures before the arm enters cooldown
    pub failure_threshold: Option<u32>,
    pub cooldown: Option<Duration>,
}

/// One routable provider, model and credential combination
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub id: String,
    pub provider: String,
    /// Model name sent to the upstream
    pub model: String,
    pub upstream_url: Url,
    pub credential_id: String,
    pub auth: AuthConfig,
    pub transform: TransformConfig,
    pub routing: RoutingParams,
    pub pricing: Pricing,
}

impl Candidate {
    /// Circuit breaker key: upstream host plus credential
    pub fn breaker_key(&self) -> String {
        let host = self.upstream_url.host_str().unwrap_or("unknown");
        match self.upstream_url.port() {
            Some(port) => format!("{host}:{port}:{}", self.credential_id),
            None => format!("{host}:{}", self.credential_id),
        }
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}
