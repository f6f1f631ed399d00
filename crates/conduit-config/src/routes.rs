use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::bandit::StrategyKind;

/// Static candidate list for one capability and model alias
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    /// `chat`, `embedding`, `image`, `video` or `audio`
    pub capability: String,
    /// Public model alias
    pub model: String,
    /// Candidates in configured order
    pub candidates: Vec<CandidateConfig>,
}

/// One provider, model and credential combination
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CandidateConfig {
    /// Defaults to `provider/model/credential_id`
    #[serde(default)]
    pub id: Option<String>,
    pub provider: String,
    /// Model name sent upstream
    pub model: String,
    pub url: Url,
    #[serde(default = "default_credential_id")]
    pub credential_id: String,
    /// Key into `[secrets]`, looked up as `provider/secret_ref`
    #[serde(default)]
    pub secret_ref: Option<String>,
    #[serde(default)]
    pub auth: AuthSchemeConfig,
    /// Price per one million input tokens
    #[serde(default)]
    pub input_price: f64,
    /// Price per one million output tokens
    #[serde(default)]
    pub output_price: f64,
    #[serde(default)]
    pub strategy: Option<StrategyKind>,
    #[serde(default)]
    pub failure_threshold: Option<u32>,
    #[serde(default, deserialize_with = "duration_str::deserialize_option_duration")]
    pub cooldown: Option<Duration>,
    /// Object merged over the request body
    #[serde(default)]
    pub body_template: Option<serde_json::Value>,
    #[serde(default)]
    pub async_task: Option<AsyncTaskSettings>,
}

impl CandidateConfig {
    pub fn resolved_id(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("{}/{}/{}", self.provider, self.model, self.credential_id))
    }
}

/// How credentials are attached
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthSchemeConfig {
    #[default]
    Bearer,
    Header {
        name: String,
    },
    None,
}

/// Shape of an async task result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultShapeConfig {
    #[default]
    Raw,
    UrlList,
    Base64List,
}

/// Submit-then-poll settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AsyncTaskSettings {
    /// Status endpoint with a `{task_id}` placeholder
    pub status_url: String,
    #[serde(default = "default_task_id_path")]
    pub task_id_path: String,
    #[serde(default = "default_status_path")]
    pub status_path: String,
    #[serde(default = "default_success_values")]
    pub success_values: Vec<String>,
    #[serde(default = "default_failure_values")]
    pub failure_values: Vec<String>,
    pub result_path: String,
    #[serde(default)]
    pub error_path: Option<String>,
    #[serde(default)]
    pub result_shape: ResultShapeConfig,
    #[serde(default = "default_poll_interval", deserialize_with = "duration_str::deserialize_duration")]
    pub poll_interval: Duration,
    #[serde(default = "default_task_timeout", deserialize_with = "duration_str::deserialize_duration")]
    pub timeout: Duration,
}

fn default_credential_id() -> String {
    "default".to_owned()
}

fn default_task_id_path() -> String {
    "id".to_owned()
}

fn default_status_path() -> String {
    "status".to_owned()
}

fn default_success_values() -> Vec<String> {
    vec!["succeeded".to_owned(), "success".to_owned(), "completed".to_owned()]
}

fn default_failure_values() -> Vec<String> {
    vec!["failed".to_owned(), "error".to_owned(), "cancelled".to_owned()]
}

const fn default_poll_interval() -> Duration {
    Duration::from_secs(2)
}

const fn default_task_timeout() -> Duration {
    Duration::from_secs(300)
}
