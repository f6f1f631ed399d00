use std::time::Duration;

use serde::Deserialize;
use url::Url;

/// Upstream HTTP client settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    #[serde(default = "default_connect_timeout", deserialize_with = "duration_str::deserialize_duration")]
    pub connect_timeout: Duration,
    /// Deadline for a buffered call, or for response headers when streaming
    #[serde(default = "default_request_timeout", deserialize_with = "duration_str::deserialize_duration")]
    pub request_timeout: Duration,
    /// Largest buffered response body accepted
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: u64,
    /// Redirect hops followed before giving up
    #[serde(default = "default_max_redirects")]
    pub max_redirects: u32,
    /// Retries on the same candidate before moving to the next
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Proxies tried after a transient network failure
    #[serde(default = "default_max_proxy_attempts")]
    pub max_proxy_attempts: u32,
    /// How often a stream checks for client cancellation
    #[serde(
        default = "default_cancel_check_interval",
        deserialize_with = "duration_str::deserialize_duration"
    )]
    pub cancel_check_interval: Duration,
    /// Longest silence tolerated between chunks of a streamed response
    #[serde(
        default = "default_stream_idle_timeout",
        deserialize_with = "duration_str::deserialize_duration"
    )]
    pub stream_idle_timeout: Duration,
    /// Destination filtering
    #[serde(default)]
    pub url_policy: UrlPolicyConfig,
    /// Outbound proxy pool
    #[serde(default)]
    pub proxies: Vec<ProxyEntry>,
    /// Prompt-prefix affinity
    #[serde(default)]
    pub affinity: AffinityConfig,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
            max_response_bytes: default_max_response_bytes(),
            max_redirects: default_max_redirects(),
            max_retries: default_max_retries(),
            max_proxy_attempts: default_max_proxy_attempts(),
            cancel_check_interval: default_cancel_check_interval(),
            stream_idle_timeout: default_stream_idle_timeout(),
            url_policy: UrlPolicyConfig::default(),
            proxies: Vec::new(),
            affinity: AffinityConfig::default(),
        }
    }
}

/// Which destinations upstream requests may reach
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UrlPolicyConfig {
    /// Hosts allowed even when they resolve to private addresses
    #[serde(default)]
    pub allow_hosts: Vec<String>,
    /// Hosts always rejected. A leading `.` matches subdomains.
    #[serde(default)]
    pub deny_hosts: Vec<String>,
    /// Disable private, loopback and link-local address checks
    #[serde(default)]
    pub allow_private_networks: bool,
}

/// Outbound proxy
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyEntry {
    pub id: String,
    pub url: Url,
}

/// Prompt-prefix affinity settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AffinityConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Bytes of the request prefix that are hashed
    #[serde(default = "default_prefix_bytes")]
    pub prefix_bytes: usize,
    #[serde(default = "default_affinity_ttl", deserialize_with = "duration_str::deserialize_duration")]
    pub ttl: Duration,
}

impl Default for AffinityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix_bytes: default_prefix_bytes(),
            ttl: default_affinity_ttl(),
        }
    }
}

/// Per host and credential circuit breaker
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Time an open circuit waits before admitting trial requests
    #[serde(default = "default_reset_timeout", deserialize_with = "duration_str::deserialize_duration")]
    pub reset_timeout: Duration,
    /// Successful trial requests needed to close a half-open circuit
    #[serde(default = "default_half_open_success_count")]
    pub half_open_success_count: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout: default_reset_timeout(),
            half_open_success_count: default_half_open_success_count(),
        }
    }
}

const fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

const fn default_request_timeout() -> Duration {
    Duration::from_secs(120)
}

const fn default_max_response_bytes() -> u64 {
    10 * 1024 * 1024
}

const fn default_max_redirects() -> u32 {
    3
}

const fn default_max_retries() -> u32 {
    2
}

const fn default_max_proxy_attempts() -> u32 {
    2
}

const fn default_cancel_check_interval() -> Duration {
    Duration::from_millis(500)
}

const fn default_stream_idle_timeout() -> Duration {
    Duration::from_secs(60)
}

const fn default_true() -> bool {
    true
}

const fn default_prefix_bytes() -> usize {
    2048
}

const fn default_affinity_ttl() -> Duration {
    Duration::from_secs(600)
}

const fn default_failure_threshold() -> u32 {
    5
}

const fn default_reset_timeout() -> Duration {
    Duration::from_secs(30)
}

const fn default_half_open_success_count() -> u32 {
    2
}
