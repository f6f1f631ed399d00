use std::time::Duration;

use conduit_core::{ErrorCode, GatewayError};
use serde_json::Value;

/// Longest upstream error message carried to the client
const MAX_UPSTREAM_MESSAGE: usize = 512;

/// Errors raised while calling an upstream
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    /// Destination rejected by the URL policy
    #[error("destination blocked: {0}")]
    PolicyBlocked(String),

    /// Breaker for this host and credential is open
    #[error("circuit open for {key}, retry in {retry_after:?}")]
    CircuitOpen {
        /// Breaker key
        key: String,
        /// Time until trial requests are admitted
        retry_after: Duration,
    },

    /// Redirect chain longer than allowed
    #[error("more than {0} redirects")]
    TooManyRedirects(u32),

    /// Response body over the configured cap
    #[error("response exceeds {0} bytes")]
    ResponseTooLarge(u64),

    /// No response within the deadline
    #[error("upstream timed out: {0}")]
    Timeout(String),

    /// Connection level failure
    #[error("network error: {0}")]
    Network(String),

    /// Upstream answered with a non-success status
    #[error("upstream returned {status}: {message}")]
    Status {
        /// HTTP status
        status: u16,
        /// Provider error code from the body
        code: Option<String>,
        /// Provider error message or body excerpt
        message: String,
    },

    /// Body could not be interpreted
    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),

    /// Async task reported failure
    #[error("async task failed: {0}")]
    TaskFailed(String),

    /// Async task did not finish in time
    #[error("async task {0} did not finish in time")]
    TaskTimeout(String),

    /// Credential reference could not be resolved
    #[error("no secret {secret_ref} for provider {provider}")]
    SecretMissing {
        /// Provider name
        provider: String,
        /// Secret reference
        secret_ref: String,
    },
}

impl UpstreamError {
    /// Build a status error from a response body, extracting the provider's
    /// error code and message when the body is JSON
    pub fn from_status(status: u16, body: &[u8]) -> Self {
        let parsed: Option<Value> = serde_json::from_slice(body).ok();
        let error = parsed.as_ref().and_then(|v| v.get("error"));

        let code = error
            .and_then(|e| e.get("code").or_else(|| e.get("type")))
            .and_then(|c| match c {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            });

        let message = error
            .and_then(|e| e.get("message").and_then(Value::as_str).or_else(|| e.as_str()))
            .map_or_else(|| String::from_utf8_lossy(body).into_owned(), str::to_string);

        Self::Status {
            status,
            code,
            message: truncate(message.trim()),
        }
    }

    /// Network and timeout failures that another egress path might avoid
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Network(_))
    }

    /// Whether the failure says something about the upstream's health
    pub const fn is_breaker_failure(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Network(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Short outcome label for metrics
    pub const fn outcome(&self) -> &'static str {
        match self {
            Self::PolicyBlocked(_) => "policy_blocked",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::TooManyRedirects(_) => "too_many_redirects",
            Self::ResponseTooLarge(_) => "response_too_large",
            Self::Timeout(_) => "timeout",
            Self::Network(_) => "network_error",
            Self::Status { .. } => "http_error",
            Self::InvalidResponse(_) => "invalid_response",
            Self::TaskFailed(_) => "task_failed",
            Self::TaskTimeout(_) => "task_timeout",
            Self::SecretMissing { .. } => "secret_missing",
        }
    }
}

fn truncate(message: &str) -> String {
    if message.len() <= MAX_UPSTREAM_MESSAGE {
        return message.to_string();
    }

    let mut end = MAX_UPSTREAM_MESSAGE;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &message[..end])
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

impl From<UpstreamError> for GatewayError {
    fn from(e: UpstreamError) -> Self {
        let message = e.to_string();
        match e {
            UpstreamError::PolicyBlocked(_) => Self::gateway(ErrorCode::PolicyBlocked, message),
            UpstreamError::CircuitOpen { .. } => Self::gateway(ErrorCode::CircuitOpen, message),
            UpstreamError::TooManyRedirects(_) => Self::gateway(ErrorCode::TooManyRedirects, message),
            UpstreamError::ResponseTooLarge(_) => Self::gateway(ErrorCode::ResponseTooLarge, message),
            UpstreamError::SecretMissing { provider, .. } => Self::gateway(
                ErrorCode::SecretMissing,
                format!("credentials for provider {provider} are not configured"),
            ),
            UpstreamError::Timeout(_) => Self::upstream(ErrorCode::UpstreamTimeout, message),
            UpstreamError::Network(_) => Self::upstream(ErrorCode::UpstreamNetwork, message),
            UpstreamError::InvalidResponse(_) => Self::upstream(ErrorCode::InvalidUpstreamResponse, message),
            UpstreamError::TaskFailed(_) => Self::upstream(ErrorCode::AsyncTaskFailed, message),
            UpstreamError::TaskTimeout(_) => Self::upstream(ErrorCode::AsyncTaskTimeout, message),
            UpstreamError::Status {
                status,
                code,
                message: upstream_message,
            } => {
                let error_code = match status {
                    429 => ErrorCode::UpstreamRateLimited,
                    s if s >= 500 => ErrorCode::UpstreamServerError,
                    _ => ErrorCode::UpstreamClientError,
                };
                Self::upstream(error_code, upstream_message).with_upstream(status, code)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_errors_extract_provider_details() {
        let body = br#"{"error":{"message":"Rate limit reached","type":"rate_limit_exceeded"}}"#;
        let err = UpstreamError::from_status(429, body);

        assert!(err.is_breaker_failure());
        let gateway = GatewayError::from(err);
        assert_eq!(gateway.code, ErrorCode::UpstreamRateLimited);
        assert_eq!(gateway.message, "Rate limit reached");
        assert_eq!(gateway.upstream_status, Some(429));
        assert_eq!(gateway.upstream_code.as_deref(), Some("rate_limit_exceeded"));
    }

    #[test]
    fn plain_text_bodies_are_kept_and_truncated() {
        let body = "x".repeat(2_000);
        let UpstreamError::Status { message, code, .. } = UpstreamError::from_status(502, body.as_bytes()) else {
            panic!("expected status error");
        };
        assert!(code.is_none());
        assert_eq!(message.len(), MAX_UPSTREAM_MESSAGE + 3);
    }

    #[test]
    fn client_errors_do_not_trip_the_breaker() {
        let err = UpstreamError::from_status(400, b"{}");
        assert!(!err.is_breaker_failure());
        assert_eq!(GatewayError::from(err).code, ErrorCode::UpstreamClientError);

        assert!(UpstreamError::Timeout("slow".into()).is_transient());
        assert!(!UpstreamError::PolicyBlocked("10.0.0.1".into()).is_transient());
    }
}
