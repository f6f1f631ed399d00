use std::fmt;

use http::StatusCode;
use serde::{Deserialize, Serialize};

/// Trait for domain errors that can be surfaced to API consumers
///
/// Implemented by each feature crate's error type. The workflow layer
/// converts these into a [`GatewayError`], keeping domain errors decoupled
/// from the transport that eventually renders them.
pub trait HttpError: std::error::Error {
    /// HTTP status code for this error
    fn status_code(&self) -> StatusCode;

    /// Machine-readable error code (e.g. `insufficient_quota`)
    fn error_type(&self) -> &str;

    /// Message safe to expose to API consumers
    fn client_message(&self) -> String;
}

/// Which party is responsible for a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSource {
    /// The caller sent something unusable or is not allowed to proceed
    Client,
    /// The gateway itself failed (policy, billing, internal state)
    Gateway,
    /// The upstream provider failed
    Upstream,
}

impl fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Client => "client",
            Self::Gateway => "gateway",
            Self::Upstream => "upstream",
        };
        f.write_str(s)
    }
}

/// Stable machine-readable failure codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    ClientCancelled,
    NoCandidates,
    AllCandidatesExhausted,
    SecretMissing,
    PolicyBlocked,
    CircuitOpen,
    ResponseTooLarge,
    TooManyRedirects,
    UpstreamTimeout,
    UpstreamNetwork,
    UpstreamServerError,
    UpstreamClientError,
    UpstreamRateLimited,
    InvalidUpstreamResponse,
    AsyncTaskFailed,
    AsyncTaskTimeout,
    InsufficientQuota,
    DuplicateRequest,
    BillingUnavailable,
    Internal,
}

impl ErrorCode {
    /// Wire representation of the code
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::ClientCancelled => "client_cancelled",
            Self::NoCandidates => "no_candidates",
            Self::AllCandidatesExhausted => "all_candidates_exhausted",
            Self::SecretMissing => "secret_missing",
            Self::PolicyBlocked => "policy_blocked",
            Self::CircuitOpen => "circuit_open",
            Self::ResponseTooLarge => "response_too_large",
            Self::TooManyRedirects => "too_many_redirects",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::UpstreamNetwork => "upstream_network_error",
            Self::UpstreamServerError => "upstream_server_error",
            Self::UpstreamClientError => "upstream_client_error",
            Self::UpstreamRateLimited => "upstream_rate_limited",
            Self::InvalidUpstreamResponse => "invalid_upstream_response",
            Self::AsyncTaskFailed => "async_task_failed",
            Self::AsyncTaskTimeout => "async_task_timeout",
            Self::InsufficientQuota => "insufficient_quota",
            Self::DuplicateRequest => "duplicate_request",
            Self::BillingUnavailable => "billing_unavailable",
            Self::Internal => "internal_error",
        }
    }

    /// Default HTTP status used when rendering this code
    pub fn status_code(self) -> StatusCode {
        match self {
            Self::InvalidRequest => StatusCode::BAD_REQUEST,
            // Non-standard "client closed request"
            Self::ClientCancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
            Self::NoCandidates => StatusCode::NOT_FOUND,
            Self::InsufficientQuota => StatusCode::PAYMENT_REQUIRED,
            Self::DuplicateRequest => StatusCode::CONFLICT,
            Self::PolicyBlocked => StatusCode::FORBIDDEN,
            Self::UpstreamRateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamTimeout | Self::AsyncTaskTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::CircuitOpen | Self::AllCandidatesExhausted | Self::BillingUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::SecretMissing | Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ResponseTooLarge
            | Self::TooManyRedirects
            | Self::UpstreamNetwork
            | Self::UpstreamServerError
            | Self::UpstreamClientError
            | Self::InvalidUpstreamResponse
            | Self::AsyncTaskFailed => StatusCode::BAD_GATEWAY,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure recorded on the request context
///
/// Carries the responsible party, a stable code and a client-safe message.
/// Upstream failures additionally keep the provider's status and error code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayError {
    /// Responsible party
    pub source: ErrorSource,
    /// Stable failure code
    pub code: ErrorCode,
    /// Message safe to expose to API consumers
    pub message: String,
    /// HTTP status returned by the upstream, when one was received
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_status: Option<u16>,
    /// Error code reported by the upstream body, when one was parsed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_code: Option<String>,
}

impl GatewayError {
    pub fn new(source: ErrorSource, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            source,
            code,
            message: message.into(),
            upstream_status: None,
            upstream_code: None,
        }
    }

    pub fn client(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(ErrorSource::Client, code, message)
    }

    pub fn gateway(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(ErrorSource::Gateway, code, message)
    }

    pub fn upstream(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(ErrorSource::Upstream, code, message)
    }

    /// Internal failure with a generic client message
    pub fn internal(message: impl Into<String>) -> Self {
        Self::gateway(ErrorCode::Internal, message)
    }

    /// Attach the upstream status and optional provider error code
    #[must_use]
    pub fn with_upstream(mut self, status: u16, code: Option<String>) -> Self {
        self.upstream_status = Some(status);
        self.upstream_code = code;
        self
    }

    /// HTTP status to render for this failure
    pub fn status_code(&self) -> StatusCode {
        self.code.status_code()
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}: {}", self.source, self.code, self.message)
    }
}

impl std::error::Error for GatewayError {}

/// Conversion of a domain error into the shared error model
pub trait IntoGatewayError {
    fn into_gateway_error(self) -> GatewayError;
}

impl<E: HttpError> IntoGatewayError for E {
    fn into_gateway_error(self) -> GatewayError {
        let status = self.status_code();
        let source = if status.is_client_error() {
            ErrorSource::Client
        } else {
            ErrorSource::Gateway
        };
        let code = match self.error_type() {
            "insufficient_quota" => ErrorCode::InsufficientQuota,
            "duplicate_request" => ErrorCode::DuplicateRequest,
            "invalid_request" => ErrorCode::InvalidRequest,
            "billing_unavailable" => ErrorCode::BillingUnavailable,
            _ => ErrorCode::Internal,
        };
        GatewayError::new(source, code, self.client_message())
    }
}

/// Log and discard the error of a non-critical side effect
///
/// Used for cache writes, lock releases, status events and similar work
/// whose failure must never fail the request.
pub fn best_effort<T, E: fmt::Display>(operation: &str, result: Result<T, E>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(operation, error = %e, "best-effort operation failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("quota gone")]
    struct QuotaGone;

    impl HttpError for QuotaGone {
        fn status_code(&self) -> StatusCode {
            StatusCode::PAYMENT_REQUIRED
        }

        fn error_type(&self) -> &str {
            "insufficient_quota"
        }

        fn client_message(&self) -> String {
            "balance exhausted".to_string()
        }
    }

    #[test]
    fn http_errors_convert_with_source_from_status() {
        let err = QuotaGone.into_gateway_error();

        assert_eq!(err.source, ErrorSource::Client);
        assert_eq!(err.code, ErrorCode::InsufficientQuota);
        assert_eq!(err.message, "balance exhausted");
    }

    #[test]
    fn upstream_details_serialize_only_when_present() {
        let plain = GatewayError::gateway(ErrorCode::CircuitOpen, "circuit open");
        let json = serde_json::to_value(&plain).unwrap();
        assert!(json.get("upstream_status").is_none());
        assert_eq!(json["code"], "circuit_open");

        let upstream = GatewayError::upstream(ErrorCode::UpstreamServerError, "bad gateway")
            .with_upstream(502, Some("overloaded".to_string()));
        let json = serde_json::to_value(&upstream).unwrap();
        assert_eq!(json["upstream_status"], 502);
        assert_eq!(json["source"], "upstream");
    }

    #[test]
    fn best_effort_swallows_errors() {
        let failed: Result<u8, String> = Err("boom".to_string());
        assert_eq!(best_effort("test", failed), None);
        assert_eq!(best_effort("test", Ok::<u8, String>(3)), Some(3));
    }
}
