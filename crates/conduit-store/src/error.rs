/// Errors returned by shared store backends
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Backend could not be reached or the connection dropped
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Backend rejected a command
    #[error("store command failed: {0}")]
    Command(String),

    /// Stored value had an unexpected type or shape
    #[error("unexpected stored value: {0}")]
    InvalidValue(String),

    /// Atomic script failed to run
    #[error("script {name} failed: {message}")]
    Script {
        /// Script name
        name: &'static str,
        /// Backend error message
        message: String,
    },
}

impl StoreError {
    /// Whether the failure means the backend itself is unreachable
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
            Self::Unavailable(e.to_string())
        } else {
            Self::Command(e.to_string())
        }
    }
}
