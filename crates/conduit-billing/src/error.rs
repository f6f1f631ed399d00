use conduit_core::HttpError;
use http::StatusCode;

use crate::types::{QuotaKind, TransactionStatus};

/// Errors returned by the quota ledger
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// Charge exceeds the first exhausted quota dimension
    #[error("insufficient {kind} quota: required {required}, available {available}")]
    InsufficientQuota {
        /// Exhausted dimension
        kind: QuotaKind,
        /// Amount the charge needed
        required: i64,
        /// Amount that was left
        available: i64,
    },

    /// Tenant has no quota row
    #[error("tenant not found: {0}")]
    TenantNotFound(String),

    /// No transaction with this trace id
    #[error("transaction not found: {0}")]
    TransactionNotFound(String),

    /// Another request with the same trace id is being processed
    #[error("transaction {0} is already in progress")]
    DuplicateInFlight(String),

    /// Unique constraint on trace id rejected an insert
    #[error("transaction {0} already exists")]
    DuplicateTransaction(String),

    /// Transaction is not in a state that allows the operation
    #[error("transaction {trace_id} is {status}")]
    InvalidState {
        /// Transaction trace id
        trace_id: String,
        /// Current status
        status: TransactionStatus,
    },

    /// Transaction cannot be reversed
    #[error("transaction {trace_id} cannot be reversed: {reason}")]
    NotReversible {
        /// Transaction trace id
        trace_id: String,
        /// Why the reversal was refused
        reason: String,
    },

    /// Concurrent writers kept winning the optimistic lock
    #[error("quota update for {tenant_id} conflicted {attempts} times")]
    Conflict {
        /// Tenant being charged
        tenant_id: String,
        /// Attempts made
        attempts: u32,
    },

    /// Shared store failure on the fast path
    #[error("quota store error: {0}")]
    Store(String),

    /// Relational ledger failure
    #[error("ledger error: {0}")]
    Ledger(String),

    /// Stored quota could not be decoded
    #[error("invalid quota state: {0}")]
    InvalidQuotaState(String),
}

impl From<conduit_store::StoreError> for BillingError {
    fn from(e: conduit_store::StoreError) -> Self {
        Self::Store(e.to_string())
    }
}

impl HttpError for BillingError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InsufficientQuota { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::TenantNotFound(_) => StatusCode::FORBIDDEN,
            Self::TransactionNotFound(_) => StatusCode::NOT_FOUND,
            Self::DuplicateInFlight(_)
            | Self::DuplicateTransaction(_)
            | Self::InvalidState { .. }
            | Self::NotReversible { .. } => StatusCode::CONFLICT,
            Self::Conflict { .. } | Self::Store(_) | Self::Ledger(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::InvalidQuotaState(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &str {
        match self {
            Self::InsufficientQuota { .. } => "insufficient_quota",
            Self::DuplicateInFlight(_) | Self::DuplicateTransaction(_) => "duplicate_request",
            Self::TenantNotFound(_)
            | Self::TransactionNotFound(_)
            | Self::InvalidState { .. }
            | Self::NotReversible { .. } => "invalid_request",
            Self::Conflict { .. } | Self::Store(_) | Self::Ledger(_) => "billing_unavailable",
            Self::InvalidQuotaState(_) => "internal_error",
        }
    }

    fn client_message(&self) -> String {
        match self {
            Self::Store(_) | Self::Ledger(_) | Self::Conflict { .. } => {
                "billing is temporarily unavailable".to_string()
            }
            Self::InvalidQuotaState(_) => "internal billing error".to_string(),
            other => other.to_string(),
        }
    }
}
