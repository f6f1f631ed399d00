//! Tenant quota and billing ledger
//!
//! [`QuotaLedger`] charges tenants atomically through a shared-store mirror
//! and keeps an idempotent transaction log in a [`LedgerStore`]. Streaming
//! requests use the two-phase pending/commit protocol, everything else a
//! one-shot [`QuotaLedger::deduct`].

#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

mod error;
mod ledger;
mod quota;
pub mod scripts;
mod store;
mod types;

pub use error::BillingError;
pub use ledger::{QuotaLedger, shortfall};
pub use quota::{ChargePolicy, PeriodBoundaries, QuotaCharge, TenantQuota};
pub use store::{LedgerStore, MemoryLedgerStore};
pub use types::{BillingTransaction, QuotaKind, TokenUsage, TransactionKind, TransactionStatus, UsageCharge};
