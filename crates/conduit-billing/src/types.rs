use std::fmt;

use conduit_core::{Micros, Pricing};
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Quota dimension that rejected a charge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaKind {
    /// Balance plus credit limit
    Balance,
    /// Requests per UTC day
    Daily,
    /// Requests per UTC month
    Monthly,
}

impl QuotaKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Balance => "balance",
            Self::Daily => "daily",
            Self::Monthly => "monthly",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "balance" => Some(Self::Balance),
            "daily" => Some(Self::Daily),
            "monthly" => Some(Self::Monthly),
            _ => None,
        }
    }
}

impl fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token counts billed for a call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub const fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn cost(&self, pricing: &Pricing) -> Micros {
        pricing.cost(self.input_tokens, self.output_tokens)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Deduct,
    Refund,
    Recharge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Committed,
    Failed,
    Reversed,
}

impl TransactionStatus {
    /// Terminal transactions never change again, except committed to reversed
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Committed => "committed",
            Self::Failed => "failed",
            Self::Reversed => "reversed",
        };
        f.write_str(s)
    }
}

/// Ledger entry, unique per trace id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingTransaction {
    pub id: Uuid,
    pub trace_id: String,
    pub tenant_id: String,
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    /// Positive amount in micro-units. Deductions lower the balance, refunds
    /// and recharges raise it.
    pub amount: Micros,
    pub usage: TokenUsage,
    pub pricing: Option<Pricing>,
    pub balance_before: Option<Micros>,
    pub balance_after: Option<Micros>,
    /// Trace id of the transaction this one reverses
    pub reversal_of: Option<String>,
    /// Trace id of the transaction that reversed this one
    pub reversed_by: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl BillingTransaction {
    pub fn pending(trace_id: &str, tenant_id: &str, kind: TransactionKind, amount: Micros) -> Self {
        let now = Timestamp::now();
        Self {
            id: Uuid::new_v4(),
            trace_id: trace_id.to_string(),
            tenant_id: tenant_id.to_string(),
            kind,
            status: TransactionStatus::Pending,
            amount,
            usage: TokenUsage::default(),
            pricing: None,
            balance_before: None,
            balance_after: None,
            reversal_of: None,
            reversed_by: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Pending transaction for a priced charge
    pub fn for_charge(trace_id: &str, tenant_id: &str, kind: TransactionKind, charge: &UsageCharge) -> Self {
        let mut tx = Self::pending(trace_id, tenant_id, kind, charge.amount);
        tx.usage = charge.usage;
        tx.pricing = charge.pricing;
        tx
    }

    /// Signed balance change this transaction applies
    pub const fn balance_delta(&self) -> Micros {
        match self.kind {
            TransactionKind::Deduct => -self.amount,
            TransactionKind::Refund | TransactionKind::Recharge => self.amount,
        }
    }

    /// Mark committed against the post-charge balance
    pub fn commit(&mut self, balance_after: Micros) {
        self.status = TransactionStatus::Committed;
        self.balance_before = Some(balance_after - self.balance_delta());
        self.balance_after = Some(balance_after);
        self.updated_at = Timestamp::now();
    }
}

/// Amount to move plus the usage it was derived from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageCharge {
    pub amount: Micros,
    pub usage: TokenUsage,
    pub pricing: Option<Pricing>,
}

impl UsageCharge {
    /// Fixed amount with no token breakdown
    pub const fn flat(amount: Micros) -> Self {
        Self {
            amount,
            usage: TokenUsage::new(0, 0),
            pricing: None,
        }
    }

    /// Amount priced from token usage
    pub fn metered(usage: TokenUsage, pricing: Pricing) -> Self {
        Self {
            amount: usage.cost(&pricing),
            usage,
            pricing: Some(pricing),
        }
    }
}
