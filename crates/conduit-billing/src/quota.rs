use std::collections::HashMap;

use conduit_core::Micros;
use jiff::tz::TimeZone;
use jiff::{Timestamp, ToSpan};
use serde::{Deserialize, Serialize};

use crate::error::BillingError;
use crate::types::QuotaKind;

/// Quota row for one tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantQuota {
    pub tenant_id: String,
    pub balance: Micros,
    /// How far below zero the balance may go
    pub credit_limit: Micros,
    pub daily_limit: Option<u64>,
    pub daily_used: u64,
    pub daily_reset_at: Timestamp,
    pub monthly_limit: Option<u64>,
    pub monthly_used: u64,
    pub monthly_reset_at: Timestamp,
    pub rpm_limit: Option<u32>,
    pub tpm_limit: Option<u32>,
    /// Optimistic concurrency version
    pub version: u64,
}

impl TenantQuota {
    /// New quota with periods starting now
    pub fn new(tenant_id: impl Into<String>, balance: Micros, now: Timestamp) -> Self {
        let periods = PeriodBoundaries::at(now);
        Self {
            tenant_id: tenant_id.into(),
            balance,
            credit_limit: 0,
            daily_limit: None,
            daily_used: 0,
            daily_reset_at: periods.next_daily,
            monthly_limit: None,
            monthly_used: 0,
            monthly_reset_at: periods.next_monthly,
            rpm_limit: None,
            tpm_limit: None,
            version: 0,
        }
    }

    /// Reset counters whose period has ended
    pub fn roll_periods(&mut self, periods: &PeriodBoundaries) {
        if periods.now >= self.daily_reset_at {
            self.daily_used = 0;
            self.daily_reset_at = periods.next_daily;
        }
        if periods.now >= self.monthly_reset_at {
            self.monthly_used = 0;
            self.monthly_reset_at = periods.next_monthly;
        }
    }

    /// Check and apply a charge, bumping the version
    ///
    /// The balance is checked first, then the daily and monthly request
    /// counters. Nothing changes when a check fails.
    pub fn apply_charge(
        &mut self,
        charge: &QuotaCharge,
        policy: ChargePolicy,
        periods: &PeriodBoundaries,
    ) -> Result<(), BillingError> {
        let mut next = self.clone();
        next.roll_periods(periods);

        if charge.amount > 0 && !policy.allow_negative {
            let available = next.balance.saturating_add(next.credit_limit);
            if available < charge.amount {
                return Err(BillingError::InsufficientQuota {
                    kind: QuotaKind::Balance,
                    required: charge.amount,
                    available,
                });
            }
        }

        if policy.enforce_limits {
            check_requests(QuotaKind::Daily, next.daily_limit, next.daily_used, charge.daily_requests)?;
            check_requests(
                QuotaKind::Monthly,
                next.monthly_limit,
                next.monthly_used,
                charge.monthly_requests,
            )?;
        }

        next.balance = next.balance.saturating_sub(charge.amount);
        next.daily_used = next.daily_used.saturating_add(charge.daily_requests);
        next.monthly_used = next.monthly_used.saturating_add(charge.monthly_requests);
        next.version += 1;

        *self = next;
        Ok(())
    }

    /// Flat field list as stored in the shared-store mirror
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("tenant_id".to_string(), self.tenant_id.clone()),
            ("balance".to_string(), self.balance.to_string()),
            ("credit_limit".to_string(), self.credit_limit.to_string()),
            ("daily_limit".to_string(), encode_limit(self.daily_limit)),
            ("daily_used".to_string(), self.daily_used.to_string()),
            ("daily_reset_at".to_string(), self.daily_reset_at.as_second().to_string()),
            ("monthly_limit".to_string(), encode_limit(self.monthly_limit)),
            ("monthly_used".to_string(), self.monthly_used.to_string()),
            ("monthly_reset_at".to_string(), self.monthly_reset_at.as_second().to_string()),
            ("rpm_limit".to_string(), encode_limit(self.rpm_limit.map(u64::from))),
            ("tpm_limit".to_string(), encode_limit(self.tpm_limit.map(u64::from))),
            ("version".to_string(), self.version.to_string()),
        ]
    }

    /// Decode a mirror hash
    pub fn from_fields(tenant_id: &str, fields: &HashMap<String, String>) -> Result<Self, BillingError> {
        let field = |name: &str| {
            fields
                .get(name)
                .map(String::as_str)
                .ok_or_else(|| BillingError::InvalidQuotaState(format!("{tenant_id}: missing field {name}")))
        };
        let number = |name: &str| {
            field(name)?
                .parse::<i64>()
                .map_err(|_| BillingError::InvalidQuotaState(format!("{tenant_id}: field {name} is not an integer")))
        };
        let unsigned = |name: &str| {
            u64::try_from(number(name)?)
                .map_err(|_| BillingError::InvalidQuotaState(format!("{tenant_id}: field {name} is negative")))
        };
        let timestamp = |name: &str| {
            Timestamp::from_second(number(name)?)
                .map_err(|e| BillingError::InvalidQuotaState(format!("{tenant_id}: field {name}: {e}")))
        };
        let limit = |name: &str| Ok::<_, BillingError>(u64::try_from(number(name)?).ok());

        Ok(Self {
            tenant_id: tenant_id.to_string(),
            balance: number("balance")?,
            credit_limit: number("credit_limit")?,
            daily_limit: limit("daily_limit")?,
            daily_used: unsigned("daily_used")?,
            daily_reset_at: timestamp("daily_reset_at")?,
            monthly_limit: limit("monthly_limit")?,
            monthly_used: unsigned("monthly_used")?,
            monthly_reset_at: timestamp("monthly_reset_at")?,
            rpm_limit: limit("rpm_limit")?.and_then(|v| u32::try_from(v).ok()),
            tpm_limit: limit("tpm_limit")?.and_then(|v| u32::try_from(v).ok()),
            version: unsigned("version")?,
        })
    }
}

fn encode_limit(limit: Option<u64>) -> String {
    limit.map_or_else(|| "-1".to_string(), |v| v.to_string())
}

fn check_requests(kind: QuotaKind, limit: Option<u64>, used: u64, requested: u64) -> Result<(), BillingError> {
    let Some(limit) = limit else {
        return Ok(());
    };

    if used.saturating_add(requested) > limit {
        return Err(BillingError::InsufficientQuota {
            kind,
            required: i64::try_from(requested).unwrap_or(i64::MAX),
            available: i64::try_from(limit.saturating_sub(used)).unwrap_or(i64::MAX),
        });
    }

    Ok(())
}

/// Amount and request counts consumed by one charge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaCharge {
    /// Micro-units removed from the balance, negative to credit
    pub amount: Micros,
    pub daily_requests: u64,
    pub monthly_requests: u64,
}

/// Which checks a charge is subject to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChargePolicy {
    /// Skip the balance and credit limit check
    pub allow_negative: bool,
    /// Enforce daily and monthly request limits
    pub enforce_limits: bool,
}

impl ChargePolicy {
    /// Settlement of work already delivered: always applies
    pub const SETTLE: Self = Self {
        allow_negative: true,
        enforce_limits: false,
    };
}

/// Current time and the next UTC day and month boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodBoundaries {
    pub now: Timestamp,
    pub next_daily: Timestamp,
    pub next_monthly: Timestamp,
}

impl PeriodBoundaries {
    pub fn at(now: Timestamp) -> Self {
        let today = now.to_zoned(TimeZone::UTC).date();

        let next_daily = today
            .tomorrow()
            .and_then(|day| day.to_zoned(TimeZone::UTC))
            .map_or(now, |day| day.timestamp());

        let next_monthly = today
            .first_of_month()
            .checked_add(1.month())
            .and_then(|day| day.to_zoned(TimeZone::UTC))
            .map_or(now, |day| day.timestamp());

        Self {
            now,
            next_daily,
            next_monthly,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(raw: &str) -> Timestamp {
        raw.parse().unwrap()
    }

    fn charge(amount: Micros) -> QuotaCharge {
        QuotaCharge {
            amount,
            daily_requests: 1,
            monthly_requests: 1,
        }
    }

    const STRICT: ChargePolicy = ChargePolicy {
        allow_negative: false,
        enforce_limits: true,
    };

    #[test]
    fn boundaries_are_next_utc_midnight_and_month() {
        let periods = PeriodBoundaries::at(ts("2025-01-31T23:59:59Z"));
        assert_eq!(periods.next_daily, ts("2025-02-01T00:00:00Z"));
        assert_eq!(periods.next_monthly, ts("2025-02-01T00:00:00Z"));

        let periods = PeriodBoundaries::at(ts("2025-12-15T08:00:00Z"));
        assert_eq!(periods.next_daily, ts("2025-12-16T00:00:00Z"));
        assert_eq!(periods.next_monthly, ts("2026-01-01T00:00:00Z"));
    }

    #[test]
    fn deducts_balance_and_counts_requests() {
        let now = ts("2025-03-10T12:00:00Z");
        let mut quota = TenantQuota::new("t1", 10_000_000, now);

        quota
            .apply_charge(&charge(3_000_000), STRICT, &PeriodBoundaries::at(now))
            .unwrap();

        assert_eq!(quota.balance, 7_000_000);
        assert_eq!(quota.daily_used, 1);
        assert_eq!(quota.monthly_used, 1);
        assert_eq!(quota.version, 1);
    }

    #[test]
    fn insufficient_balance_reports_shortfall() {
        let now = ts("2025-03-10T12:00:00Z");
        let mut quota = TenantQuota::new("t1", 2_000_000, now);
        quota.credit_limit = 500_000;

        let err = quota
            .apply_charge(&charge(3_000_000), STRICT, &PeriodBoundaries::at(now))
            .unwrap_err();

        assert!(matches!(
            err,
            BillingError::InsufficientQuota {
                kind: QuotaKind::Balance,
                required: 3_000_000,
                available: 2_500_000
            }
        ));
        assert_eq!(quota.balance, 2_000_000);
        assert_eq!(quota.version, 0);
    }

    #[test]
    fn credit_limit_allows_going_negative() {
        let now = ts("2025-03-10T12:00:00Z");
        let mut quota = TenantQuota::new("t1", 1_000_000, now);
        quota.credit_limit = 5_000_000;

        quota
            .apply_charge(&charge(3_000_000), STRICT, &PeriodBoundaries::at(now))
            .unwrap();
        assert_eq!(quota.balance, -2_000_000);
    }

    #[test]
    fn daily_limit_is_checked_after_balance() {
        let now = ts("2025-03-10T12:00:00Z");
        let mut quota = TenantQuota::new("t1", 10_000_000, now);
        quota.daily_limit = Some(1);
        quota.monthly_limit = Some(10);
        quota.daily_used = 1;

        let err = quota
            .apply_charge(&charge(1), STRICT, &PeriodBoundaries::at(now))
            .unwrap_err();
        assert!(matches!(
            err,
            BillingError::InsufficientQuota {
                kind: QuotaKind::Daily,
                available: 0,
                ..
            }
        ));
    }

    #[test]
    fn daily_counter_resets_lazily_after_midnight() {
        let yesterday = ts("2025-03-10T23:00:00Z");
        let mut quota = TenantQuota::new("t1", 10_000_000, yesterday);
        quota.daily_limit = Some(1);
        quota.daily_used = 1;

        let today = ts("2025-03-11T00:00:01Z");
        quota
            .apply_charge(&charge(1), STRICT, &PeriodBoundaries::at(today))
            .unwrap();

        assert_eq!(quota.daily_used, 1);
        assert_eq!(quota.daily_reset_at, ts("2025-03-12T00:00:00Z"));
        assert_eq!(quota.monthly_reset_at, ts("2025-04-01T00:00:00Z"));
    }

    #[test]
    fn settlement_ignores_limits() {
        let now = ts("2025-03-10T12:00:00Z");
        let mut quota = TenantQuota::new("t1", 0, now);
        quota.daily_limit = Some(0);

        quota
            .apply_charge(&charge(4_000_000), ChargePolicy::SETTLE, &PeriodBoundaries::at(now))
            .unwrap();
        assert_eq!(quota.balance, -4_000_000);
    }

    #[test]
    fn fields_round_trip_with_unlimited_markers() {
        let now = ts("2025-03-10T12:00:00Z");
        let mut quota = TenantQuota::new("t1", 42, now);
        quota.monthly_limit = Some(100);
        quota.rpm_limit = Some(60);

        let fields: HashMap<String, String> = quota.to_fields().into_iter().collect();
        assert_eq!(fields["daily_limit"], "-1");

        let decoded = TenantQuota::from_fields("t1", &fields).unwrap();
        assert_eq!(decoded, quota);
    }
}
