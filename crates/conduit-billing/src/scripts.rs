//! Atomic quota scripts for the shared-store mirror
//!
//! Every Lua body has a native twin built on [`TenantQuota::apply_charge`]
//! so in-process backends and Redis agree on the arithmetic.

use std::collections::HashMap;
use std::time::Duration;

use conduit_store::script::{arg, parse_arg};
use conduit_store::{AtomicScript, ScriptState, StoreError};
use jiff::Timestamp;

use crate::error::BillingError;
use crate::quota::{ChargePolicy, PeriodBoundaries, QuotaCharge, TenantQuota};

pub(crate) const REPLY_OK: &str = "OK";
pub(crate) const REPLY_MISS: &str = "MISS";
pub(crate) const REPLY_ERR: &str = "ERR";

/// Mirror key of a tenant's quota
pub fn quota_key(tenant_id: &str) -> String {
    format!("quota:{tenant_id}")
}

const QUOTA_DEDUCT_LUA: &str = r"
local key = KEYS[1]
if redis.call('EXISTS', key) == 0 then
  return {'MISS'}
end

local raw = redis.call('HGETALL', key)
local q = {}
for i = 1, #raw, 2 do
  q[raw[i]] = raw[i + 1]
end

local amount = tonumber(ARGV[1])
local daily_req = tonumber(ARGV[2])
local monthly_req = tonumber(ARGV[3])
local allow_negative = ARGV[4] == '1'
local enforce = ARGV[5] == '1'
local now = tonumber(ARGV[6])

local function fmt(n)
  return string.format('%d', n)
end

local balance = tonumber(q.balance)
local credit = tonumber(q.credit_limit)
local daily_used = tonumber(q.daily_used)
local daily_reset = tonumber(q.daily_reset_at)
local monthly_used = tonumber(q.monthly_used)
local monthly_reset = tonumber(q.monthly_reset_at)

if now >= daily_reset then
  daily_used = 0
  daily_reset = tonumber(ARGV[7])
end
if now >= monthly_reset then
  monthly_used = 0
  monthly_reset = tonumber(ARGV[8])
end

if amount > 0 and not allow_negative then
  local available = balance + credit
  if available < amount then
    return {'ERR', 'balance', fmt(amount), fmt(available)}
  end
end

if enforce then
  local daily_limit = tonumber(q.daily_limit)
  if daily_limit >= 0 and daily_used + daily_req > daily_limit then
    return {'ERR', 'daily', fmt(daily_req), fmt(math.max(daily_limit - daily_used, 0))}
  end
  local monthly_limit = tonumber(q.monthly_limit)
  if monthly_limit >= 0 and monthly_used + monthly_req > monthly_limit then
    return {'ERR', 'monthly', fmt(monthly_req), fmt(math.max(monthly_limit - monthly_used, 0))}
  end
end

redis.call('HSET', key,
  'balance', fmt(balance - amount),
  'daily_used', fmt(daily_used + daily_req),
  'daily_reset_at', fmt(daily_reset),
  'monthly_used', fmt(monthly_used + monthly_req),
  'monthly_reset_at', fmt(monthly_reset),
  'version', fmt(tonumber(q.version) + 1))

local reply = {'OK'}
local updated = redis.call('HGETALL', key)
for i = 1, #updated do
  reply[#reply + 1] = updated[i]
end
return reply
";

fn script_error(name: &'static str, e: &BillingError) -> StoreError {
    StoreError::Script {
        name,
        message: e.to_string(),
    }
}

fn quota_deduct_native(
    state: &mut dyn ScriptState,
    keys: &[String],
    args: &[String],
) -> Result<Vec<String>, StoreError> {
    const NAME: &str = "quota_deduct";

    let key = arg(NAME, keys, 0)?;
    let fields = state.hash_get_all(key)?;
    if fields.is_empty() {
        return Ok(vec![REPLY_MISS.to_string()]);
    }

    let tenant_id = fields.get("tenant_id").cloned().unwrap_or_default();
    let mut quota = TenantQuota::from_fields(&tenant_id, &fields).map_err(|e| script_error(NAME, &e))?;

    let charge = QuotaCharge {
        amount: parse_arg(NAME, args, 0)?,
        daily_requests: parse_arg(NAME, args, 1)?,
        monthly_requests: parse_arg(NAME, args, 2)?,
    };
    let policy = ChargePolicy {
        allow_negative: arg(NAME, args, 3)? == "1",
        enforce_limits: arg(NAME, args, 4)? == "1",
    };
    let second = |index| {
        let secs: i64 = parse_arg(NAME, args, index)?;
        Timestamp::from_second(secs).map_err(|e| StoreError::Script {
            name: NAME,
            message: e.to_string(),
        })
    };
    let periods = PeriodBoundaries {
        now: second(5)?,
        next_daily: second(6)?,
        next_monthly: second(7)?,
    };

    match quota.apply_charge(&charge, policy, &periods) {
        Ok(()) => {
            let updated = quota.to_fields();
            state.hash_set_all(key, &updated)?;
            let mut reply = vec![REPLY_OK.to_string()];
            for (field, value) in updated {
                reply.push(field);
                reply.push(value);
            }
            Ok(reply)
        }
        Err(BillingError::InsufficientQuota {
            kind,
            required,
            available,
        }) => Ok(vec![
            REPLY_ERR.to_string(),
            kind.to_string(),
            required.to_string(),
            available.to_string(),
        ]),
        Err(e) => Err(script_error(NAME, &e)),
    }
}

/// Check and apply a charge against the mirror in one round trip
///
/// KEYS: quota key. ARGV: amount, daily requests, monthly requests,
/// allow-negative flag, enforce-limits flag, now, next daily reset and next
/// monthly reset (epoch seconds). Replies `MISS`, `ERR kind required
/// available` or `OK` followed by the updated field pairs.
pub static QUOTA_DEDUCT: AtomicScript = AtomicScript::new("quota_deduct", QUOTA_DEDUCT_LUA, quota_deduct_native);

const QUOTA_SEED_LUA: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return {'0'}
end
for i = 2, #ARGV, 2 do
  redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
end
redis.call('PEXPIRE', KEYS[1], ARGV[1])
return {'1'}
";

fn quota_seed_native(state: &mut dyn ScriptState, keys: &[String], args: &[String]) -> Result<Vec<String>, StoreError> {
    const NAME: &str = "quota_seed";

    let key = arg(NAME, keys, 0)?;
    if !state.hash_get_all(key)?.is_empty() {
        return Ok(vec!["0".to_string()]);
    }

    let ttl_ms: u64 = parse_arg(NAME, args, 0)?;
    let fields: Vec<(String, String)> = args[1..]
        .chunks_exact(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect();

    state.hash_set_all(key, &fields)?;
    state.expire(key, Duration::from_millis(ttl_ms));
    Ok(vec!["1".to_string()])
}

/// Write a quota snapshot into the mirror unless one is already there
///
/// ARGV: TTL in milliseconds followed by field pairs.
pub static QUOTA_SEED: AtomicScript = AtomicScript::new("quota_seed", QUOTA_SEED_LUA, quota_seed_native);

/// Arguments for [`QUOTA_SEED`]
pub(crate) fn seed_args(quota: &TenantQuota, ttl: Duration) -> Vec<String> {
    let mut args = vec![u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1).to_string()];
    for (field, value) in quota.to_fields() {
        args.push(field);
        args.push(value);
    }
    args
}

/// Arguments for [`QUOTA_DEDUCT`]
pub(crate) fn deduct_args(charge: &QuotaCharge, policy: ChargePolicy, periods: &PeriodBoundaries) -> Vec<String> {
    let flag = |on: bool| if on { "1" } else { "0" }.to_string();
    vec![
        charge.amount.to_string(),
        charge.daily_requests.to_string(),
        charge.monthly_requests.to_string(),
        flag(policy.allow_negative),
        flag(policy.enforce_limits),
        periods.now.as_second().to_string(),
        periods.next_daily.as_second().to_string(),
        periods.next_monthly.as_second().to_string(),
    ]
}

/// Decoded reply of [`QUOTA_DEDUCT`]
#[derive(Debug)]
pub(crate) enum DeductReply {
    Applied(TenantQuota),
    Missing,
    Rejected(BillingError),
}

pub(crate) fn parse_deduct_reply(tenant_id: &str, reply: &[String]) -> Result<DeductReply, BillingError> {
    let invalid = || BillingError::InvalidQuotaState(format!("{tenant_id}: unexpected deduct reply {reply:?}"));

    match reply.first().map(String::as_str) {
        Some(REPLY_MISS) => Ok(DeductReply::Missing),
        Some(REPLY_ERR) => {
            let [_, kind, required, available] = reply else {
                return Err(invalid());
            };
            let kind = crate::types::QuotaKind::parse(kind).ok_or_else(invalid)?;
            Ok(DeductReply::Rejected(BillingError::InsufficientQuota {
                kind,
                required: required.parse().map_err(|_| invalid())?,
                available: available.parse().map_err(|_| invalid())?,
            }))
        }
        Some(REPLY_OK) => {
            let fields: HashMap<String, String> = reply[1..]
                .chunks_exact(2)
                .map(|pair| (pair[0].clone(), pair[1].clone()))
                .collect();
            Ok(DeductReply::Applied(TenantQuota::from_fields(tenant_id, &fields)?))
        }
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use conduit_store::{MemoryStore, SharedStore};

    use super::*;
    use crate::types::QuotaKind;

    fn periods() -> PeriodBoundaries {
        PeriodBoundaries::at("2025-06-01T10:00:00Z".parse().unwrap())
    }

    const STRICT: ChargePolicy = ChargePolicy {
        allow_negative: false,
        enforce_limits: true,
    };

    async fn run_deduct(store: &MemoryStore, amount: i64) -> DeductReply {
        let charge = QuotaCharge {
            amount,
            daily_requests: 1,
            monthly_requests: 1,
        };
        let reply = store
            .run_script(&QUOTA_DEDUCT, &[quota_key("t1")], &deduct_args(&charge, STRICT, &periods()))
            .await
            .unwrap();
        parse_deduct_reply("t1", &reply).unwrap()
    }

    #[tokio::test]
    async fn deduct_reports_miss_for_unseeded_tenant() {
        let store = MemoryStore::new();
        assert!(matches!(run_deduct(&store, 1).await, DeductReply::Missing));
    }

    #[tokio::test]
    async fn seed_then_deduct_updates_mirror() {
        let store = MemoryStore::new();
        let quota = TenantQuota::new("t1", 10_000_000, periods().now);
        let seeded = store
            .run_script(&QUOTA_SEED, &[quota_key("t1")], &seed_args(&quota, Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(seeded, vec!["1".to_string()]);

        let DeductReply::Applied(updated) = run_deduct(&store, 3_000_000).await else {
            panic!("expected deduct to apply");
        };
        assert_eq!(updated.balance, 7_000_000);
        assert_eq!(updated.version, 1);

        // A second seed must not clobber the charged mirror
        let again = store
            .run_script(&QUOTA_SEED, &[quota_key("t1")], &seed_args(&quota, Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(again, vec!["0".to_string()]);
    }

    #[tokio::test]
    async fn rejected_deduct_leaves_mirror_unchanged() {
        let store = MemoryStore::new();
        let quota = TenantQuota::new("t1", 1_000, periods().now);
        store
            .run_script(&QUOTA_SEED, &[quota_key("t1")], &seed_args(&quota, Duration::from_secs(60)))
            .await
            .unwrap();

        let DeductReply::Rejected(err) = run_deduct(&store, 5_000).await else {
            panic!("expected rejection");
        };
        assert!(matches!(
            err,
            BillingError::InsufficientQuota {
                kind: QuotaKind::Balance,
                required: 5_000,
                available: 1_000
            }
        ));

        let fields = store.hash_get_all(&quota_key("t1")).await.unwrap();
        assert_eq!(fields["balance"], "1000");
        assert_eq!(fields["version"], "0");
    }

    #[test]
    fn malformed_replies_are_rejected() {
        let reply = vec!["ERR".to_string(), "balance".to_string()];
        assert!(matches!(
            parse_deduct_reply("t1", &reply),
            Err(BillingError::InvalidQuotaState(_))
        ));
        assert!(parse_deduct_reply("t1", &[]).is_err());
    }

    #[test]
    fn lua_bodies_format_numbers_as_integers() {
        assert!(QUOTA_DEDUCT.lua().contains("string.format('%d'"));
        assert!(QUOTA_SEED.lua().contains("PEXPIRE"));
    }
}
