//! Circuit breaker keyed by upstream host and credential
//!
//! State lives in the shared store so every gateway instance sees the same
//! circuit. Transitions run as atomic scripts. When the store is unreachable
//! the breaker keeps tracking in process memory.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use conduit_config::CircuitBreakerConfig;
use conduit_store::script::{arg, parse_arg};
use conduit_store::{AtomicScript, ScriptState, SharedStore, StoreError};
use dashmap::DashMap;

use crate::error::UpstreamError;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow normally
    Closed,
    /// Requests fail fast
    Open,
    /// Trial requests are admitted to test recovery
    HalfOpen,
}

impl CircuitState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "open" => Self::Open,
            "half_open" => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thresholds passed to the transition scripts
#[derive(Debug, Clone, Copy)]
struct Thresholds {
    failure_threshold: u32,
    reset_ms: i64,
    half_open_successes: u32,
}

impl Thresholds {
    fn from_config(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            reset_ms: i64::try_from(config.reset_timeout.as_millis()).unwrap_or(i64::MAX),
            half_open_successes: config.half_open_success_count.max(1),
        }
    }
}

/// Persisted breaker state for one key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct BreakerRecord {
    stored: StoredState,
    failures: u32,
    opened_at_ms: i64,
    trial_successes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum StoredState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl BreakerRecord {
    /// State as seen at `now_ms`: an open circuit past its reset timeout is half-open
    fn effective(&self, now_ms: i64, t: Thresholds) -> CircuitState {
        match self.stored {
            StoredState::Closed => CircuitState::Closed,
            StoredState::HalfOpen => CircuitState::HalfOpen,
            StoredState::Open if now_ms.saturating_sub(self.opened_at_ms) >= t.reset_ms => CircuitState::HalfOpen,
            StoredState::Open => CircuitState::Open,
        }
    }

    fn retry_after(&self, now_ms: i64, t: Thresholds) -> Duration {
        let remaining = self.opened_at_ms.saturating_add(t.reset_ms).saturating_sub(now_ms);
        Duration::from_millis(u64::try_from(remaining).unwrap_or(0))
    }

    fn on_failure(&mut self, now_ms: i64, t: Thresholds) -> (CircuitState, CircuitState) {
        let before = self.effective(now_ms, t);
        self.failures = self.failures.saturating_add(1);

        let reopen = match before {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => self.failures >= t.failure_threshold,
            CircuitState::Open => false,
        };
        if reopen {
            self.stored = StoredState::Open;
            self.opened_at_ms = now_ms;
            self.trial_successes = 0;
        }

        (before, self.effective(now_ms, t))
    }

    fn on_success(&mut self, now_ms: i64, t: Thresholds) -> (CircuitState, CircuitState) {
        let before = self.effective(now_ms, t);
        match before {
            CircuitState::Closed => self.failures = 0,
            CircuitState::HalfOpen => {
                self.stored = StoredState::HalfOpen;
                self.trial_successes = self.trial_successes.saturating_add(1);
                if self.trial_successes >= t.half_open_successes {
                    *self = Self::default();
                }
            }
            // Late success from a request admitted before the circuit opened
            CircuitState::Open => {}
        }

        (before, self.effective(now_ms, t))
    }

    fn to_fields(self) -> Vec<(String, String)> {
        let state = match self.stored {
            StoredState::Closed => "closed",
            StoredState::Open => "open",
            StoredState::HalfOpen => "half_open",
        };
        vec![
            ("state".to_string(), state.to_string()),
            ("failures".to_string(), self.failures.to_string()),
            ("opened_at".to_string(), self.opened_at_ms.to_string()),
            ("trial_successes".to_string(), self.trial_successes.to_string()),
        ]
    }

    fn from_fields(fields: &HashMap<String, String>) -> Self {
        let number = |name: &str| fields.get(name).and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);
        let stored = match fields.get("state").map(String::as_str) {
            Some("open") => StoredState::Open,
            Some("half_open") => StoredState::HalfOpen,
            _ => StoredState::Closed,
        };

        Self {
            stored,
            failures: u32::try_from(number("failures")).unwrap_or(0),
            opened_at_ms: number("opened_at"),
            trial_successes: u32::try_from(number("trial_successes")).unwrap_or(0),
        }
    }

    fn from_reply(reply: &[String]) -> Option<(CircuitState, CircuitState, Self)> {
        let [before, after, state, failures, opened_at, trials] = reply else {
            return None;
        };
        let fields = HashMap::from([
            ("state".to_string(), state.clone()),
            ("failures".to_string(), failures.clone()),
            ("opened_at".to_string(), opened_at.clone()),
            ("trial_successes".to_string(), trials.clone()),
        ]);
        Some((CircuitState::parse(before), CircuitState::parse(after), Self::from_fields(&fields)))
    }
}

/// Wrap a transition body with the shared load and save sections
///
/// ARGV: `now_ms`, `failure_threshold`, `reset_ms`, `half_open_successes`, `ttl_ms`.
/// Reply: state before, state after, then the stored fields.
macro_rules! transition_lua {
    ($body:literal) => {
        concat!(
            r"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local threshold = tonumber(ARGV[2])
local reset = tonumber(ARGV[3])
local needed = tonumber(ARGV[4])
local stored = redis.call('HGET', key, 'state') or 'closed'
local failures = tonumber(redis.call('HGET', key, 'failures') or '0')
local opened_at = tonumber(redis.call('HGET', key, 'opened_at') or '0')
local trials = tonumber(redis.call('HGET', key, 'trial_successes') or '0')
local function effective()
  if stored == 'open' and now - opened_at >= reset then return 'half_open' end
  return stored
end
local before = effective()
",
            $body,
            r"
redis.call('HSET', key, 'state', stored, 'failures', failures, 'opened_at', opened_at, 'trial_successes', trials)
redis.call('PEXPIRE', key, ARGV[5])
return {before, effective(), stored, string.format('%d', failures), string.format('%d', opened_at), string.format('%d', trials)}
"
        )
    };
}

const RECORD_FAILURE_LUA: &str = transition_lua!(
    r"
failures = failures + 1
if before == 'half_open' or (before == 'closed' and failures >= threshold) then
  stored = 'open'
  opened_at = now
  trials = 0
end
"
);

const RECORD_SUCCESS_LUA: &str = transition_lua!(
    r"
if before == 'closed' then
  failures = 0
elseif before == 'half_open' then
  stored = 'half_open'
  trials = trials + 1
  if trials >= needed then
    stored = 'closed'
    failures = 0
    opened_at = 0
    trials = 0
  end
end
"
);

fn run_transition(
    name: &'static str,
    state: &mut dyn ScriptState,
    keys: &[String],
    args: &[String],
    apply: fn(&mut BreakerRecord, i64, Thresholds) -> (CircuitState, CircuitState),
) -> Result<Vec<String>, StoreError> {
    let key = arg(name, keys, 0)?;
    let now_ms: i64 = parse_arg(name, args, 0)?;
    let thresholds = Thresholds {
        failure_threshold: parse_arg(name, args, 1)?,
        reset_ms: parse_arg(name, args, 2)?,
        half_open_successes: parse_arg(name, args, 3)?,
    };
    let ttl_ms: u64 = parse_arg(name, args, 4)?;

    let mut record = BreakerRecord::from_fields(&state.hash_get_all(key)?);
    let (before, after) = apply(&mut record, now_ms, thresholds);

    let fields = record.to_fields();
    state.hash_set_all(key, &fields)?;
    state.expire(key, Duration::from_millis(ttl_ms));

    let mut reply = vec![before.as_str().to_string(), after.as_str().to_string()];
    reply.extend(fields.into_iter().map(|(_, value)| value));
    Ok(reply)
}

fn record_failure_native(
    state: &mut dyn ScriptState,
    keys: &[String],
    args: &[String],
) -> Result<Vec<String>, StoreError> {
    run_transition("circuit_record_failure", state, keys, args, BreakerRecord::on_failure)
}

fn record_success_native(
    state: &mut dyn ScriptState,
    keys: &[String],
    args: &[String],
) -> Result<Vec<String>, StoreError> {
    run_transition("circuit_record_success", state, keys, args, BreakerRecord::on_success)
}

static RECORD_FAILURE: AtomicScript =
    AtomicScript::new("circuit_record_failure", RECORD_FAILURE_LUA, record_failure_native);

static RECORD_SUCCESS: AtomicScript =
    AtomicScript::new("circuit_record_success", RECORD_SUCCESS_LUA, record_success_native);

fn now_ms() -> i64 {
    jiff::Timestamp::now().as_millisecond()
}

/// Shared circuit breaker with an in-process fallback
pub struct CircuitBreaker {
    store: Arc<dyn SharedStore>,
    local: DashMap<String, BreakerRecord>,
    thresholds: Thresholds,
    ttl: Duration,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn SharedStore>, config: &CircuitBreakerConfig) -> Self {
        Self {
            store,
            local: DashMap::new(),
            thresholds: Thresholds::from_config(config),
            ttl: config.reset_timeout.saturating_mul(2).max(Duration::from_secs(1)),
        }
    }

    fn store_key(key: &str) -> String {
        format!("cb:{key}")
    }

    async fn load(&self, key: &str) -> BreakerRecord {
        match self.store.hash_get_all(&Self::store_key(key)).await {
            Ok(fields) => {
                let record = BreakerRecord::from_fields(&fields);
                self.local.insert(key.to_string(), record);
                record
            }
            Err(e) => {
                tracing::debug!(breaker = %key, error = %e, "breaker state unavailable, using local state");
                self.local.get(key).map(|r| *r).unwrap_or_default()
            }
        }
    }

    /// Current state of a circuit
    pub async fn state(&self, key: &str) -> CircuitState {
        self.load(key).await.effective(now_ms(), self.thresholds)
    }

    /// Fail fast while the circuit is open
    pub async fn check(&self, key: &str) -> Result<(), UpstreamError> {
        let now = now_ms();
        let record = self.load(key).await;
        if record.effective(now, self.thresholds) == CircuitState::Open {
            return Err(UpstreamError::CircuitOpen {
                key: key.to_string(),
                retry_after: record.retry_after(now, self.thresholds),
            });
        }
        Ok(())
    }

    pub async fn record_success(&self, key: &str) -> CircuitState {
        self.transition(key, &RECORD_SUCCESS, BreakerRecord::on_success).await
    }

    pub async fn record_failure(&self, key: &str) -> CircuitState {
        self.transition(key, &RECORD_FAILURE, BreakerRecord::on_failure).await
    }

    async fn transition(
        &self,
        key: &str,
        script: &AtomicScript,
        apply: fn(&mut BreakerRecord, i64, Thresholds) -> (CircuitState, CircuitState),
    ) -> CircuitState {
        let now = now_ms();
        let t = self.thresholds;
        let args = [
            now.to_string(),
            t.failure_threshold.to_string(),
            t.reset_ms.to_string(),
            t.half_open_successes.to_string(),
            self.ttl.as_millis().to_string(),
        ];

        let shared = self
            .store
            .run_script(script, &[Self::store_key(key)], &args)
            .await
            .and_then(|reply| {
                BreakerRecord::from_reply(&reply).ok_or_else(|| StoreError::Script {
                    name: script.name(),
                    message: format!("unexpected reply of {} values", reply.len()),
                })
            });

        let (before, after) = match shared {
            Ok((before, after, record)) => {
                self.local.insert(key.to_string(), record);
                (before, after)
            }
            Err(e) => {
                tracing::debug!(breaker = %key, error = %e, "recording breaker outcome locally");
                let mut entry = self.local.entry(key.to_string()).or_default();
                apply(entry.value_mut(), now, t)
            }
        };

        if before != after {
            log_transition(key, before, after);
        }
        after
    }
}

fn log_transition(key: &str, from: CircuitState, to: CircuitState) {
    conduit_telemetry::metrics::record_circuit_transition(from.as_str(), to.as_str());
    match to {
        CircuitState::Open => tracing::warn!(breaker = %key, from = %from, "circuit breaker opened"),
        CircuitState::Closed => tracing::info!(breaker = %key, "circuit breaker closed"),
        CircuitState::HalfOpen => tracing::debug!(breaker = %key, from = %from, "circuit breaker half-open"),
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("backend", &self.store.backend())
            .field("tracked", &self.local.len())
            .finish_non_exhaustive()
    }
}
