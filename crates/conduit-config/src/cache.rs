use std::time::Duration;

use serde::Deserialize;

/// Read-through cache tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// TTL applied when a caller does not pass one
    #[serde(default = "default_ttl", deserialize_with = "duration_str::deserialize_duration")]
    pub default_ttl: Duration,
    /// How long a single-flight refresh lock is held at most
    #[serde(default = "default_lock_ttl", deserialize_with = "duration_str::deserialize_duration")]
    pub lock_ttl: Duration,
    /// Delay between reads while waiting on another refresher
    #[serde(default = "default_wait_interval", deserialize_with = "duration_str::deserialize_duration")]
    pub wait_interval: Duration,
    /// Reads attempted before giving up and loading directly
    #[serde(default = "default_wait_attempts")]
    pub wait_attempts: u32,
    /// Relative TTL jitter, 0.1 spreads expiries over ±10%
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: default_ttl(),
            lock_ttl: default_lock_ttl(),
            wait_interval: default_wait_interval(),
            wait_attempts: default_wait_attempts(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

const fn default_ttl() -> Duration {
    Duration::from_secs(300)
}

const fn default_lock_ttl() -> Duration {
    Duration::from_secs(5)
}

const fn default_wait_interval() -> Duration {
    Duration::from_millis(50)
}

const fn default_wait_attempts() -> u32 {
    20
}

const fn default_jitter_ratio() -> f64 {
    0.1
}
