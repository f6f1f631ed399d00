use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use conduit_config::ProxyEntry;

/// Source of outbound proxies used after a transient network failure
#[async_trait]
pub trait ProxyPool: Send + Sync {
    /// A proxy not in `exclude`, or `None` when the pool is exhausted
    async fn next_proxy(&self, exclude: &[String]) -> Option<ProxyEntry>;
}

/// Round-robin over a fixed proxy list
#[derive(Debug, Default)]
pub struct StaticProxyPool {
    proxies: Vec<ProxyEntry>,
    cursor: AtomicUsize,
}

impl StaticProxyPool {
    pub fn new(proxies: Vec<ProxyEntry>) -> Self {
        Self {
            proxies,
            cursor: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ProxyPool for StaticProxyPool {
    async fn next_proxy(&self, exclude: &[String]) -> Option<ProxyEntry> {
        if self.proxies.is_empty() {
            return None;
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        (0..self.proxies.len())
            .map(|offset| &self.proxies[(start + offset) % self.proxies.len()])
            .find(|proxy| !exclude.contains(&proxy.id))
            .cloned()
    }
}
