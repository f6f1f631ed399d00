use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::SharedStore;
use crate::error::StoreError;
use crate::script::{AtomicScript, ScriptState};

#[derive(Debug, Clone)]
enum Value {
    String(String),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct State {
    slots: HashMap<String, Slot>,
}

impl State {
    /// Live slot for a key, evicting it first if expired
    fn live(&mut self, key: &str) -> Option<&mut Slot> {
        let now = Instant::now();
        if self.slots.get(key).is_some_and(|slot| slot.is_expired(now)) {
            self.slots.remove(key);
        }
        self.slots.get_mut(key)
    }
}

impl ScriptState for State {
    fn get(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        match self.live(key).map(|slot| &slot.value) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(Value::Hash(_)) => Err(StoreError::InvalidValue(format!("{key} holds a hash"))),
        }
    }

    fn set(&mut self, key: &str, value: String, ttl: Option<Duration>) {
        self.slots.insert(
            key.to_string(),
            Slot {
                value: Value::String(value),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
    }

    fn delete(&mut self, key: &str) -> bool {
        let existed = self.live(key).is_some();
        self.slots.remove(key);
        existed
    }

    fn hash_get_all(&mut self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        match self.live(key).map(|slot| &slot.value) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(fields)) => Ok(fields.clone()),
            Some(Value::String(_)) => Err(StoreError::InvalidValue(format!("{key} holds a string"))),
        }
    }

    fn hash_set_all(&mut self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        if let Some(slot) = self.live(key) {
            let Value::Hash(existing) = &mut slot.value else {
                return Err(StoreError::InvalidValue(format!("{key} holds a string")));
            };
            existing.extend(fields.iter().cloned());
            return Ok(());
        }

        self.slots.insert(
            key.to_string(),
            Slot {
                value: Value::Hash(fields.iter().cloned().collect()),
                expires_at: None,
            },
        );
        Ok(())
    }

    fn expire(&mut self, key: &str, ttl: Duration) -> bool {
        match self.live(key) {
            Some(slot) => {
                slot.expires_at = Some(Instant::now() + ttl);
                true
            }
            None => false,
        }
    }
}

/// In-process store with the same semantics as [`crate::RedisStore`]
///
/// Clones share state. The store can be switched offline to exercise
/// fallback paths of callers.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    offline: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with [`StoreError::Unavailable`]
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    /// Run `f` with the state locked
    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> Result<T, StoreError>) -> Result<T, StoreError> {
        if self.offline.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable("memory store is offline".to_string()));
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("offline", &self.offline.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_state(|state| state.get(key))
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        self.with_state(|state| {
            // MGET semantics: non-string values read as missing
            Ok(keys.iter().map(|key| state.get(key).ok().flatten()).collect())
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.with_state(|state| {
            state.set(key, value.to_string(), ttl);
            Ok(())
        })
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.with_state(|state| {
            if state.live(key).is_some() {
                return Ok(false);
            }
            state.set(key, value.to_string(), Some(ttl));
            Ok(true)
        })
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.with_state(|state| Ok(state.delete(key)))
    }

    async fn incr(&self, key: &str, by: i64) -> Result<i64, StoreError> {
        self.with_state(|state| {
            let Some(slot) = state.live(key) else {
                state.set(key, by.to_string(), None);
                return Ok(by);
            };

            let Value::String(current) = &mut slot.value else {
                return Err(StoreError::InvalidValue(format!("{key} holds a hash")));
            };
            let next = current
                .parse::<i64>()
                .map_err(|_| StoreError::InvalidValue(format!("{key} is not an integer")))?
                .checked_add(by)
                .ok_or_else(|| StoreError::InvalidValue(format!("{key} would overflow")))?;
            *current = next.to_string();
            Ok(next)
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.with_state(|state| Ok(state.expire(key, ttl)))
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.with_state(|state| state.hash_get_all(key))
    }

    async fn hash_set_all(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.with_state(|state| {
            state.hash_set_all(key, fields)?;
            if let Some(ttl) = ttl {
                state.expire(key, ttl);
            }
            Ok(())
        })
    }

    async fn run_script(
        &self,
        script: &AtomicScript,
        keys: &[String],
        args: &[String],
    ) -> Result<Vec<String>, StoreError> {
        self.with_state(|state| script.run_native(state, keys, args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_only_writes_once() {
        let store = MemoryStore::new();

        assert!(store.set_nx("lock", "a", Duration::from_secs(5)).await.unwrap());
        assert!(!store.set_nx("lock", "b", Duration::from_secs(5)).await.unwrap());
        assert_eq!(store.get("lock").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn values_expire() {
        let store = MemoryStore::new();
        store.set("k", "v", Some(Duration::from_millis(20))).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.set_nx("k", "again", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn incr_creates_and_increments() {
        let store = MemoryStore::new();

        assert_eq!(store.incr("ver", 1).await.unwrap(), 1);
        assert_eq!(store.incr("ver", 2).await.unwrap(), 3);

        store.set("text", "abc", None).await.unwrap();
        assert!(matches!(store.incr("text", 1).await, Err(StoreError::InvalidValue(_))));
    }

    #[tokio::test]
    async fn compare_and_delete_checks_owner() {
        let store = MemoryStore::new();
        store.set("lock", "owner-a", None).await.unwrap();

        assert!(!store.compare_and_delete("lock", "owner-b").await.unwrap());
        assert!(store.compare_and_delete("lock", "owner-a").await.unwrap());
        assert_eq!(store.get("lock").await.unwrap(), None);
    }

    #[tokio::test]
    async fn hashes_merge_fields() {
        let store = MemoryStore::new();
        let first = [("a".to_string(), "1".to_string())];
        let second = [("b".to_string(), "2".to_string())];

        store.hash_set_all("h", &first, None).await.unwrap();
        store
            .hash_set_all("h", &second, Some(Duration::from_secs(10)))
            .await
            .unwrap();

        let fields = store.hash_get_all("h").await.unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields.get("b").map(String::as_str), Some("2"));
        assert!(store.hash_get_all("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_many_preserves_order() {
        let store = MemoryStore::new();
        store.set("a", "1", None).await.unwrap();
        store.set("c", "3", None).await.unwrap();

        let values = store
            .get_many(&["a".to_string(), "b".to_string(), "c".to_string()])
            .await
            .unwrap();
        assert_eq!(values, vec![Some("1".to_string()), None, Some("3".to_string())]);
    }

    #[tokio::test]
    async fn offline_store_reports_unavailable() {
        let store = MemoryStore::new();
        store.set_offline(true);

        let err = store.get("k").await.unwrap_err();
        assert!(err.is_unavailable());

        store.set_offline(false);
        assert!(store.get("k").await.is_ok());
    }

    #[tokio::test]
    async fn clones_share_state() {
        let a = MemoryStore::new();
        let b = a.clone();

        a.set("shared", "yes", None).await.unwrap();
        assert_eq!(b.get("shared").await.unwrap().as_deref(), Some("yes"));
    }
}
