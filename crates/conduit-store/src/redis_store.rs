use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use crate::SharedStore;
use crate::error::StoreError;
use crate::script::AtomicScript;

/// Redis-backed shared store
///
/// Uses a [`ConnectionManager`] that reconnects transparently. Every key is
/// namespaced with the configured prefix.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisStore {
    /// Connect to Redis and verify the connection
    pub async fn connect(url: &str, key_prefix: impl Into<String>) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Unavailable(format!("invalid Redis URL: {e}")))?;
        let conn = ConnectionManager::new(client).await?;

        tracing::debug!("connected to Redis shared store");

        Ok(Self {
            conn,
            key_prefix: key_prefix.into(),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.key_prefix)
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl SharedStore for RedisStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value = redis::cmd("GET")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let prefixed: Vec<String> = keys.iter().map(|key| self.key(key)).collect();
        let values = redis::cmd("MGET").arg(&prefixed).query_async(&mut conn).await?;
        Ok(values)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.key(key)).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL").arg(self.key(key)).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn incr(&self, key: &str, by: i64) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let value = redis::cmd("INCRBY")
            .arg(self.key(key))
            .arg(by)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let applied: i64 = redis::cmd("PEXPIRE")
            .arg(self.key(key))
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.conn.clone();
        let fields = redis::cmd("HGETALL").arg(self.key(key)).query_async(&mut conn).await?;
        Ok(fields)
    }

    async fn hash_set_all(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }

        let key = self.key(key);
        let mut pipe = redis::pipe();
        pipe.atomic().cmd("HSET").arg(&key).arg(fields).ignore();
        if let Some(ttl) = ttl {
            pipe.cmd("PEXPIRE").arg(&key).arg(millis(ttl)).ignore();
        }

        let mut conn = self.conn.clone();
        let () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn run_script(
        &self,
        script: &AtomicScript,
        keys: &[String],
        args: &[String],
    ) -> Result<Vec<String>, StoreError> {
        let lua = redis::Script::new(script.lua());
        let mut invocation = lua.prepare_invoke();
        for key in keys {
            invocation.key(self.key(key));
        }
        for arg in args {
            invocation.arg(arg);
        }

        let mut conn = self.conn.clone();
        invocation.invoke_async(&mut conn).await.map_err(|e| {
            let err = StoreError::from(e);
            match err {
                StoreError::Unavailable(_) => err,
                other => StoreError::Script {
                    name: script.name(),
                    message: other.to_string(),
                },
            }
        })
    }
}
