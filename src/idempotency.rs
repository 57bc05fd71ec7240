use crate::http::env_u64;
use crate::models::RewriteResult;
use redis::AsyncCommands;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tracing::warn;

/// Finished rewrites keyed by caller and `Idempotency-Key`. Redis when
/// configured, process memory otherwise. Only `Done` results are stored, and
/// both backends forget them after `ttl_secs`.
#[derive(Clone)]
pub struct IdempotencyStore {
    redis: Option<redis::Client>,
    local: Arc<Mutex<HashMap<String, (Instant, RewriteResult)>>>,
    ttl_secs: u64,
}

impl IdempotencyStore {
    pub fn new(redis: Option<redis::Client>, ttl_secs: u64) -> Self {
        Self {
            redis,
            local: Arc::new(Mutex::new(HashMap::new())),
            ttl_secs,
        }
    }

    pub fn from_env(redis: Option<redis::Client>) -> Self {
        Self::new(redis, env_u64("IDEMPOTENCY_TTL_SECS", 3600))
    }

    fn key(identity: &str, key: &str) -> String {
        format!("idem:{identity}:{key}")
    }

    pub async fn get(&self, identity: &str, key: &str) -> Option<RewriteResult> {
        let key = Self::key(identity, key);
        match &self.redis {
            Some(client) => redis_get(client, &key).await,
            None => {
                let ttl = self.ttl();
                let mut guard = self.local.lock().await;
                let fresh = guard.get(&key).map(|(stored, _)| stored.elapsed() < ttl);
                match fresh {
                    Some(true) => guard.get(&key).map(|(_, result)| result.clone()),
                    Some(false) => {
                        guard.remove(&key);
                        None
                    }
                    None => None,
                }
            }
        }
    }

    pub async fn put(&self, identity: &str, key: &str, value: &RewriteResult) {
        let key = Self::key(identity, key);
        match &self.redis {
            Some(client) => redis_set(client, &key, value, self.ttl_secs).await,
            None => {
                let ttl = self.ttl();
                let mut guard = self.local.lock().await;
                guard.retain(|_, (stored, _)| stored.elapsed() < ttl);
                guard.insert(key, (Instant::now(), value.clone()));
            }
        }
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

async fn redis_get(client: &redis::Client, key: &str) -> Option<RewriteResult> {
    let mut conn = match client.get_multiplexed_async_connection().await {
        Ok(c) => c,
        Err(err) => {
            warn!(target: "wb.api", error = %err, "idempotency_lookup_unavailable");
            return None;
        }
    };
    let s = conn.get::<_, Option<String>>(key).await.ok().flatten();
    s.and_then(|v| serde_json::from_str(&v).ok())
}

async fn redis_set(client: &redis::Client, key: &str, value: &RewriteResult, ttl_secs: u64) {
    if let Ok(mut conn) = client.get_multiplexed_async_connection().await
        && let Ok(json) = serde_json::to_string(value)
    {
        let stored: Result<(), _> = conn.set_ex(key, json, ttl_secs).await;
        if let Err(err) = stored {
            warn!(target: "wb.api", error = %err, "idempotency_store_failed");
        }
    }
}
