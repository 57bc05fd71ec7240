use crate::http::env_u64;
use async_trait::async_trait;
use redis::AsyncCommands;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("quota backend unavailable: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for QuotaError {
    fn from(err: redis::RedisError) -> Self {
        QuotaError::Backend(err.to_string())
    }
}

/// One rewrite taken off an identity's balance when the request is admitted.
/// Kept when the rewrite finishes, handed back through `refund` otherwise.
#[derive(Debug)]
pub struct Credit {
    identity: String,
    remaining: i64,
}

impl Credit {
    fn new(identity: &str, remaining: i64) -> Self {
        Self {
            identity: identity.to_string(),
            remaining,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Balance left after this credit was taken.
    pub fn remaining(&self) -> i64 {
        self.remaining
    }
}

/// Remaining free rewrites per identity.
#[async_trait]
pub trait QuotaLedger: Send + Sync {
    async fn remaining(&self, identity: &str) -> Result<i64, QuotaError>;
    /// Takes one rewrite off the balance, `None` when nothing is left.
    /// Concurrent callers never take more than the balance holds.
    async fn reserve(&self, identity: &str) -> Result<Option<Credit>, QuotaError>;
    /// Puts an unused credit back and returns the new balance.
    async fn refund(&self, credit: Credit) -> Result<i64, QuotaError>;
}

pub struct InMemoryQuota {
    initial: i64,
    balances: Mutex<HashMap<String, i64>>,
}

impl InMemoryQuota {
    pub fn new(initial: i64) -> Self {
        Self {
            initial,
            balances: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl QuotaLedger for InMemoryQuota {
    async fn remaining(&self, identity: &str) -> Result<i64, QuotaError> {
        let guard = self.balances.lock().await;
        Ok(guard.get(identity).copied().unwrap_or(self.initial))
    }

    async fn reserve(&self, identity: &str) -> Result<Option<Credit>, QuotaError> {
        let mut guard = self.balances.lock().await;
        let balance = guard.entry(identity.to_string()).or_insert(self.initial);
        if *balance <= 0 {
            return Ok(None);
        }
        *balance -= 1;
        Ok(Some(Credit::new(identity, *balance)))
    }

    async fn refund(&self, credit: Credit) -> Result<i64, QuotaError> {
        let mut guard = self.balances.lock().await;
        let balance = guard.entry(credit.identity).or_insert(self.initial);
        *balance += 1;
        Ok(*balance)
    }
}

pub struct RedisQuota {
    client: redis::Client,
    initial: i64,
}

impl RedisQuota {
    pub fn new(client: redis::Client, initial: i64) -> Self {
        Self { client, initial }
    }

    fn key(identity: &str) -> String {
        format!("quota:{identity}")
    }
}

#[async_trait]
impl QuotaLedger for RedisQuota {
    async fn remaining(&self, identity: &str) -> Result<i64, QuotaError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let value: Option<i64> = conn.get(Self::key(identity)).await?;
        Ok(value.unwrap_or(self.initial))
    }

    async fn reserve(&self, identity: &str) -> Result<Option<Credit>, QuotaError> {
        let key = Self::key(identity);
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: bool = conn.set_nx(&key, self.initial).await?;
        let left: i64 = conn.decr(&key, 1).await?;
        if left < 0 {
            let _: i64 = conn.incr(&key, 1).await?;
            return Ok(None);
        }
        Ok(Some(Credit::new(identity, left)))
    }

    async fn refund(&self, credit: Credit) -> Result<i64, QuotaError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        Ok(conn.incr(Self::key(&credit.identity), 1).await?)
    }
}

pub fn free_quota_from_env() -> i64 {
    env_u64("FREE_QUOTA", 3) as i64
}

pub fn ledger_from_env(redis: Option<&redis::Client>) -> Arc<dyn QuotaLedger> {
    let initial = free_quota_from_env();
    match redis {
        Some(client) => {
            info!(target: "wb.quota", initial, "using redis quota ledger");
            Arc::new(RedisQuota::new(client.clone(), initial))
        }
        None => {
            warn!(
                target: "wb.quota",
                initial, "REDIS_URL not set; quota balances live in process memory"
            );
            Arc::new(InMemoryQuota::new(initial))
        }
    }
}
