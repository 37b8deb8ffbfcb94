// Redis-backed cache store, shared between processes pricing the same chain.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::time::Duration;

use super::CacheStore;

/// [`CacheStore`] over a multiplexed Redis connection.
///
/// Keys are prefixed with a namespace so several deployments can share one
/// Redis instance.
#[derive(Clone)]
pub struct RedisCacheStore {
    conn: ConnectionManager,
    namespace: String,
}

impl RedisCacheStore {
    pub async fn connect(url: &str, namespace: &str) -> Result<Self> {
        let client = Client::open(url).context("Failed to create Redis client")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;

        info!("Redis cache store connected to {}", url);
        Ok(Self {
            conn,
            namespace: namespace.to_string(),
        })
    }

    fn namespaced(&self, key: &str) -> String {
        if self.namespace.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.namespace, key)
        }
    }

    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Redis health check failed")?;
        debug!("Redis health check: {}", pong);
        Ok(())
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn
            .get(self.namespaced(key))
            .await
            .with_context(|| format!("Failed to read {} from Redis", key))?;
        Ok(value)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = self.namespaced(key);
        if ttl.is_zero() {
            conn.set::<_, _, ()>(&key, value)
                .await
                .with_context(|| format!("Failed to write {} to Redis", key))?;
        } else {
            // SETEX rejects a zero expiry, so sub-second TTLs round up.
            let seconds = ttl.as_secs().max(1);
            conn.set_ex::<_, _, ()>(&key, value, seconds)
                .await
                .with_context(|| format!("Failed to write {} to Redis", key))?;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(self.namespaced(key))
            .await
            .with_context(|| format!("Failed to delete {} from Redis", key))?;
        Ok(())
    }
}
