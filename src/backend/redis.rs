//! Redis backend implementation.
//!
//! Thin adapter mapping the [`BackendClient`] command surface onto a multiplexed
//! `redis::aio::ConnectionManager`. The connection manager reconnects on its own;
//! deadlines, failover and circuit protection live one layer up in the
//! [`BackendManager`](super::BackendManager).

use super::{BackendClient, BackendConnector, SharedClient, redact_url};
use crate::error::{BackendFailure, BackendResult};
use async_trait::async_trait;

use redis::{AsyncCommands, Client, aio::ConnectionManager};

use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

/// Redis backend adapter
#[derive(Clone)]
pub struct RedisBackend {
    /// Redis connection manager
    conn: ConnectionManager,
    /// Redacted URL for diagnostics
    url: String,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

fn classify(err: redis::RedisError) -> BackendFailure {
    if err.is_timeout() {
        BackendFailure::Timeout { timeout_ms: 0 }
    } else if err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_unrecoverable_error()
    {
        BackendFailure::unavailable(err.to_string())
    } else {
        BackendFailure::protocol(err.to_string())
    }
}

impl RedisBackend {
    /// Connect to Redis within `connect_timeout`
    pub async fn connect(url: &str, connect_timeout: Duration) -> BackendResult<Self> {
        let redacted = redact_url(url);
        let client = Client::open(url).map_err(|e| {
            BackendFailure::protocol(format!("Failed to create Redis client for {redacted}: {e}"))
        })?;

        let conn = timeout(connect_timeout, client.get_connection_manager())
            .await
            .map_err(|_| BackendFailure::Timeout {
                timeout_ms: connect_timeout.as_millis() as u64,
            })?
            .map_err(classify)?;

        info!(url = %redacted, "Connected to Redis");

        Ok(Self {
            conn,
            url: redacted,
        })
    }
}

#[async_trait]
impl BackendClient for RedisBackend {
    async fn get(&self, key: &str) -> BackendResult<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(classify)
    }

    async fn set(&self, key: &str, value: &str) -> BackendResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await.map_err(classify)?;
        Ok(())
    }

    async fn setex(&self, key: &str, ttl_secs: u64, value: &str) -> BackendResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl_secs).await.map_err(classify)?;
        Ok(())
    }

    async fn del(&self, key: &str) -> BackendResult<u64> {
        let mut conn = self.conn.clone();
        conn.del(key).await.map_err(classify)
    }

    async fn lpush(&self, key: &str, value: &str) -> BackendResult<u64> {
        let mut conn = self.conn.clone();
        conn.lpush(key, value).await.map_err(classify)
    }

    async fn rpop(&self, key: &str) -> BackendResult<Option<String>> {
        let mut conn = self.conn.clone();
        conn.rpop(key, None).await.map_err(classify)
    }

    async fn llen(&self, key: &str) -> BackendResult<u64> {
        let mut conn = self.conn.clone();
        conn.llen(key).await.map_err(classify)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> BackendResult<u64> {
        let mut conn = self.conn.clone();
        conn.zadd(key, member, score).await.map_err(classify)
    }

    async fn zcount(&self, key: &str, min: f64, max: f64) -> BackendResult<u64> {
        let mut conn = self.conn.clone();
        conn.zcount(key, score_bound(min), score_bound(max))
            .await
            .map_err(classify)
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> BackendResult<u64> {
        let mut conn = self.conn.clone();
        conn.zrembyscore(key, score_bound(min), score_bound(max))
            .await
            .map_err(classify)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> BackendResult<bool> {
        let mut conn = self.conn.clone();
        let ttl = i64::try_from(ttl_secs).unwrap_or(i64::MAX);
        conn.expire(key, ttl).await.map_err(classify)
    }

    async fn ping(&self) -> BackendResult<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(classify)?;
        debug!(url = %self.url, reply = %pong, "Redis ping");
        Ok(())
    }

    async fn info(&self) -> BackendResult<String> {
        let mut conn = self.conn.clone();
        redis::cmd("INFO")
            .query_async(&mut conn)
            .await
            .map_err(classify)
    }
}

/// Redis spells infinite score bounds as `-inf`/`+inf`
fn score_bound(score: f64) -> String {
    if score == f64::INFINITY {
        "+inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        score.to_string()
    }
}

/// Connector producing [`RedisBackend`] adapters
#[derive(Debug, Default, Clone, Copy)]
pub struct RedisConnector;

#[async_trait]
impl BackendConnector for RedisConnector {
    async fn connect(&self, url: &str, timeout: Duration) -> BackendResult<SharedClient> {
        let backend = RedisBackend::connect(url, timeout).await?;
        Ok(Arc::new(backend) as SharedClient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_bounds() {
        assert_eq!(score_bound(f64::INFINITY), "+inf");
        assert_eq!(score_bound(f64::NEG_INFINITY), "-inf");
        assert_eq!(score_bound(1.5), "1.5");
    }

    // Note: These tests require a running Redis instance

    #[tokio::test]
    #[ignore] // Ignore by default since it requires Redis
    async fn test_redis_round_trip() {
        let backend = RedisBackend::connect("redis://localhost:6379", Duration::from_secs(2))
            .await
            .expect("Failed to connect to Redis");

        backend.ping().await.unwrap();
        backend.setex("sentinelq:test:key", 10, "value").await.unwrap();
        assert_eq!(
            backend.get("sentinelq:test:key").await.unwrap(),
            Some("value".to_string())
        );
        assert_eq!(backend.del("sentinelq:test:key").await.unwrap(), 1);

        backend.lpush("sentinelq:test:list", "a").await.unwrap();
        assert_eq!(
            backend.rpop("sentinelq:test:list").await.unwrap(),
            Some("a".to_string())
        );
    }
}
