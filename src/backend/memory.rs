//! In-memory backend implementation.
//!
//! Implements the full [`BackendClient`] command surface with standard collections.
//! It backs development setups and the test suite, where `set_available(false)`
//! simulates a backend outage and `set_latency` simulates a slow one.
//!
//! # Features
//!
//! - **Fast**: direct memory access, no network
//! - **Faithful**: list, string-with-TTL and sorted-set semantics match Redis
//! - **Fault injection**: outages and latency can be toggled at runtime

use super::{BackendClient, BackendConnector, SharedClient};
use crate::error::{BackendFailure, BackendResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Store {
    strings: HashMap<String, String>,
    lists: HashMap<String, VecDeque<String>>,
    zsets: HashMap<String, HashMap<String, f64>>,
    expiries: HashMap<String, Instant>,
}

impl Store {
    fn purge_if_expired(&mut self, key: &str) {
        if let Some(at) = self.expiries.get(key) {
            if Instant::now() >= *at {
                self.remove(key);
            }
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        self.expiries.remove(key);
        let removed_string = self.strings.remove(key).is_some();
        let removed_list = self.lists.remove(key).is_some();
        let removed_zset = self.zsets.remove(key).is_some();
        removed_string || removed_list || removed_zset
    }

    fn exists(&self, key: &str) -> bool {
        self.strings.contains_key(key) || self.lists.contains_key(key) || self.zsets.contains_key(key)
    }
}

/// In-memory backend with fault injection
#[derive(Debug)]
pub struct InMemoryBackend {
    store: Mutex<Store>,
    available: AtomicBool,
    latency: Mutex<Duration>,
    commands: AtomicU64,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    /// Create an empty, reachable backend
    pub fn new() -> Self {
        Self {
            store: Mutex::new(Store::default()),
            available: AtomicBool::new(true),
            latency: Mutex::new(Duration::ZERO),
            commands: AtomicU64::new(0),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Whether the backend currently accepts commands
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Delay every command by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Number of commands accepted so far
    pub fn command_count(&self) -> u64 {
        self.commands.load(Ordering::Relaxed)
    }

    /// Contents of a list, head first
    pub fn list_snapshot(&self, key: &str) -> Vec<String> {
        let store = self.store.lock();
        store
            .lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop all data
    pub fn flush(&self) {
        *self.store.lock() = Store::default();
    }

    async fn enter(&self) -> BackendResult<()> {
        if !self.is_available() {
            return Err(BackendFailure::unavailable("connection refused"));
        }
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if !self.is_available() {
            return Err(BackendFailure::unavailable("connection reset"));
        }
        self.commands.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl BackendClient for InMemoryBackend {
    async fn get(&self, key: &str) -> BackendResult<Option<String>> {
        self.enter().await?;
        let mut store = self.store.lock();
        store.purge_if_expired(key);
        if store.lists.contains_key(key) || store.zsets.contains_key(key) {
            return Err(BackendFailure::protocol(
                "WRONGTYPE Operation against a key holding the wrong kind of value",
            ));
        }
        Ok(store.strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> BackendResult<()> {
        self.enter().await?;
        let mut store = self.store.lock();
        store.remove(key);
        store.strings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn setex(&self, key: &str, ttl_secs: u64, value: &str) -> BackendResult<()> {
        if ttl_secs == 0 {
            return Err(BackendFailure::protocol("invalid expire time in 'setex' command"));
        }
        self.enter().await?;
        let mut store = self.store.lock();
        store.remove(key);
        store.strings.insert(key.to_string(), value.to_string());
        store
            .expiries
            .insert(key.to_string(), Instant::now() + Duration::from_secs(ttl_secs));
        Ok(())
    }

    async fn del(&self, key: &str) -> BackendResult<u64> {
        self.enter().await?;
        let mut store = self.store.lock();
        store.purge_if_expired(key);
        Ok(u64::from(store.remove(key)))
    }

    async fn lpush(&self, key: &str, value: &str) -> BackendResult<u64> {
        self.enter().await?;
        let mut store = self.store.lock();
        store.purge_if_expired(key);
        let list = store.lists.entry(key.to_string()).or_default();
        list.push_front(value.to_string());
        Ok(list.len() as u64)
    }

    async fn rpop(&self, key: &str) -> BackendResult<Option<String>> {
        self.enter().await?;
        let mut store = self.store.lock();
        store.purge_if_expired(key);
        let Some(list) = store.lists.get_mut(key) else {
            return Ok(None);
        };
        let value = list.pop_back();
        if list.is_empty() {
            store.remove(key);
        }
        Ok(value)
    }

    async fn llen(&self, key: &str) -> BackendResult<u64> {
        self.enter().await?;
        let mut store = self.store.lock();
        store.purge_if_expired(key);
        Ok(store.lists.get(key).map_or(0, |list| list.len() as u64))
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> BackendResult<u64> {
        self.enter().await?;
        let mut store = self.store.lock();
        store.purge_if_expired(key);
        let zset = store.zsets.entry(key.to_string()).or_default();
        Ok(u64::from(zset.insert(member.to_string(), score).is_none()))
    }

    async fn zcount(&self, key: &str, min: f64, max: f64) -> BackendResult<u64> {
        self.enter().await?;
        let mut store = self.store.lock();
        store.purge_if_expired(key);
        Ok(store.zsets.get(key).map_or(0, |zset| {
            zset.values().filter(|s| **s >= min && **s <= max).count() as u64
        }))
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> BackendResult<u64> {
        self.enter().await?;
        let mut store = self.store.lock();
        store.purge_if_expired(key);
        let Some(zset) = store.zsets.get_mut(key) else {
            return Ok(0);
        };
        let before = zset.len();
        zset.retain(|_, s| *s < min || *s > max);
        let removed = (before - zset.len()) as u64;
        if zset.is_empty() {
            store.remove(key);
        }
        Ok(removed)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> BackendResult<bool> {
        self.enter().await?;
        let mut store = self.store.lock();
        store.purge_if_expired(key);
        if !store.exists(key) {
            return Ok(false);
        }
        store
            .expiries
            .insert(key.to_string(), Instant::now() + Duration::from_secs(ttl_secs));
        Ok(true)
    }

    async fn ping(&self) -> BackendResult<()> {
        self.enter().await
    }

    async fn info(&self) -> BackendResult<String> {
        self.enter().await?;
        let store = self.store.lock();
        Ok(format!(
            "# Server\r\nredis_mode:memory\r\n# Keyspace\r\nstrings:{}\r\nlists:{}\r\nzsets:{}\r\n",
            store.strings.len(),
            store.lists.len(),
            store.zsets.len()
        ))
    }
}

/// Connector handing out in-memory nodes by URL.
///
/// URLs without a registered node resolve to the default node, so a primary and any
/// number of unregistered replicas share one store unless told otherwise.
#[derive(Debug, Default)]
pub struct MemoryConnector {
    default_node: Arc<InMemoryBackend>,
    nodes: HashMap<String, Arc<InMemoryBackend>>,
}

impl MemoryConnector {
    /// Create a connector with a fresh default node
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a connector around an existing default node
    pub fn with_backend(backend: Arc<InMemoryBackend>) -> Self {
        Self {
            default_node: backend,
            nodes: HashMap::new(),
        }
    }

    /// Register a dedicated node for `url`
    pub fn with_node(mut self, url: impl Into<String>, node: Arc<InMemoryBackend>) -> Self {
        self.nodes.insert(url.into(), node);
        self
    }

    /// The node used for unregistered URLs
    pub fn backend(&self) -> Arc<InMemoryBackend> {
        Arc::clone(&self.default_node)
    }
}

#[async_trait]
impl BackendConnector for MemoryConnector {
    async fn connect(&self, url: &str, _timeout: Duration) -> BackendResult<SharedClient> {
        let node = self.nodes.get(url).unwrap_or(&self.default_node);
        if !node.is_available() {
            return Err(BackendFailure::unavailable("connection refused"));
        }
        Ok(Arc::clone(node) as SharedClient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_list_is_fifo_with_lpush_rpop() {
        let backend = InMemoryBackend::new();
        assert_eq!(assert_ok!(backend.lpush("q", "a").await), 1);
        assert_eq!(assert_ok!(backend.lpush("q", "b").await), 2);
        assert_eq!(assert_ok!(backend.llen("q").await), 2);

        assert_eq!(assert_ok!(backend.rpop("q").await), Some("a".to_string()));
        assert_eq!(assert_ok!(backend.rpop("q").await), Some("b".to_string()));
        assert_eq!(assert_ok!(backend.rpop("q").await), None);
        assert_eq!(assert_ok!(backend.llen("q").await), 0);
    }

    #[tokio::test]
    async fn test_setex_expires() {
        let backend = InMemoryBackend::new();
        backend.setex("k", 1, "v").await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), Some("v".to_string()));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(backend.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sorted_set_window() {
        let backend = InMemoryBackend::new();
        for (member, score) in [("a", 1.0), ("b", 2.0), ("c", 3.0)] {
            backend.zadd("z", member, score).await.unwrap();
        }
        assert_eq!(backend.zcount("z", 2.0, f64::INFINITY).await.unwrap(), 2);
        assert_eq!(backend.zremrangebyscore("z", 0.0, 1.5).await.unwrap(), 1);
        assert_eq!(backend.zcount("z", f64::NEG_INFINITY, f64::INFINITY).await.unwrap(), 2);
        assert!(backend.expire("z", 60).await.unwrap());
        assert!(!backend.expire("missing", 60).await.unwrap());
    }

    #[tokio::test]
    async fn test_outage_switch() {
        let backend = InMemoryBackend::new();
        backend.set_available(false);
        let err = assert_err!(backend.ping().await);
        assert!(matches!(err, BackendFailure::Unavailable { .. }));

        backend.set_available(true);
        assert_ok!(backend.ping().await);
    }

    #[tokio::test]
    async fn test_wrong_type_is_protocol_error() {
        let backend = InMemoryBackend::new();
        backend.lpush("list", "x").await.unwrap();
        assert!(matches!(
            backend.get("list").await,
            Err(BackendFailure::Protocol { .. })
        ));
    }

    #[tokio::test]
    async fn test_connector_routes_nodes() {
        let replica = Arc::new(InMemoryBackend::new());
        let connector = MemoryConnector::new().with_node("memory://replica", replica.clone());

        replica.set_available(false);
        assert!(connector.connect("memory://replica", Duration::from_millis(10)).await.is_err());
        assert!(connector.connect("memory://primary", Duration::from_millis(10)).await.is_ok());
    }
}
