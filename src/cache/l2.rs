//! L2 Cache - Distributed Shared Cache
//!
//! The second tier lives outside the process and is reached through the
//! [`DistributedStore`] port. Any store offering get/set-with-TTL/delete and a
//! prefix scan can back it; [`RedisStore`](super::redis::RedisStore) is the
//! production adapter and [`InMemoryStore`] serves tests and single-node use.
//!
//! # Design
//!
//! - No in-process lock is held across a store round trip
//! - A local index of keys written through this process (ordered, so a prefix
//!   is a range scan) complements the store's own scan during invalidation
//! - Errors are counted and returned; the manager decides how to degrade

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::entry::{CacheEntry, KeyPattern};
use crate::error::{Error, Result};

/// L2 Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct L2Config {
    /// Store host
    pub host: String,
    /// Store port
    pub port: u16,
    /// Optional username
    pub username: Option<String>,
    /// Optional password
    pub password: Option<String>,
    /// Logical database index
    pub db: i64,
    /// Default time-to-live in milliseconds
    pub default_ttl_ms: u64,
    /// Namespace prepended to every key in the store
    pub key_prefix: String,
    /// Connection and per-command timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for L2Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            username: None,
            password: None,
            db: 0,
            default_ttl_ms: super::DEFAULT_L2_TTL_MS,
            key_prefix: "optlayer:".to_string(),
            connect_timeout_ms: 5_000,
        }
    }
}

impl L2Config {
    /// Default TTL as a duration
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    /// Timeout applied to connects and commands
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Connection URL with percent-encoded credentials
    pub fn connection_url(&self) -> String {
        let auth = match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!(
                "{}:{}@",
                urlencoding::encode(user),
                urlencoding::encode(pass)
            ),
            (None, Some(pass)) => format!(":{}@", urlencoding::encode(pass)),
            (Some(user), None) => format!("{}@", urlencoding::encode(user)),
            (None, None) => String::new(),
        };
        format!("redis://{}{}:{}/{}", auth, self.host, self.port, self.db)
    }

    /// Reject structurally invalid settings
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Config("l2.host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(Error::Config("l2.port must be greater than 0".into()));
        }
        if self.db < 0 {
            return Err(Error::Config("l2.db must not be negative".into()));
        }
        if self.default_ttl_ms == 0 {
            return Err(Error::Config(
                "l2.default_ttl_ms must be greater than 0".into(),
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(Error::Config(
                "l2.connect_timeout_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Contract the distributed tier must satisfy
#[async_trait]
pub trait DistributedStore: Send + Sync {
    /// Get a value
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Get a value with its remaining time-to-live
    ///
    /// The TTL is `None` when the store does not report one.
    async fn get_with_ttl(&self, key: &str) -> Result<Option<(Bytes, Option<Duration>)>> {
        Ok(self.get(key).await?.map(|value| (value, None)))
    }

    /// Store a value with a time-to-live
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()>;

    /// Delete a value, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// List keys starting with a prefix
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Liveness probe
    async fn ping(&self) -> Result<()>;

    /// Release the connection
    async fn close(&self) -> Result<()>;

    /// Remove expired values, for stores without native expiry
    async fn purge_expired(&self) -> Result<usize> {
        Ok(0)
    }

    /// Backend identifier for reports
    fn backend_type(&self) -> &'static str;
}

// =============================================================================
// In-Memory Store
// =============================================================================

/// In-memory distributed store for tests and single-node deployments
///
/// Uses DashMap for sharded concurrent access. Availability can be toggled to
/// simulate an outage of the remote tier.
#[derive(Default)]
pub struct InMemoryStore {
    entries: DashMap<String, CacheEntry>,
    unavailable: AtomicBool,
    closed: AtomicBool,
}

impl InMemoryStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store going down (`false`) or coming back (`true`)
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Number of stored values, expired or not
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::l2_unavailable("store closed"));
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::l2_unavailable("store unreachable"));
        }
        Ok(())
    }
}

#[async_trait]
impl DistributedStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.get_with_ttl(key).await?.map(|(value, _)| value))
    }

    async fn get_with_ttl(&self, key: &str) -> Result<Option<(Bytes, Option<Duration>)>> {
        self.check()?;
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired() => {
                return Ok(Some((entry.value().value().clone(), Some(entry.remaining_ttl()))))
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        self.check()?;
        self.entries
            .insert(key.to_string(), CacheEntry::new(value, ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check()?;
        Ok(self.entries.remove(key).is_some())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.check()?;
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && !e.value().is_expired())
            .map(|e| e.key().clone())
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.entries.clear();
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize> {
        self.check()?;
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        Ok(before.saturating_sub(self.entries.len()))
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

// =============================================================================
// L2 Cache
// =============================================================================

/// L2 Cache - distributed tier wrapper with hit/miss accounting
pub struct L2Cache {
    store: Arc<dyn DistributedStore>,
    config: L2Config,
    /// key -> expiry of keys written through this process
    index: Mutex<BTreeMap<String, Instant>>,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    errors: AtomicU64,
}

impl L2Cache {
    /// Wrap a store
    pub fn new(store: Arc<dyn DistributedStore>, config: L2Config) -> Self {
        Self {
            store,
            config,
            index: Mutex::new(BTreeMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Get a value from the store
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.get_with_ttl(key).await?.map(|(value, _)| value))
    }

    /// Get a value and how long it has left to live
    ///
    /// Stores that report no TTL fall back to the expiry this process
    /// recorded on write, then to the default TTL.
    pub async fn get_with_ttl(&self, key: &str) -> Result<Option<(Bytes, Duration)>> {
        match self.store.get_with_ttl(key).await {
            Ok(Some((value, ttl))) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                let remaining = ttl
                    .or_else(|| {
                        self.index
                            .lock()
                            .get(key)
                            .map(|expires| expires.saturating_duration_since(Instant::now()))
                    })
                    .unwrap_or_else(|| self.default_ttl());
                Ok(Some((value, remaining)))
            }
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.index.lock().remove(key);
                Ok(None)
            }
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Store a value and record it in the prefix index
    pub async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        match self.store.set(key, value, ttl).await {
            Ok(()) => {
                self.writes.fetch_add(1, Ordering::Relaxed);
                self.index
                    .lock()
                    .insert(key.to_string(), Instant::now() + ttl);
                Ok(())
            }
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Remove every key matching a pattern
    pub async fn remove_matching(&self, pattern: &KeyPattern) -> Result<usize> {
        let candidates = match pattern {
            KeyPattern::Exact(key) => vec![key.clone()],
            KeyPattern::Prefix(prefix) => {
                let mut keys = self.indexed_with_prefix(prefix);
                match self.store.scan_prefix(prefix).await {
                    Ok(scanned) => keys.extend(scanned),
                    Err(e) => {
                        self.errors.fetch_add(1, Ordering::Relaxed);
                        return Err(e);
                    }
                }
                keys.sort();
                keys.dedup();
                keys
            }
        };

        let mut removed = 0;
        for key in candidates {
            match self.store.delete(&key).await {
                Ok(existed) => {
                    if existed {
                        removed += 1;
                    }
                    self.index.lock().remove(&key);
                }
                Err(e) => {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            }
        }
        Ok(removed)
    }

    fn indexed_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.index
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Drop index records past their TTL and let the store purge its own
    pub async fn sweep(&self) -> Result<usize> {
        let now = Instant::now();
        let pruned = {
            let mut index = self.index.lock();
            let before = index.len();
            index.retain(|_, expires| *expires > now);
            before - index.len()
        };

        let purged = self.store.purge_expired().await.inspect_err(|_| {
            self.errors.fetch_add(1, Ordering::Relaxed);
        })?;
        Ok(pruned.max(purged))
    }

    /// Liveness probe
    pub async fn ping(&self) -> Result<()> {
        self.store.ping().await
    }

    /// Close the underlying connection
    pub async fn close(&self) -> Result<()> {
        self.index.lock().clear();
        self.store.close().await
    }

    /// Number of live keys this process wrote
    pub fn tracked_entries(&self) -> usize {
        let now = Instant::now();
        self.index.lock().values().filter(|e| **e > now).count()
    }

    /// Default TTL for writes without an explicit TTL
    pub fn default_ttl(&self) -> Duration {
        self.config.default_ttl()
    }

    /// Backend identifier
    pub fn backend_type(&self) -> &'static str {
        self.store.backend_type()
    }

    /// Get hit count
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Get miss count
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Get write count
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Get error count
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Get hit ratio
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
