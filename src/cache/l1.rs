//! L1 Cache - In-Process Hot Cache
//!
//! Bounded key/value store living inside the process.
//!
//! # Design
//!
//! - Single `parking_lot::Mutex` over the map and its recency index, so an
//!   insert and the eviction it triggers are one atomic step
//! - Strict LRU: a monotonically increasing access tick per entry, ordered in
//!   a `BTreeMap` so the least recently used key is always the first one
//! - TTL checked lazily on read and in bulk by `purge_expired`

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::entry::{CacheEntry, KeyPattern};
use crate::error::{Error, Result};

/// L1 Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct L1Config {
    /// Maximum number of entries before LRU eviction
    pub max_size: usize,
    /// Default time-to-live in milliseconds
    pub ttl_ms: u64,
}

impl Default for L1Config {
    fn default() -> Self {
        Self {
            max_size: super::DEFAULT_L1_MAX_SIZE,
            ttl_ms: super::DEFAULT_L1_TTL_MS,
        }
    }
}

impl L1Config {
    /// Default TTL as a duration
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Reject structurally invalid settings
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::Config("l1.max_size must be greater than 0".into()));
        }
        if self.ttl_ms == 0 {
            return Err(Error::Config("l1.ttl_ms must be greater than 0".into()));
        }
        Ok(())
    }
}

struct Slot {
    entry: CacheEntry,
    tick: u64,
}

#[derive(Default)]
struct LruState {
    map: HashMap<String, Slot>,
    /// access tick -> key, oldest first
    order: BTreeMap<u64, String>,
    tick: u64,
}

impl LruState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let slot = self.map.remove(key)?;
        self.order.remove(&slot.tick);
        Some(slot.entry)
    }
}

/// L1 Cache - in-process LRU cache
pub struct L1Cache {
    state: Mutex<LruState>,
    config: L1Config,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl L1Cache {
    /// Create a new L1 cache with default configuration
    pub fn new() -> Self {
        Self::with_config(L1Config::default())
    }

    /// Create a new L1 cache with custom configuration
    pub fn with_config(config: L1Config) -> Self {
        Self {
            state: Mutex::new(LruState::default()),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Get a value, refreshing its recency
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let mut state = self.state.lock();

        let expired = match state.map.get(key) {
            Some(slot) => slot.entry.is_expired(),
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if expired {
            state.remove(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!(key, "L1 entry expired on read");
            return None;
        }

        let tick = state.next_tick();
        let slot = state.map.get_mut(key)?;
        let old_tick = std::mem::replace(&mut slot.tick, tick);
        let value = slot.entry.value().clone();
        state.order.remove(&old_tick);
        state.order.insert(tick, key.to_string());

        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(value)
    }

    /// Put an entry, evicting least recently used entries past `max_size`
    pub fn put(&self, key: impl Into<String>, entry: CacheEntry) -> bool {
        if self.config.max_size == 0 {
            return false;
        }

        let key = key.into();
        let mut state = self.state.lock();

        state.remove(&key);
        let tick = state.next_tick();
        state.order.insert(tick, key.clone());
        state.map.insert(key, Slot { entry, tick });
        self.writes.fetch_add(1, Ordering::Relaxed);

        while state.map.len() > self.config.max_size {
            let Some((_, victim)) = state.order.pop_first() else {
                break;
            };
            state.map.remove(&victim);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(key = %victim, "L1 evicted least recently used entry");
        }

        true
    }

    /// Remove an entry
    pub fn remove(&self, key: &str) -> bool {
        self.state.lock().remove(key).is_some()
    }

    /// Remove every entry matching a pattern, returning how many were removed
    pub fn remove_matching(&self, pattern: &KeyPattern) -> usize {
        let mut state = self.state.lock();
        let doomed: Vec<String> = state
            .map
            .keys()
            .filter(|k| pattern.matches(k))
            .cloned()
            .collect();

        for key in &doomed {
            state.remove(key);
        }
        doomed.len()
    }

    /// Get a live value without counting a hit or miss or refreshing recency
    pub fn peek(&self, key: &str) -> Option<Bytes> {
        self.state
            .lock()
            .map
            .get(key)
            .filter(|slot| !slot.entry.is_expired())
            .map(|slot| slot.entry.value().clone())
    }

    /// Check if a live entry exists (does not touch recency)
    pub fn contains(&self, key: &str) -> bool {
        self.state
            .lock()
            .map
            .get(key)
            .map(|slot| !slot.entry.is_expired())
            .unwrap_or(false)
    }

    /// Drop every expired entry
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        let expired: Vec<String> = state
            .map
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired_at(now))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            state.remove(key);
        }
        self.expirations
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    /// Get number of entries
    pub fn len(&self) -> usize {
        self.state.lock().map.len()
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of entries
    pub fn capacity(&self) -> usize {
        self.config.max_size
    }

    /// Default TTL for writes without an explicit TTL
    pub fn default_ttl(&self) -> Duration {
        self.config.default_ttl()
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

    /// Get eviction count
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Get expiration count
    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }

    /// Evictions per write
    pub fn eviction_rate(&self) -> f64 {
        let writes = self.writes();
        if writes == 0 {
            0.0
        } else {
            self.evictions() as f64 / writes as f64
        }
    }

    /// Clear the cache
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.map.clear();
        state.order.clear();
    }
}

impl Default for L1Cache {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(data: &[u8]) -> CacheEntry {
        CacheEntry::new(Bytes::copy_from_slice(data), Duration::from_secs(60))
    }

    fn small_cache(max_size: usize) -> L1Cache {
        L1Cache::with_config(L1Config {
            max_size,
            ..Default::default()
        })
    }

    #[test]
    fn test_l1_cache_creation() {
        let cache = L1Cache::new();
        assert!(cache.is_empty());
        assert_eq!(cache.capacity(), 1000);
        assert_eq!(cache.default_ttl(), Duration::from_secs(300));
    }

    #[test]
    fn test_l1_cache_put_get() {
        let cache = L1Cache::new();
        assert!(cache.put("user:1", entry(b"alice")));
        assert_eq!(cache.get("user:1").unwrap().as_ref(), b"alice");
        assert_eq!(cache.hits(), 1);
    }

    #[test]
    fn test_l1_cache_miss() {
        let cache = L1Cache::new();
        assert!(cache.get("nonexistent").is_none());
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.hits(), 0);
    }

    #[test]
    fn test_l1_peek_is_not_counted() {
        let cache = L1Cache::new();
        assert!(cache.peek("k").is_none());
        cache.put("k", entry(b"v"));
        assert_eq!(cache.peek("k").unwrap().as_ref(), b"v");
        assert_eq!(cache.hits(), 0);
        assert_eq!(cache.misses(), 0);
    }

    #[test]
    fn test_l1_cache_replace() {
        let cache = L1Cache::new();
        cache.put("k", entry(b"original"));
        cache.put("k", entry(b"replaced"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("k").unwrap().as_ref(), b"replaced");
    }

    #[test]
    fn test_l1_lru_eviction_order() {
        let cache = small_cache(3);
        cache.put("a", entry(b"1"));
        cache.put("b", entry(b"2"));
        cache.put("c", entry(b"3"));

        // Touch "a" so "b" becomes least recently used
        cache.get("a");
        cache.put("d", entry(b"4"));

        assert_eq!(cache.len(), 3);
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
        assert!(cache.contains("d"));
        assert_eq!(cache.evictions(), 1);
    }

    #[test]
    fn test_l1_overwrite_does_not_evict() {
        let cache = small_cache(2);
        cache.put("a", entry(b"1"));
        cache.put("b", entry(b"2"));
        cache.put("a", entry(b"3"));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.evictions(), 0);
    }

    #[test]
    fn test_l1_expired_entry_is_miss() {
        let cache = L1Cache::new();
        cache.put(
            "short",
            CacheEntry::new(Bytes::from_static(b"x"), Duration::from_millis(10)),
        );
        std::thread::sleep(Duration::from_millis(25));

        assert!(cache.get("short").is_none());
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.expirations(), 1);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn test_l1_purge_expired() {
        let cache = L1Cache::new();
        cache.put(
            "gone",
            CacheEntry::new(Bytes::from_static(b"x"), Duration::from_millis(5)),
        );
        cache.put("kept", entry(b"y"));
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains("kept"));
    }

    #[test]
    fn test_l1_remove_matching() {
        let cache = L1Cache::new();
        cache.put("user:1", entry(b"a"));
        cache.put("user:2", entry(b"b"));
        cache.put("trip:1", entry(b"c"));

        assert_eq!(cache.remove_matching(&KeyPattern::parse("user:*")), 2);
        assert!(!cache.contains("user:1"));
        assert!(cache.contains("trip:1"));
    }

    #[test]
    fn test_l1_eviction_rate() {
        let cache = small_cache(1);
        cache.put("a", entry(b"1"));
        cache.put("b", entry(b"2"));
        assert_eq!(cache.writes(), 2);
        assert!((cache.eviction_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_l1_config_validation() {
        assert!(L1Config::default().validate().is_ok());
        let zero = L1Config {
            max_size: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());
        let no_ttl = L1Config {
            ttl_ms: 0,
            ..Default::default()
        };
        assert!(no_ttl.validate().is_err());
    }

    #[test]
    fn test_l1_cache_concurrent_access() {
        use std::sync::Arc;
        use std::thread;

        let cache = Arc::new(small_cache(500));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in 0..200 {
                        let key = format!("obj-{}-{}", t, i);
                        cache.put(key.clone(), entry(&[i as u8; 8]));
                        cache.get(&key);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        // Bound is never exceeded and every overflow was counted once
        assert_eq!(cache.len(), 500);
        assert_eq!(cache.evictions(), 1600 - 500);
    }
}
