//! Cache Entry Types
//!
//! Values stored in each tier, the tier identifiers, and invalidation patterns.

use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Cache level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheLevel {
    /// L1 - in-process (fastest, smallest)
    L1,
    /// L2 - distributed (shared across processes)
    L2,
}

impl CacheLevel {
    /// Both levels, fastest first
    pub fn all() -> Vec<CacheLevel> {
        vec![CacheLevel::L1, CacheLevel::L2]
    }
}

impl std::fmt::Display for CacheLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheLevel::L1 => write!(f, "L1 (in-process)"),
            CacheLevel::L2 => write!(f, "L2 (distributed)"),
        }
    }
}

/// A value held by exactly one tier
///
/// Promotion from L2 to L1 builds a new entry; entries are never shared
/// between tiers. `Bytes` clones are reference-counted, but the bytes are
/// immutable so a copy and a shared view are indistinguishable.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    value: Bytes,
    stored_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    /// Create a new entry stored now
    pub fn new(value: Bytes, ttl: Duration) -> Self {
        Self {
            value,
            stored_at: Instant::now(),
            ttl,
        }
    }

    /// Get the stored value
    #[inline]
    pub fn value(&self) -> &Bytes {
        &self.value
    }

    /// Consume the entry and return its value
    pub fn into_value(self) -> Bytes {
        self.value
    }

    /// Size of the value in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.value.len()
    }

    /// When the entry was stored
    pub fn stored_at(&self) -> Instant {
        self.stored_at
    }

    /// Time-to-live
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Instant after which the entry is expired
    pub fn expires_at(&self) -> Instant {
        self.stored_at + self.ttl
    }

    /// Check if entry has expired
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    /// Check expiry against a given instant
    #[inline]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at()
    }

    /// Remaining lifetime, zero when expired
    pub fn remaining_ttl(&self) -> Duration {
        self.expires_at().saturating_duration_since(Instant::now())
    }
}

/// Invalidation pattern: an exact key or a trailing-wildcard prefix (`user:*`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPattern {
    /// Matches one key
    Exact(String),
    /// Matches every key starting with the prefix
    Prefix(String),
}

impl KeyPattern {
    /// Parse a pattern. Only a single trailing `*` is a wildcard.
    pub fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix('*') {
            Some(prefix) => KeyPattern::Prefix(prefix.to_string()),
            None => KeyPattern::Exact(pattern.to_string()),
        }
    }

    /// Check whether a key matches
    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyPattern::Exact(exact) => key == exact,
            KeyPattern::Prefix(prefix) => key.starts_with(prefix.as_str()),
        }
    }
}

impl std::fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyPattern::Exact(key) => write!(f, "{}", key),
            KeyPattern::Prefix(prefix) => write!(f, "{}*", prefix),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
