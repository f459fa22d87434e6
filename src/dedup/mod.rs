//! Request Deduplication
//!
//! Collapses concurrent requests for the same key into one execution whose
//! outcome every caller receives. The request runs on its own task, so a
//! caller that stops waiting never cancels the work for the others.
//!
//! ## Lifecycle
//! 1. First caller for a key registers a shared future and spawns the request
//! 2. Later callers clone the shared future
//! 3. When the request settles the key is removed, then the outcome is fanned out
//! 4. The next caller for that key starts a fresh execution

pub mod batch;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, trace};

pub use batch::{BatchCoordinator, BatchTicket, BatchWindow};

use crate::error::{Error, Result};

type SharedResult<T> = Shared<BoxFuture<'static, Result<T>>>;

/// Deduplicator configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DedupConfig {
    /// How long a batch window collects callers
    pub batch_window_ms: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self { batch_window_ms: 10 }
    }
}

impl DedupConfig {
    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_window_ms == 0 {
            return Err(Error::Config(
                "deduplication.batch_window_ms must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Per-call options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupOptions {
    pub enable_batching: bool,
    pub batch_key: Option<String>,
}

impl DedupOptions {
    /// Join the batch window named `batch_key` before executing
    pub fn batched(batch_key: impl Into<String>) -> Self {
        Self {
            enable_batching: true,
            batch_key: Some(batch_key.into()),
        }
    }

    fn batch_key(&self) -> Option<&str> {
        if self.enable_batching {
            self.batch_key.as_deref()
        } else {
            None
        }
    }
}

/// Deduplicator statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DedupStats {
    pub pending_requests: usize,
    pub active_batches: usize,
    pub memory_estimate_bytes: usize,
    /// Requests actually executed
    pub executions: u64,
    /// Callers that joined an in-flight request
    pub deduplicated: u64,
    pub batches_executed: u64,
    /// Age of the oldest in-flight request
    pub oldest_pending_ms: u64,
}

impl DedupStats {
    /// Fraction of callers served by another caller's execution
    pub fn dedup_ratio(&self) -> f64 {
        let total = self.executions + self.deduplicated;
        if total == 0 {
            0.0
        } else {
            self.deduplicated as f64 / total as f64
        }
    }
}

struct PendingRequest<T: Clone> {
    id: u64,
    future: SharedResult<T>,
    created_at: Instant,
}

/// Removes a settled (or panicked) request from the pending map
struct SettleGuard<T: Clone> {
    pending: Arc<DashMap<String, PendingRequest<T>>>,
    key: String,
    id: u64,
}

impl<T: Clone> Drop for SettleGuard<T> {
    fn drop(&mut self) {
        self.pending.remove_if(&self.key, |_, p| p.id == self.id);
    }
}

/// Single-flight coordinator for keyed async requests
pub struct RequestDeduplicator<T: Clone = Bytes> {
    pending: Arc<DashMap<String, PendingRequest<T>>>,
    batches: BatchCoordinator,
    next_id: AtomicU64,
    executions: AtomicU64,
    deduplicated: AtomicU64,
}

impl<T> RequestDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(config: &DedupConfig) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            batches: BatchCoordinator::new(config.batch_window()),
            next_id: AtomicU64::new(1),
            executions: AtomicU64::new(0),
            deduplicated: AtomicU64::new(0),
        }
    }

    /// Run `request_fn` for `key` unless a request for it is already in flight,
    /// in which case wait for that one instead
    pub async fn deduplicate<F, Fut>(
        &self,
        key: &str,
        request_fn: F,
        options: DedupOptions,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if let Some(batch_key) = options.batch_key() {
            let ticket = self.batches.join(batch_key, key).await;
            trace!(key, batch_key, members = ticket.members, "Released from batch");
        }

        let (future, started) = match self.pending.entry(key.to_string()) {
            Entry::Occupied(e) => {
                self.deduplicated.fetch_add(1, Ordering::Relaxed);
                debug!(key, "Joining in-flight request");
                (e.get().future.clone(), None)
            }
            Entry::Vacant(v) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel::<Result<T>>();
                let future = async move {
                    rx.await.unwrap_or_else(|_| {
                        Err(Error::Internal("request ended without a result".into()))
                    })
                }
                .boxed()
                .shared();
                v.insert(PendingRequest {
                    id,
                    future: future.clone(),
                    created_at: Instant::now(),
                });
                (future, Some((id, tx)))
            }
        };

        if let Some((id, tx)) = started {
            self.executions.fetch_add(1, Ordering::Relaxed);
            let guard = SettleGuard {
                pending: Arc::clone(&self.pending),
                key: key.to_string(),
                id,
            };
            tokio::spawn(async move {
                let result = request_fn().await;
                drop(guard);
                let _ = tx.send(result);
            });
        }

        future.await
    }

    /// Whether a request for `key` is in flight
    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }

    pub fn get_stats(&self) -> DedupStats {
        let now = Instant::now();
        let mut memory = self.batches.footprint();
        let mut oldest = Duration::ZERO;
        for p in self.pending.iter() {
            memory += p.key().len() + std::mem::size_of::<PendingRequest<T>>();
            oldest = oldest.max(now.saturating_duration_since(p.created_at));
        }

        DedupStats {
            pending_requests: self.pending.len(),
            active_batches: self.batches.active(),
            memory_estimate_bytes: memory,
            executions: self.executions.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            batches_executed: self.batches.executed(),
            oldest_pending_ms: oldest.as_millis() as u64,
        }
    }

    /// Drop batch windows abandoned by every member
    pub fn prune(&self) -> usize {
        self.batches.prune()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn dedup() -> Arc<RequestDeduplicator<u32>> {
        Arc::new(RequestDeduplicator::new(&DedupConfig::default()))
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_execution() {
        let dedup = dedup();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let dedup = dedup.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                dedup
                    .deduplicate(
                        "user:1",
                        move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(30)).await;
                            Ok(7)
                        },
                        DedupOptions::default(),
                    )
                    .await
            }));
        }

        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = dedup.get_stats();
        assert_eq!(stats.pending_requests, 0);
        assert_eq!(stats.executions, 1);
        assert_eq!(stats.deduplicated, 4);
        assert!((stats.dedup_ratio() - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_failure_reaches_every_caller() {
        let dedup = dedup();
        let run = |dedup: Arc<RequestDeduplicator<u32>>| async move {
            dedup
                .deduplicate(
                    "k",
                    || async {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Err(Error::fetch("k", "backend down"))
                    },
                    DedupOptions::default(),
                )
                .await
        };

        let (a, b) = tokio::join!(run(dedup.clone()), run(dedup.clone()));
        assert_eq!(a, Err(Error::fetch("k", "backend down")));
        assert_eq!(a, b);
        assert!(!dedup.is_pending("k"));
    }

    #[tokio::test]
    async fn test_settled_key_starts_fresh() {
        let dedup = dedup();
        let first = dedup
            .deduplicate("k", || async { Ok(1) }, DedupOptions::default())
            .await;
        let second = dedup
            .deduplicate("k", || async { Ok(2) }, DedupOptions::default())
            .await;
        assert_eq!(first, Ok(1));
        assert_eq!(second, Ok(2));
        assert_eq!(dedup.get_stats().executions, 2);
    }

    #[tokio::test]
    async fn test_distinct_keys_run_independently() {
        let dedup = dedup();
        let (a, b) = tokio::join!(
            dedup.deduplicate("a", || async { Ok(1) }, DedupOptions::default()),
            dedup.deduplicate("b", || async { Ok(2) }, DedupOptions::default()),
        );
        assert_eq!((a, b), (Ok(1), Ok(2)));
        assert_eq!(dedup.get_stats().deduplicated, 0);
    }

    #[tokio::test]
    async fn test_abandoned_caller_does_not_cancel_request() {
        let dedup = dedup();
        let calls = Arc::new(AtomicUsize::new(0));

        let first = {
            let dedup = dedup.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                dedup
                    .deduplicate(
                        "k",
                        move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(40)).await;
                            Ok(9)
                        },
                        DedupOptions::default(),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        first.abort();

        let joined = dedup
            .deduplicate("k", || async { Ok(0) }, DedupOptions::default())
            .await;
        assert_eq!(joined, Ok(9));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_request_clears_pending_entry() {
        let dedup = dedup();
        let result = dedup
            .deduplicate(
                "k",
                || async {
                    if "k".len() == 1 {
                        panic!("request blew up");
                    }
                    Ok(0)
                },
                DedupOptions::default(),
            )
            .await;
        assert!(matches!(result, Err(Error::Internal(_))));
        assert!(!dedup.is_pending("k"));
    }

    #[tokio::test]
    async fn test_batched_callers_released_together() {
        let dedup = dedup();
        let (a, b) = tokio::join!(
            dedup.deduplicate("user:1", || async { Ok(1) }, DedupOptions::batched("users")),
            dedup.deduplicate("user:2", || async { Ok(2) }, DedupOptions::batched("users")),
        );
        assert_eq!((a, b), (Ok(1), Ok(2)));

        let stats = dedup.get_stats();
        assert_eq!(stats.batches_executed, 1);
        assert_eq!(stats.active_batches, 0);
    }

    #[test]
    fn test_batching_requires_flag() {
        let options = DedupOptions {
            enable_batching: false,
            batch_key: Some("users".into()),
        };
        assert_eq!(options.batch_key(), None);
        assert_eq!(DedupOptions::batched("users").batch_key(), Some("users"));
    }

    #[test]
    fn test_config_validation() {
        assert!(DedupConfig::default().validate().is_ok());
        assert!(DedupConfig { batch_window_ms: 0 }.validate().is_err());
    }
}
