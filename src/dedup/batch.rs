//! Batch Windows
//!
//! Callers sharing a batch key within a short collection window are released
//! together when the window closes. Each member still performs its own fetch;
//! the window is the one place a bulk fetch could later be issued for all
//! member keys at once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// A group of callers collected under one batch key
#[derive(Debug)]
pub struct BatchWindow {
    id: u64,
    batch_key: String,
    members: Mutex<Vec<String>>,
    deadline: Instant,
}

impl BatchWindow {
    fn new(id: u64, batch_key: &str, window: Duration) -> Self {
        Self {
            id,
            batch_key: batch_key.to_string(),
            members: Mutex::new(Vec::new()),
            deadline: Instant::now() + window,
        }
    }

    /// The key callers are grouped under
    pub fn batch_key(&self) -> &str {
        &self.batch_key
    }

    /// Request keys that joined this window
    pub fn members(&self) -> Vec<String> {
        self.members.lock().clone()
    }

    /// When the window releases its members
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    fn is_open(&self, now: Instant) -> bool {
        now < self.deadline
    }

    fn footprint(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.batch_key.len()
            + self.members.lock().iter().map(String::len).sum::<usize>()
    }
}

/// Outcome of waiting in a batch window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchTicket {
    /// Batch key of the window
    pub batch_key: String,
    /// Members in the window when this caller was released
    pub members: usize,
}

/// Owns the open batch windows
pub struct BatchCoordinator {
    windows: DashMap<String, Arc<BatchWindow>>,
    window: Duration,
    next_id: AtomicU64,
    executed: AtomicU64,
}

impl BatchCoordinator {
    /// Create a coordinator with the given collection window
    pub fn new(window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            window,
            next_id: AtomicU64::new(1),
            executed: AtomicU64::new(0),
        }
    }

    fn new_window(&self, batch_key: &str) -> Arc<BatchWindow> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Arc::new(BatchWindow::new(id, batch_key, self.window))
    }

    /// Join (or open) the window for `batch_key` and wait for it to close
    pub async fn join(&self, batch_key: &str, member_key: &str) -> BatchTicket {
        let now = Instant::now();
        let window = match self.windows.entry(batch_key.to_string()) {
            Entry::Occupied(mut e) => {
                // Every member abandoned a window before it closed
                if !e.get().is_open(now) {
                    e.insert(self.new_window(batch_key));
                }
                e.get().clone()
            }
            Entry::Vacant(v) => v.insert(self.new_window(batch_key)).clone(),
        };
        window.members.lock().push(member_key.to_string());

        tokio::time::sleep_until(window.deadline).await;
        self.close(&window);

        let members = window.members.lock().len();
        BatchTicket {
            batch_key: window.batch_key.clone(),
            members,
        }
    }

    /// Destroy a window once; later members find it already gone
    fn close(&self, window: &BatchWindow) {
        if self
            .windows
            .remove_if(&window.batch_key, |_, w| w.id == window.id)
            .is_some()
        {
            self.executed.fetch_add(1, Ordering::Relaxed);
            debug!(
                batch_key = %window.batch_key,
                members = window.members.lock().len(),
                "Batch window executed"
            );
        }
    }

    /// Windows still collecting members
    pub fn active(&self) -> usize {
        let now = Instant::now();
        self.windows.iter().filter(|w| w.is_open(now)).count()
    }

    /// Windows closed so far
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    /// Approximate bytes held by open windows
    pub fn footprint(&self) -> usize {
        self.windows
            .iter()
            .map(|w| w.key().len() + w.footprint())
            .sum()
    }

    /// Drop windows whose members all went away
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|_, w| w.is_open(now));
        before.saturating_sub(self.windows.len())
    }
}
