//! Per-key exponential backoff with periodic garbage collection.

use std::collections::HashMap;
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy)]
struct Entry {
    backoff: Duration,
    last_update: Instant,
}

/// Exponential backoff tracker keyed by string id.
///
/// Each `next` doubles the delay up to `max`. Entries untouched for twice
/// `max` are considered expired and are dropped by [`Backoff::gc`].
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    entries: Mutex<HashMap<String, Entry>>,
    gc_started: Once,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(15 * 60))
    }
}

impl Backoff {
    /// Create a tracker.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            entries: Mutex::new(HashMap::new()),
            gc_started: Once::new(),
        }
    }

    fn expired(&self, entry: &Entry, now: Instant) -> bool {
        now.saturating_duration_since(entry.last_update) > self.max * 2
    }

    /// Current delay for `id`, zero when untracked.
    pub fn get(&self, id: &str) -> Duration {
        self.entries
            .lock()
            .get(id)
            .map(|e| e.backoff)
            .unwrap_or(Duration::ZERO)
    }

    /// Advance the backoff for `id` and return the new delay.
    pub fn next(&self, id: &str, now: Instant) -> Duration {
        let mut entries = self.entries.lock();
        let backoff = match entries.get(id) {
            Some(entry) if !self.expired(entry, now) => (entry.backoff * 2).min(self.max),
            _ => self.initial,
        };
        entries.insert(
            id.to_string(),
            Entry {
                backoff,
                last_update: now,
            },
        );
        backoff
    }

    /// Whether `id` is still backing off relative to `event_time`.
    pub fn is_in_backoff_since(&self, id: &str, event_time: Instant, now: Instant) -> bool {
        let entries = self.entries.lock();
        match entries.get(id) {
            Some(entry) if !self.expired(entry, now) => {
                now.saturating_duration_since(event_time) < entry.backoff
            }
            _ => false,
        }
    }

    /// Whether `id` is still backing off since its last `next`.
    pub fn is_in_backoff_since_update(&self, id: &str, now: Instant) -> bool {
        let last_update = match self.entries.lock().get(id) {
            Some(entry) => entry.last_update,
            None => return false,
        };
        self.is_in_backoff_since(id, last_update, now)
    }

    /// Forget `id`.
    pub fn reset(&self, id: &str) {
        self.entries.lock().remove(id);
    }

    /// Forget every id matching `pred`.
    pub fn reset_where(&self, pred: impl Fn(&str) -> bool) {
        self.entries.lock().retain(|id, _| !pred(id));
    }

    /// Drop expired entries.
    pub fn gc(&self, now: Instant) {
        self.entries
            .lock()
            .retain(|_, entry| !self.expired(entry, now));
    }

    /// Number of tracked ids.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no id is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Run [`Backoff::gc`] every `interval` until `shutdown` flips to true.
    ///
    /// Only the first call per tracker spawns the task.
    pub fn start_gc(self: &Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let backoff = Arc::clone(self);
        self.gc_started.call_once(move || {
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => backoff.gc(Instant::now()),
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
                tracing::debug!("Backoff GC stopped");
            });
        });
    }
}
