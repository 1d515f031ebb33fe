//! Requeue delays requested during a sync pass.
//!
//! Sub-steps of a reconcile push the delay they want; the reconcile pops the
//! merged value at the end and turns it into its requeue action.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

/// How a push combines with a delay already stored for the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergePolicy {
    /// Keep the larger delay.
    #[default]
    Greater,
    /// Keep the smaller delay.
    Lesser,
    /// Keep the most recent delay.
    Overwrite,
}

/// Concurrent map of request key to requested requeue delay.
#[derive(Debug, Default)]
pub struct DurationStore {
    policy: MergePolicy,
    durations: Mutex<HashMap<String, Duration>>,
}

impl DurationStore {
    /// Create a store with the given merge policy.
    pub fn new(policy: MergePolicy) -> Self {
        Self {
            policy,
            durations: Mutex::new(HashMap::new()),
        }
    }

    /// Merge policy of this store.
    pub fn policy(&self) -> MergePolicy {
        self.policy
    }

    /// Record a requested delay. Zero delays are ignored.
    pub fn push(&self, key: &str, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        let mut durations = self.durations.lock();
        let merged = match (durations.get(key), self.policy) {
            (None, _) | (Some(_), MergePolicy::Overwrite) => delay,
            (Some(current), MergePolicy::Greater) => (*current).max(delay),
            (Some(current), MergePolicy::Lesser) => (*current).min(delay),
        };
        durations.insert(key.to_string(), merged);
    }

    /// Stored delay, or zero.
    pub fn peek(&self, key: &str) -> Duration {
        self.durations
            .lock()
            .get(key)
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    /// Take the stored delay, leaving zero behind.
    pub fn pop(&self, key: &str) -> Duration {
        self.durations
            .lock()
            .remove(key)
            .unwrap_or(Duration::ZERO)
    }
}
