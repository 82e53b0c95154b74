//! Concurrent-connection accounting per source key (DoS protection)
//!
//! Tracks how many connections are currently open per source key (client
//! IP or a configured source-identity header) plus a global total, and
//! answers whether a key is within its configured ceilings. Counters are
//! updated per key through the map's entry API so concurrent add/subtract
//! for the same key never lose updates.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::error;

/// Connection ceilings. Either axis may be absent, meaning unlimited.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrackerLimits {
    /// Maximum concurrent connections per source key
    pub per_key: Option<u64>,
    /// Maximum concurrent connections across all keys
    pub global: Option<u64>,
}

/// In-memory connection counters keyed by source identity.
///
/// A key with no entry has a count of zero; entries are removed when
/// their count returns to zero.
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    counts: DashMap<String, u64>,
    total: AtomicU64,
    limits: TrackerLimits,
}

impl ConnectionTracker {
    pub fn new(limits: TrackerLimits) -> Self {
        Self {
            counts: DashMap::new(),
            total: AtomicU64::new(0),
            limits,
        }
    }

    /// Charge one connection to `key`.
    ///
    /// Returns a guard that releases the charge exactly once when
    /// dropped, on every exit path.
    pub fn add(self: &Arc<Self>, key: &str) -> TrackerGuard {
        *self.counts.entry(key.to_string()).or_insert(0) += 1;
        self.total.fetch_add(1, Ordering::SeqCst);
        TrackerGuard {
            tracker: Arc::clone(self),
            key: key.to_string(),
        }
    }

    /// True iff `key` is within the per-key limit and the global total is
    /// within the global limit. The connection being verified counts
    /// toward both checks (callers charge first, then verify).
    pub fn verify(&self, key: &str) -> bool {
        if let Some(limit) = self.limits.per_key {
            if self.count(key) > limit {
                return false;
            }
        }
        if let Some(limit) = self.limits.global {
            if self.total.load(Ordering::SeqCst) > limit {
                return false;
            }
        }
        true
    }

    /// Current count for `key` (zero when untracked).
    pub fn count(&self, key: &str) -> u64 {
        self.counts.get(key).map(|c| *c).unwrap_or(0)
    }

    /// Current total across all keys.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    /// Release one connection charged to `key`.
    ///
    /// Called from guard drop only. An attempted decrement below zero
    /// means an unbalanced add/subtract pair somewhere and is surfaced
    /// rather than clamped, since clamping would mask the leak.
    fn subtract(&self, key: &str) {
        match self.counts.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if *entry.get() <= 1 {
                    entry.remove();
                } else {
                    *entry.get_mut() -= 1;
                }
            }
            Entry::Vacant(_) => {
                error!(key, "connection count underflow: subtract without matching add");
                debug_assert!(false, "connection count underflow for key {key}");
                return;
            }
        }

        if self
            .total
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| t.checked_sub(1))
            .is_err()
        {
            error!("global connection total underflow");
            debug_assert!(false, "global connection total underflow");
        }
    }
}

/// RAII charge against the tracker; releases on drop.
#[derive(Debug)]
pub struct TrackerGuard {
    tracker: Arc<ConnectionTracker>,
    key: String,
}

impl Drop for TrackerGuard {
    fn drop(&mut self) {
        self.tracker.subtract(&self.key);
    }
}
