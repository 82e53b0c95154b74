//! Backend registry with per-backend active-connection gauges
//!
//! Holds the configured upstream servers alongside an atomic gauge of
//! in-flight requests per backend. Selection picks the least-loaded
//! backend and acquires a slot in one step; the returned guard keeps the
//! gauge accurate for the lifetime of the proxied exchange.

use crate::balancer::pick_least_loaded;
use crate::config::ServerSettings;
use anyhow::{bail, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Debug)]
pub struct BackendRegistry {
    endpoints: Vec<ServerSettings>,
    loads: Vec<AtomicU64>,
}

impl BackendRegistry {
    pub fn new(endpoints: Vec<ServerSettings>) -> Result<Self> {
        if endpoints.is_empty() {
            bail!("no backend servers configured");
        }
        let loads = endpoints.iter().map(|_| AtomicU64::new(0)).collect();
        Ok(Self { endpoints, loads })
    }

    pub fn endpoints(&self) -> &[ServerSettings] {
        &self.endpoints
    }

    /// Point-in-time copy of every backend's active-connection count.
    pub fn snapshot(&self) -> Vec<u64> {
        self.loads.iter().map(|l| l.load(Ordering::SeqCst)).collect()
    }

    /// Pick the backend with the fewest active connections and acquire a
    /// slot on it. `None` when the chosen backend is at its configured
    /// connection limit (the proxy has no spillover; the caller answers
    /// with a saturation error).
    pub fn select(self: &Arc<Self>) -> Option<BackendGuard> {
        let loads = self.snapshot();
        let index = pick_least_loaded(&loads)?;
        self.acquire(index)
    }

    /// Increment the gauge for `index` unless the backend's limit is
    /// already reached. CAS loop so a burst of concurrent acquires
    /// cannot overshoot the limit.
    fn acquire(self: &Arc<Self>, index: usize) -> Option<BackendGuard> {
        let limit = self.endpoints[index].connections_limit;
        let gauge = &self.loads[index];
        let mut current = gauge.load(Ordering::SeqCst);
        loop {
            if let Some(limit) = limit {
                if current >= limit {
                    debug!(
                        backend = %self.endpoints[index].host,
                        limit,
                        "backend at connection limit"
                    );
                    return None;
                }
            }
            match gauge.compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    return Some(BackendGuard {
                        registry: Arc::clone(self),
                        index,
                    })
                }
                Err(observed) => current = observed,
            }
        }
    }

    fn release(&self, index: usize) {
        if self.loads[index]
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |l| l.checked_sub(1))
            .is_err()
        {
            error!(
                backend = %self.endpoints[index].host,
                "backend load gauge underflow"
            );
            debug_assert!(false, "backend load gauge underflow");
        }
    }
}

/// One acquired slot on a backend; releases the gauge on drop.
#[derive(Debug)]
pub struct BackendGuard {
    registry: Arc<BackendRegistry>,
    index: usize,
}

impl BackendGuard {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn host(&self) -> &str {
        &self.registry.endpoints[self.index].host
    }
}

impl Drop for BackendGuard {
    fn drop(&mut self) {
        self.registry.release(self.index);
    }
}
