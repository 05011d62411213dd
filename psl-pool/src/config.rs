//! Pool configuration and the shared capacity target.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use psl_common::CONNECTION_CACHE_LIMIT;
use serde::Deserialize;

/// Static pool settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Name used in diagnostics, e.g. "metadata" or "storage".
    pub type_name: String,
    /// Initial size of the endpoint table.
    pub table_size: usize,
    /// Number of idle connections kept after a release.
    pub capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            type_name: "connection".to_string(),
            table_size: 64,
            capacity: 16,
        }
    }
}

/// Idle-connection target that can be shared and changed at runtime.
///
/// Clones observe the same value, so one handle can be kept by whoever tunes
/// the pool while the pool reads it on every release.
#[derive(Debug, Clone, Default)]
pub struct CacheCapacity(Arc<AtomicUsize>);

impl CacheCapacity {
    /// Creates a target starting at `capacity` idle connections.
    pub fn new(capacity: usize) -> Self {
        CacheCapacity(Arc::new(AtomicUsize::new(capacity)))
    }

    /// Current target.
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    /// Replaces the target; it applies at the next release or collect.
    pub fn set(&self, capacity: usize) {
        self.0.store(capacity, Ordering::Release);
    }

    /// Adds `delta` to the target and returns the delta actually applied.
    ///
    /// Growth is refused once the target exceeds `CONNECTION_CACHE_LIMIT`;
    /// shrinking saturates at zero.
    pub fn change(&self, delta: isize) -> isize {
        let mut applied = 0;
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                applied = if delta > 0 && current > CONNECTION_CACHE_LIMIT {
                    0
                } else if delta < 0 {
                    -(current.min(delta.unsigned_abs()) as isize)
                } else {
                    delta
                };
                Some(current.wrapping_add_signed(applied))
            });
        applied
    }
}
