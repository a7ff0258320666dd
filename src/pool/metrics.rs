//! Pool counters and snapshots

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

/// Monotonic pool counters. Gauges (active borrows, idle connections) are
/// computed from live pool state at snapshot time instead of being tracked
/// here, so they can never drift.
#[derive(Default)]
pub struct PoolCounters {
    pub connections_created: AtomicU64,
    pub connections_destroyed: AtomicU64,
    pub reuse_count: AtomicU64,
    pub connect_failures: AtomicU64,
    per_key: DashMap<String, KeyCounters>,
}

#[derive(Default)]
struct KeyCounters {
    created: AtomicU64,
    reused: AtomicU64,
}

impl PoolCounters {
    pub fn record_created(&self, key: &str) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
        self.per_key
            .entry(key.to_string())
            .or_default()
            .created
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reused(&self, key: &str) {
        self.reuse_count.fetch_add(1, Ordering::Relaxed);
        self.per_key
            .entry(key.to_string())
            .or_default()
            .reused
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_destroyed(&self) {
        self.connections_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn per_key_snapshot(&self) -> HashMap<String, KeyMetrics> {
        self.per_key
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    KeyMetrics {
                        created: entry.created.load(Ordering::Relaxed),
                        reused: entry.reused.load(Ordering::Relaxed),
                        active_borrows: 0,
                    },
                )
            })
            .collect()
    }
}

/// Point-in-time view of the pool, serializable for observers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolMetrics {
    pub connections_created: u64,
    pub connections_destroyed: u64,
    pub active_borrows: usize,
    pub idle: usize,
    pub reuse_count: u64,
    pub connect_failures: u64,
    pub per_key: HashMap<String, KeyMetrics>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct KeyMetrics {
    pub created: u64,
    pub reused: u64,
    pub active_borrows: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let counters = PoolCounters::default();
        counters.record_created("ssh:a:22:root");
        counters.record_created("ssh:a:22:root");
        counters.record_reused("ssh:a:22:root");
        counters.record_destroyed();
        counters.record_connect_failure();

        assert_eq!(counters.connections_created.load(Ordering::Relaxed), 2);
        assert_eq!(counters.connections_destroyed.load(Ordering::Relaxed), 1);
        assert_eq!(counters.reuse_count.load(Ordering::Relaxed), 1);
        assert_eq!(counters.connect_failures.load(Ordering::Relaxed), 1);

        let per_key = counters.per_key_snapshot();
        assert_eq!(per_key["ssh:a:22:root"].created, 2);
        assert_eq!(per_key["ssh:a:22:root"].reused, 1);
    }
}
