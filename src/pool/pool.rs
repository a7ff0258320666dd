//! Keyed connection cache with bounded concurrency
//!
//! One live transport per key; borrows are reference-counted up to
//! `max_per_key`, waiters are woken FIFO, idle transports are evicted by a
//! janitor task, and a failed health check on borrow rebuilds the entry
//! transparently.

use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::{ConnectionFactory, PooledConnection};
use super::metrics::{PoolCounters, PoolMetrics};
use crate::core::Target;
use crate::error::ExecError;

/// Pool tuning knobs
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Concurrent borrows allowed per key
    pub max_per_key: usize,

    /// Live connections allowed across all keys
    pub max_total: usize,

    /// Idle connections older than this are closed by the janitor
    pub idle_ttl: Duration,

    /// How long `acquire` may wait for admission before `PoolExhausted`
    pub acquire_timeout: Option<Duration>,

    /// Rebuild attempts when a health check fails on borrow
    pub max_reconnect_attempts: u32,

    /// Base delay between rebuild attempts (doubled each retry)
    pub reconnect_delay: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_key: 10,
            max_total: 64,
            idle_ttl: Duration::from_secs(300),
            acquire_timeout: Some(Duration::from_secs(30)),
            max_reconnect_attempts: 3,
            reconnect_delay: Duration::from_millis(500),
        }
    }
}

struct Entry {
    conn: PooledConnection,
    borrows: usize,
    generation: u64,
    last_used: Instant,
}

struct Waiter {
    key: String,
    tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<String, Entry>,
    /// Keys with a connection attempt in flight, so concurrent acquires
    /// for the same key queue instead of dialing twice
    connecting: HashSet<String>,
    waiters: VecDeque<Waiter>,
    draining: bool,
    next_generation: u64,
}

pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    state: Mutex<PoolState>,
    counters: PoolCounters,
    janitor_started: AtomicBool,
    janitor_stop: CancellationToken,
}

enum Admission {
    Borrow {
        conn: PooledConnection,
        generation: u64,
    },
    Create,
    Wait(oneshot::Receiver<()>),
    Draining,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                factory,
                state: Mutex::new(PoolState::default()),
                counters: PoolCounters::default(),
                janitor_started: AtomicBool::new(false),
                janitor_stop: CancellationToken::new(),
            }),
        }
    }

    /// Borrow a connection for the target, dialing one if needed. Blocks up
    /// to `acquire_timeout` when the key or the pool is at capacity.
    pub async fn acquire(&self, target: &Target) -> Result<PoolGuard, ExecError> {
        self.ensure_janitor();

        let key = target.pool_key();
        let started = Instant::now();
        let deadline = self.inner.config.acquire_timeout.map(|t| started + t);

        loop {
            let admission = self.inner.admit(&key);
            match admission {
                Admission::Borrow { conn, generation } => {
                    if conn.health_check().await {
                        self.inner.counters.record_reused(&key);
                        return Ok(PoolGuard::new(self.inner.clone(), key, generation, conn));
                    }
                    debug!(key = %key, "health check failed on borrow, rebuilding");
                    self.inner.discard_entry(&key, generation);
                    tokio::spawn(conn.close());
                    return self.create_with_retries(&key, target).await;
                }
                Admission::Create => {
                    return self.create_with_retries(&key, target).await;
                }
                Admission::Draining => {
                    return Err(ExecError::Connect {
                        target: target.describe(),
                        message: "connection pool is draining".to_string(),
                    });
                }
                Admission::Wait(rx) => {
                    let woken = match deadline {
                        Some(d) => {
                            let remaining = d.saturating_duration_since(Instant::now());
                            if remaining.is_zero() {
                                false
                            } else {
                                tokio::time::timeout(remaining, rx).await.is_ok()
                            }
                        }
                        None => rx.await.is_ok(),
                    };
                    if !woken && deadline.is_some_and(|d| Instant::now() >= d) {
                        return Err(ExecError::PoolExhausted {
                            target: target.describe(),
                            waited: started.elapsed(),
                        });
                    }
                    // Woken (or the sender vanished): race for admission again.
                }
            }
        }
    }

    /// Refuse new acquires, wait up to `grace` for borrows to return, then
    /// close every connection.
    pub async fn drain(&self, grace: Duration) {
        {
            let mut st = self.inner.state.lock();
            st.draining = true;
            // Wake every waiter so they observe the drain and bail out.
            while let Some(w) = st.waiters.pop_front() {
                let _ = w.tx.send(());
            }
        }

        let deadline = Instant::now() + grace;
        loop {
            let outstanding: usize = {
                let st = self.inner.state.lock();
                st.entries.values().map(|e| e.borrows).sum()
            };
            if outstanding == 0 || Instant::now() >= deadline {
                if outstanding > 0 {
                    warn!(outstanding, "pool drain grace elapsed with active borrows");
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let entries: Vec<PooledConnection> = {
            let mut st = self.inner.state.lock();
            st.entries.drain().map(|(_, e)| e.conn).collect()
        };
        let count = entries.len();
        for conn in entries {
            self.inner.counters.record_destroyed();
            conn.close().await;
        }
        self.inner.janitor_stop.cancel();
        info!(closed = count, "connection pool drained");
    }

    /// Point-in-time metrics: counters plus gauges computed from live state.
    pub fn metrics(&self) -> PoolMetrics {
        let st = self.inner.state.lock();
        let mut per_key = self.inner.counters.per_key_snapshot();
        for (key, entry) in &st.entries {
            per_key.entry(key.clone()).or_default().active_borrows = entry.borrows;
        }
        PoolMetrics {
            connections_created: self
                .inner
                .counters
                .connections_created
                .load(Ordering::Relaxed),
            connections_destroyed: self
                .inner
                .counters
                .connections_destroyed
                .load(Ordering::Relaxed),
            active_borrows: st.entries.values().map(|e| e.borrows).sum(),
            idle: st.entries.values().filter(|e| e.borrows == 0).count(),
            reuse_count: self.inner.counters.reuse_count.load(Ordering::Relaxed),
            connect_failures: self.inner.counters.connect_failures.load(Ordering::Relaxed),
            per_key,
        }
    }

    async fn create_with_retries(
        &self,
        key: &str,
        target: &Target,
    ) -> Result<PoolGuard, ExecError> {
        let mut last_error: Option<ExecError> = None;

        for attempt in 0..=self.inner.config.max_reconnect_attempts {
            if attempt > 0 {
                let delay = calculate_backoff(self.inner.config.reconnect_delay, attempt);
                debug!(key = %key, attempt, ?delay, "retrying connection");
                tokio::time::sleep(delay).await;
            }

            match self.inner.factory.connect(target).await {
                Ok(conn) => {
                    let generation = {
                        let mut st = self.inner.state.lock();
                        st.connecting.remove(key);
                        st.next_generation += 1;
                        let generation = st.next_generation;
                        st.entries.insert(
                            key.to_string(),
                            Entry {
                                conn: conn.clone(),
                                borrows: 1,
                                generation,
                                last_used: Instant::now(),
                            },
                        );
                        self.inner.wake_next(&mut st);
                        generation
                    };
                    self.inner.counters.record_created(key);
                    debug!(key = %key, kind = conn.kind_name(), "connection established");
                    return Ok(PoolGuard::new(
                        self.inner.clone(),
                        key.to_string(),
                        generation,
                        conn,
                    ));
                }
                Err(e) => {
                    self.inner.counters.record_connect_failure();
                    if e.retryable() && attempt < self.inner.config.max_reconnect_attempts {
                        warn!(key = %key, attempt, error = %e, "connection attempt failed");
                        last_error = Some(e);
                        continue;
                    }
                    let mut st = self.inner.state.lock();
                    st.connecting.remove(key);
                    self.inner.wake_next(&mut st);
                    return Err(e);
                }
            }
        }

        let mut st = self.inner.state.lock();
        st.connecting.remove(key);
        self.inner.wake_next(&mut st);
        Err(last_error.unwrap_or_else(|| ExecError::Connect {
            target: target.describe(),
            message: "connection attempts exhausted".to_string(),
        }))
    }

    fn ensure_janitor(&self) {
        if self
            .inner
            .janitor_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let inner = self.inner.clone();
            let stop = inner.janitor_stop.clone();
            tokio::spawn(async move {
                let period = inner.config.idle_ttl.max(Duration::from_secs(1)) / 2;
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(period) => {}
                    }
                    let expired: Vec<PooledConnection> = {
                        let mut st = inner.state.lock();
                        let ttl = inner.config.idle_ttl;
                        let keys: Vec<String> = st
                            .entries
                            .iter()
                            .filter(|(_, e)| e.borrows == 0 && e.last_used.elapsed() > ttl)
                            .map(|(k, _)| k.clone())
                            .collect();
                        keys.into_iter()
                            .filter_map(|k| st.entries.remove(&k).map(|e| e.conn))
                            .collect()
                    };
                    for conn in expired {
                        inner.counters.record_destroyed();
                        debug!(kind = conn.kind_name(), "evicting idle connection");
                        conn.close().await;
                    }
                }
            });
        }
    }
}

impl Clone for ConnectionPool {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl PoolInner {
    fn admit(self: &Arc<Self>, key: &str) -> Admission {
        let mut st = self.state.lock();
        if st.draining {
            return Admission::Draining;
        }

        if let Some(entry) = st.entries.get_mut(key) {
            if entry.borrows < self.config.max_per_key {
                entry.borrows += 1;
                entry.last_used = Instant::now();
                return Admission::Borrow {
                    conn: entry.conn.clone(),
                    generation: entry.generation,
                };
            }
        } else if !st.connecting.contains(key) {
            let room = st.entries.len() + st.connecting.len() < self.config.max_total;
            if room || self.evict_one_idle(&mut st) {
                st.connecting.insert(key.to_string());
                return Admission::Create;
            }
        }

        let (tx, rx) = oneshot::channel();
        st.waiters.push_back(Waiter {
            key: key.to_string(),
            tx,
        });
        Admission::Wait(rx)
    }

    /// Drop the oldest idle entry to make room. Caller holds the lock.
    fn evict_one_idle(&self, st: &mut PoolState) -> bool {
        let victim = st
            .entries
            .iter()
            .filter(|(_, e)| e.borrows == 0)
            .min_by_key(|(_, e)| e.last_used)
            .map(|(k, _)| k.clone());
        match victim {
            Some(key) => {
                if let Some(entry) = st.entries.remove(&key) {
                    self.counters.record_destroyed();
                    tokio::spawn(entry.conn.close());
                }
                true
            }
            None => false,
        }
    }

    fn discard_entry(&self, key: &str, generation: u64) {
        let mut st = self.state.lock();
        let matches = st
            .entries
            .get(key)
            .map(|e| e.generation == generation)
            .unwrap_or(false);
        if matches {
            st.entries.remove(key);
            self.counters.record_destroyed();
        }
        st.connecting.insert(key.to_string());
    }

    fn release(&self, key: &str, generation: u64) {
        let mut st = self.state.lock();
        if let Some(entry) = st.entries.get_mut(key) {
            if entry.generation == generation {
                entry.borrows = entry.borrows.saturating_sub(1);
                entry.last_used = Instant::now();
            }
        }
        self.wake_next(&mut st);
    }

    /// Wake the first waiter whose admission can now succeed. FIFO among
    /// waiters for the same key.
    fn wake_next(&self, st: &mut PoolState) {
        let mut index = None;
        for (i, waiter) in st.waiters.iter().enumerate() {
            let admissible = match st.entries.get(&waiter.key) {
                Some(entry) => entry.borrows < self.config.max_per_key,
                None => {
                    !st.connecting.contains(&waiter.key)
                        && (st.entries.len() + st.connecting.len() < self.config.max_total
                            || st.entries.values().any(|e| e.borrows == 0))
                }
            };
            if admissible {
                index = Some(i);
                break;
            }
        }
        if let Some(i) = index {
            if let Some(waiter) = st.waiters.remove(i) {
                if waiter.tx.send(()).is_err() {
                    // Waiter timed out and dropped its receiver; try the next.
                    self.wake_next(st);
                }
            }
        }
    }
}

/// Exponential backoff delay, capped at 30s.
fn calculate_backoff(base: Duration, attempt: u32) -> Duration {
    let delay = base * 2u32.saturating_pow(attempt.saturating_sub(1));
    std::cmp::min(delay, Duration::from_secs(30))
}

/// Scoped borrow of a pooled connection; released on drop.
pub struct PoolGuard {
    inner: Arc<PoolInner>,
    key: String,
    generation: u64,
    conn: PooledConnection,
}

impl std::fmt::Debug for PoolGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolGuard")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .field("conn", &self.conn)
            .finish()
    }
}

impl PoolGuard {
    fn new(inner: Arc<PoolInner>, key: String, generation: u64, conn: PooledConnection) -> Self {
        Self {
            inner,
            key,
            generation,
            conn,
        }
    }

    pub fn connection(&self) -> &PooledConnection {
        &self.conn
    }
}

impl Deref for PoolGuard {
    type Target = PooledConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        self.inner.release(&self.key, self.generation);
    }
}
