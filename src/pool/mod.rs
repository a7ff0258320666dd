//! Connection pool module
//!
//! Caches live transports (SSH sessions, Docker clients, Kubernetes
//! clients) keyed by target identity, with bounded concurrent borrows,
//! FIFO waiters, idle eviction, transparent reconnect, and metrics. The
//! pool is the sole owner of connection lifecycle; adapters borrow through
//! it and never close connections themselves.

mod connection;
mod metrics;
#[allow(clippy::module_inception)]
mod pool;

pub use connection::{ConnectionFactory, PooledConnection};
pub use metrics::{KeyMetrics, PoolMetrics};
pub use pool::{ConnectionPool, PoolConfig, PoolGuard};
