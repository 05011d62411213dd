//! # psl-pool
//!
//! Endpoint-keyed connection cache for the pooled session layer.
//!
//! ## Layers
//!
//! ```text
//! ConnectionPool<T>            (pool)    one mutex, disposer, capacity target
//!   ├── EndpointIndex          (index)   (host, port, user) -> EntryId
//!   └── LruList<HandleRecord>  (lru)     recency ring + refcounts
//! ```
//!
//! The payload `T` is opaque to the pool; a client layer usually stores a
//! channel in it and connects it when `acquire` reports a fresh handle.

pub mod config;
pub mod index;
pub mod lru;
pub mod pool;

pub use config::{CacheCapacity, PoolConfig};
pub use index::EndpointIndex;
pub use lru::{EntryId, LruEntry, LruList, Release};
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
