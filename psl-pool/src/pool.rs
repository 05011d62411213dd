//! # Connection Pool
//!
//! Purpose: Keep at most one live session per `(host, port, user)` and reuse
//! it across callers, disposing idle sessions in LRU order once more than the
//! configured number are idle.
//!
//! ## Design Principles
//! 1. **Single Flight**: lookup and creation happen under one mutex, so two
//!    concurrent `acquire` calls for the same endpoint share one handle.
//! 2. **Dispose Unlocked**: the disposer may do network I/O; the mutex is
//!    always released before it runs.
//! 3. **RAII Release**: `PooledConnection` gives its reference back on drop,
//!    so a release can be neither skipped nor repeated.
//! 4. **Detach, Don't Destroy**: a broken session is detached from the pool
//!    and torn down when its last borrower lets go.
//!
//! ## Handle Lifecycle
//!
//! ```text
//! acquire ──> Pooled-Borrowed <──addref/drop──> Pooled-Free ──collect──> Disposed
//!                   │                                                      ^
//!                 detach                                                   │
//!                   v                                                      │
//!             Detached-Borrowed ──────────── last drop ───────────────────┘
//! ```

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;
use psl_common::{EndpointKey, EndpointRef, PslResult};
use tracing::{debug, error, warn};

use crate::config::{CacheCapacity, PoolConfig};
use crate::index::EndpointIndex;
use crate::lru::{EntryId, LruList, Release};

type Disposer<T> = Box<dyn Fn(T) -> PslResult<()> + Send + Sync>;

struct HandleRecord<T> {
    key: Option<EndpointKey>,
    cached: bool,
    payload: Arc<T>,
}

struct PoolState<T> {
    lru: LruList<HandleRecord<T>>,
    index: EndpointIndex,
}

struct PoolInner<T> {
    config: PoolConfig,
    capacity: CacheCapacity,
    disposer: Disposer<T>,
    state: Mutex<PoolState<T>>,
}

/// Counters reported by [`ConnectionPool::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Handles reachable through the endpoint index.
    pub cached: usize,
    /// Pooled handles nobody borrows.
    pub free: usize,
    /// All live handles, including detached and uncached ones.
    pub handles: usize,
}

/// Endpoint-keyed connection pool handle.
pub struct ConnectionPool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for ConnectionPool<T> {
    fn clone(&self) -> Self {
        ConnectionPool {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for ConnectionPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("type_name", &self.inner.config.type_name)
            .field("capacity", &self.inner.capacity.get())
            .field("stats", &self.stats())
            .finish()
    }
}

impl<T> ConnectionPool<T> {
    /// Creates a pool with its own capacity target taken from `config`.
    pub fn new<F>(config: PoolConfig, disposer: F) -> Self
    where
        F: Fn(T) -> PslResult<()> + Send + Sync + 'static,
    {
        let capacity = CacheCapacity::new(config.capacity);
        Self::with_capacity(config, capacity, disposer)
    }

    /// Creates a pool that reads its idle target from a shared `CacheCapacity`.
    pub fn with_capacity<F>(config: PoolConfig, capacity: CacheCapacity, disposer: F) -> Self
    where
        F: Fn(T) -> PslResult<()> + Send + Sync + 'static,
    {
        let state = PoolState {
            lru: LruList::new(),
            index: EndpointIndex::new(config.table_size),
        };
        ConnectionPool {
            inner: Arc::new(PoolInner {
                config,
                capacity,
                disposer: Box::new(disposer),
                state: Mutex::new(state),
            }),
        }
    }

    /// Returns the configuration the pool was built with.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Returns the shared idle target.
    pub fn capacity(&self) -> &CacheCapacity {
        &self.inner.capacity
    }

    /// Adjusts the idle target; see [`CacheCapacity::change`].
    pub fn change_capacity(&self, delta: isize) -> isize {
        self.inner.capacity.change(delta)
    }

    /// Acquires the pooled connection for an endpoint, creating a default
    /// payload if none exists.
    ///
    /// Returns the guard and whether the handle was created by this call;
    /// the caller is expected to establish the session when it was.
    pub fn acquire(
        &self,
        hostname: &str,
        port: u16,
        username: &str,
    ) -> PslResult<(PooledConnection<T>, bool)>
    where
        T: Default,
    {
        self.acquire_with(hostname, port, username, T::default)
    }

    /// Like [`acquire`](Self::acquire), building a new payload with `init`.
    ///
    /// `init` runs under the pool mutex and must not block.
    pub fn acquire_with<F>(
        &self,
        hostname: &str,
        port: u16,
        username: &str,
        init: F,
    ) -> PslResult<(PooledConnection<T>, bool)>
    where
        F: FnOnce() -> T,
    {
        let endpoint = EndpointRef::new(hostname, port, username);
        let mut state = self.inner.state.lock();
        let PoolState { lru, index } = &mut *state;

        if let Some(id) = index.lookup(endpoint) {
            lru.addref(id);
            let payload = Arc::clone(&record(lru, id).payload);
            drop(state);
            return Ok((PooledConnection::new(Arc::clone(&self.inner), id, payload), false));
        }

        let result = index.enter(endpoint, || {
            let key = endpoint.to_key()?;
            Ok(lru.insert_new(HandleRecord {
                key: Some(key),
                cached: true,
                payload: Arc::new(init()),
            }))
        });
        let (id, _) = match result {
            Ok(entered) => entered,
            Err(err) => {
                debug!(
                    pool = %self.inner.config.type_name,
                    hostname,
                    port,
                    username,
                    error = %err,
                    "failed to enter new connection"
                );
                return Err(err);
            }
        };
        let payload = Arc::clone(&record(lru, id).payload);
        drop(state);

        debug!(
            pool = %self.inner.config.type_name,
            hostname,
            port,
            username,
            "created pooled connection"
        );
        Ok((PooledConnection::new(Arc::clone(&self.inner), id, payload), true))
    }

    /// Wraps a payload in a borrowed handle that is not in the pool.
    ///
    /// Dropping the guard disposes it unless it was attached first.
    pub fn new_uncached(&self, payload: T) -> PooledConnection<T> {
        let payload = Arc::new(payload);
        let id = self.inner.state.lock().lru.insert_uncached(HandleRecord {
            key: None,
            cached: false,
            payload: Arc::clone(&payload),
        });
        PooledConnection::new(Arc::clone(&self.inner), id, payload)
    }

    /// Moves an uncached handle into the pool, most recently used.
    ///
    /// # Errors
    /// `AlreadyExists` if the endpoint already has a pooled connection, in
    /// which case the handle stays uncached and usable.
    ///
    /// # Panics
    /// Panics if the handle is already cached or belongs to another pool.
    pub fn attach(
        &self,
        conn: &PooledConnection<T>,
        hostname: &str,
        port: u16,
        username: &str,
    ) -> PslResult<()> {
        self.attach_at(conn, EndpointRef::new(hostname, port, username), false)
    }

    /// Like [`attach`](Self::attach) but links the handle as the next
    /// eviction candidate.
    pub fn attach_tail(
        &self,
        conn: &PooledConnection<T>,
        hostname: &str,
        port: u16,
        username: &str,
    ) -> PslResult<()> {
        self.attach_at(conn, EndpointRef::new(hostname, port, username), true)
    }

    fn attach_at(
        &self,
        conn: &PooledConnection<T>,
        endpoint: EndpointRef<'_>,
        at_tail: bool,
    ) -> PslResult<()> {
        if !Arc::ptr_eq(&conn.pool, &self.inner) {
            error!(pool = %self.inner.config.type_name, "attach of a foreign connection");
            panic!("attach: connection belongs to another pool");
        }

        let mut state = self.inner.state.lock();
        let PoolState { lru, index } = &mut *state;
        if record(lru, conn.id).cached {
            error!(
                pool = %self.inner.config.type_name,
                entry = conn.id.index(),
                "attach of an already cached connection"
            );
            panic!("attach: connection is already cached");
        }

        let key = endpoint.to_key()?;
        if let Err(err) = index.enter_key(endpoint.to_key()?, conn.id) {
            debug!(
                pool = %self.inner.config.type_name,
                endpoint = %key,
                error = %err,
                "failed to attach connection"
            );
            return Err(err);
        }
        if at_tail {
            lru.link_tail(conn.id);
        } else {
            lru.link_head(conn.id);
        }
        let record = record_mut(lru, conn.id);
        record.key = Some(key);
        record.cached = true;
        Ok(())
    }

    /// Disposes idle connections down to the configured capacity.
    pub fn collect(&self) -> usize {
        self.inner.collect_to(self.inner.capacity.get())
    }

    /// Disposes idle connections until at most `target` remain.
    pub fn collect_to(&self, target: usize) -> usize {
        self.inner.collect_to(target)
    }

    /// Disposes every idle connection.
    pub fn collect_all(&self) -> usize {
        self.inner.collect_to(0)
    }

    /// Tears the pool down.
    ///
    /// Idle connections are disposed now. Borrowed ones are detached and
    /// disposed when their last guard drops. Returns the number disposed by
    /// this call.
    pub fn shutdown(&self) -> usize {
        let mut disposed = self.inner.collect_to(0);

        let records = {
            let mut state = self.inner.state.lock();
            let PoolState { lru, index } = &mut *state;
            let mut records = Vec::new();
            for (key, id) in index.drain() {
                if lru.acquired(id) <= 0 {
                    if let Some(record) = lru.remove(id) {
                        records.push(record);
                    }
                    continue;
                }
                warn!(
                    pool = %self.inner.config.type_name,
                    endpoint = %key,
                    refcount = lru.acquired(id),
                    "connection still borrowed at shutdown, detaching"
                );
                lru.purge(id);
                record_mut(lru, id).cached = false;
            }
            records
        };

        for record in records {
            self.inner.dispose(record);
            disposed += 1;
        }
        disposed
    }

    /// Returns current counters.
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            cached: state.index.len(),
            free: state.lru.free_cached_entries(),
            handles: state.lru.len(),
        }
    }

    /// Endpoint keys from most to least recently used.
    pub fn recency(&self) -> Vec<EndpointKey> {
        let state = self.inner.state.lock();
        state
            .lru
            .recency()
            .into_iter()
            .filter_map(|id| state.lru.get(id)?.key.clone())
            .collect()
    }
}

fn record<T>(lru: &LruList<HandleRecord<T>>, id: EntryId) -> &HandleRecord<T> {
    lru.get(id).expect("pooled handle exists")
}

fn record_mut<T>(lru: &mut LruList<HandleRecord<T>>, id: EntryId) -> &mut HandleRecord<T> {
    lru.get_mut(id).expect("pooled handle exists")
}

impl<T> PoolInner<T> {
    fn collect_to(&self, target: usize) -> usize {
        let mut disposed = 0;
        loop {
            let record = {
                let mut state = self.state.lock();
                let PoolState { lru, index } = &mut *state;
                let Some((_, record)) = lru.evict_one(target) else {
                    break;
                };
                if let Some(key) = record.key.as_ref().filter(|_| record.cached) {
                    index.remove(key.as_probe());
                }
                record
            };
            self.dispose(record);
            disposed += 1;
        }
        disposed
    }

    fn release(&self, id: EntryId) {
        let disposable = {
            let mut state = self.state.lock();
            match state.lru.delref(id) {
                Release::Held => return,
                Release::Pooled => None,
                Release::Dispose => state.lru.remove(id),
            }
        };
        match disposable {
            Some(record) => self.dispose(record),
            None => {
                self.collect_to(self.capacity.get());
            }
        }
    }

    fn dispose(&self, record: HandleRecord<T>) {
        let key = record.key;
        match Arc::try_unwrap(record.payload) {
            Ok(payload) => {
                if let Err(err) = (self.disposer)(payload) {
                    warn!(
                        pool = %self.config.type_name,
                        endpoint = ?key,
                        error = %err,
                        "failed to dispose connection"
                    );
                }
            }
            Err(_) => {
                error!(
                    pool = %self.config.type_name,
                    endpoint = ?key,
                    "payload still shared at disposal"
                );
            }
        }
    }
}

/// Borrowed reference to a pooled connection.
///
/// Dereferences to the payload. Dropping the guard releases the reference:
/// an idle pooled handle becomes an eviction candidate, a detached or
/// uncached one is disposed.
pub struct PooledConnection<T> {
    pool: Arc<PoolInner<T>>,
    id: EntryId,
    payload: Option<Arc<T>>,
}

impl<T> PooledConnection<T> {
    fn new(pool: Arc<PoolInner<T>>, id: EntryId, payload: Arc<T>) -> Self {
        PooledConnection {
            pool,
            id,
            payload: Some(payload),
        }
    }

    /// Marks the connection as most recently used.
    pub fn touch(&self) {
        let mut state = self.pool.state.lock();
        if record(&state.lru, self.id).cached {
            state.lru.touch(self.id);
        }
    }

    /// Removes the connection from the pool without releasing it.
    ///
    /// Later acquires for the endpoint create a new handle. Idempotent.
    pub fn detach(&self) {
        let mut state = self.pool.state.lock();
        let PoolState { lru, index } = &mut *state;
        let record = record_mut(lru, self.id);
        if !record.cached {
            return;
        }
        record.cached = false;
        if let Some(key) = record.key.as_ref() {
            index.remove(key.as_probe());
        }
        lru.purge(self.id);
    }

    /// True while the handle is reachable through the pool.
    pub fn is_cached(&self) -> bool {
        record(&self.pool.state.lock().lru, self.id).cached
    }

    /// Number of outstanding references to this handle.
    pub fn refcount(&self) -> i32 {
        self.pool.state.lock().lru.acquired(self.id)
    }

    /// Endpoint this handle was created or attached for.
    pub fn key(&self) -> Option<EndpointKey> {
        record(&self.pool.state.lock().lru, self.id).key.clone()
    }

    /// Hostname of the endpoint key, if the handle has one.
    pub fn hostname(&self) -> Option<String> {
        self.key().map(|key| key.hostname().to_string())
    }

    /// Port of the endpoint key.
    pub fn port(&self) -> Option<u16> {
        self.key().map(|key| key.port())
    }

    /// Username of the endpoint key.
    pub fn username(&self) -> Option<String> {
        self.key().map(|key| key.username().to_string())
    }

    /// Takes another reference to the same handle.
    pub fn clone_handle(&self) -> Self {
        let payload = {
            let mut state = self.pool.state.lock();
            state.lru.addref(self.id);
            Arc::clone(&record(&state.lru, self.id).payload)
        };
        PooledConnection::new(Arc::clone(&self.pool), self.id, payload)
    }

    /// Releases the reference now instead of at end of scope.
    pub fn release(self) {
        drop(self);
    }
}

impl<T> Clone for PooledConnection<T> {
    fn clone(&self) -> Self {
        self.clone_handle()
    }
}

impl<T> Deref for PooledConnection<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.payload.as_deref().expect("payload present until drop")
    }
}

impl<T> fmt::Debug for PooledConnection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.pool.config.type_name)
            .field("entry", &self.id.index())
            .finish()
    }
}

impl<T> Drop for PooledConnection<T> {
    fn drop(&mut self) {
        let payload = match self.payload.take() {
            Some(payload) => payload,
            None => return,
        };
        // The guard's share must be gone before the disposer unwraps the Arc.
        drop(payload);
        self.pool.release(self.id);
    }
}
