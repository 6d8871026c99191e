//! Native handle pool.
//!
//! Sessions borrow a handle on open and give it back on close. Handles are
//! grouped by [`PoolKey`], so only sessions with identical settings share
//! them; each group is an r2d2 pool. Several sessions on different threads may
//! use one pool at the same time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use r2d2::{CustomizeConnection, ManageConnection, Pool, PooledConnection};
use tracing::{debug, info, warn};

use crate::config::{ConnectionOptions, PoolKey};
use crate::errors::{Error, Result};
use crate::native::NativeHandle;

/// Where an idle handle waits inside a group's r2d2 pool.
///
/// Slots are created empty; a borrower that finds its slot empty opens the
/// handle on its own thread so open failures keep their engine code. The slot
/// is empty again while its handle is on loan.
#[derive(Debug, Default)]
pub(crate) struct HandleSlot {
    handle: Option<NativeHandle>,
}

/// r2d2 manager for the slots of one pool group.
#[derive(Debug)]
pub(crate) struct NativeHandleManager {
    key: PoolKey,
    /// Set once the group is cleared; every slot coming back is then dropped.
    cleared: Arc<AtomicBool>,
}

impl ManageConnection for NativeHandleManager {
    type Connection = HandleSlot;
    type Error = Error;

    fn connect(&self) -> Result<HandleSlot> {
        Ok(HandleSlot::default())
    }

    fn is_valid(&self, slot: &mut HandleSlot) -> Result<()> {
        match slot.handle.as_ref() {
            Some(handle) => handle.exec("SELECT 1;"),
            None => Ok(()),
        }
    }

    fn has_broken(&self, slot: &mut HandleSlot) -> bool {
        slot.handle.is_none() || self.cleared.load(Ordering::Acquire)
    }
}

/// Logs handles r2d2 closes on its own (broken slots, cleared groups).
#[derive(Debug)]
struct LogOnRelease {
    key: PoolKey,
}

impl CustomizeConnection<HandleSlot, Error> for LogOnRelease {
    fn on_release(&self, slot: HandleSlot) {
        if slot.handle.is_some() {
            debug!(key = %self.key, "closing pooled handle");
        }
    }
}

/// A handle on loan from a pool.
pub struct PooledHandle {
    handle: NativeHandle,
    lease: PooledConnection<NativeHandleManager>,
    key: PoolKey,
    pooling: bool,
    retired: bool,
}

impl PooledHandle {
    pub(crate) fn handle(&self) -> &NativeHandle {
        &self.handle
    }

    /// Key of the group the handle belongs to.
    pub fn pool_key(&self) -> &PoolKey {
        &self.key
    }

    /// Whether any prepared statement is still alive on the handle.
    pub fn has_open_statements(&self) -> bool {
        self.handle.has_open_statements()
    }

    /// Whether the handle is outside an explicit transaction.
    pub fn is_autocommit(&self) -> bool {
        self.handle.is_autocommit()
    }

    /// Whether the handle was marked unfit for reuse.
    pub fn is_retired(&self) -> bool {
        self.retired
    }

    /// Mark the handle unfit for reuse; it is closed when given back.
    pub(crate) fn retire(&mut self, reason: &str) {
        if !self.retired {
            debug!(key = %self.key, reason, "retiring handle");
            self.retired = true;
        }
    }
}

impl std::fmt::Debug for PooledHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledHandle")
            .field("key", &self.key)
            .field("pooling", &self.pooling)
            .field("retired", &self.retired)
            .finish()
    }
}

/// Issues and reclaims native handles.
pub trait HandlePool: Send + Sync {
    /// Borrow a handle for `options`, reusing an idle one when possible.
    fn acquire(&self, options: &ConnectionOptions) -> Result<PooledHandle>;

    /// Return a handle that is safe for the next borrower.
    fn release(&self, handle: PooledHandle);

    /// Close a handle that must not be reused.
    fn discard(&self, handle: PooledHandle);

    /// Close the idle handles of one group; handles still on loan are closed
    /// when they come back.
    fn clear(&self, key: &PoolKey);

    /// [`clear`](HandlePool::clear) every group.
    fn clear_all(&self);
}

struct PoolGroup {
    pool: Pool<NativeHandleManager>,
    cleared: Arc<AtomicBool>,
}

impl PoolGroup {
    fn build(options: &ConnectionOptions, key: &PoolKey) -> Result<Self> {
        let cleared = Arc::new(AtomicBool::new(false));
        let manager = NativeHandleManager {
            key: key.clone(),
            cleared: Arc::clone(&cleared),
        };
        let pool = Pool::builder()
            .max_size(options.max_pool_size)
            .min_idle(Some(0))
            .idle_timeout(None)
            .max_lifetime(None)
            .connection_timeout(options.default_timeout().max(Duration::from_secs(1)))
            .connection_customizer(Box::new(LogOnRelease { key: key.clone() }))
            .build(manager)
            .map_err(|source| Error::Pool { source })?;
        Ok(Self { pool, cleared })
    }

    /// Stop pooling in this group and close its idle handles; returns how
    /// many were closed.
    fn drain(self) -> usize {
        self.cleared.store(true, Ordering::Release);
        let mut closed = 0;
        while let Some(mut slot) = self.pool.try_get() {
            if slot.handle.take().is_some() {
                closed += 1;
            }
        }
        closed
    }
}

/// The default [`HandlePool`].
///
/// A returned handle keeps its database contents. For `:memory:` data
/// sources that means the next session with the same key sees the tables the
/// previous one left behind; use `Pooling=False` when every session needs a
/// fresh in-memory database.
#[derive(Default)]
pub struct SqlitePool {
    groups: Mutex<HashMap<PoolKey, PoolGroup>>,
}

static SHARED_POOL: OnceLock<Arc<SqlitePool>> = OnceLock::new();

impl SqlitePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide pool used by [`Connection::new`](crate::Connection::new).
    ///
    /// Created on first use and never torn down.
    pub fn shared() -> Arc<SqlitePool> {
        Arc::clone(SHARED_POOL.get_or_init(|| Arc::new(SqlitePool::new())))
    }

    /// Handles of group `key` currently on loan.
    pub fn outstanding(&self, key: &PoolKey) -> usize {
        self.groups().get(key).map_or(0, |group| {
            let state = group.pool.state();
            (state.connections - state.idle_connections) as usize
        })
    }

    /// Handles of group `key` waiting to be reused.
    pub fn idle(&self, key: &PoolKey) -> usize {
        self.groups()
            .get(key)
            .map_or(0, |group| group.pool.state().idle_connections as usize)
    }

    fn groups(&self) -> MutexGuard<'_, HashMap<PoolKey, PoolGroup>> {
        self.groups.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The r2d2 pool of the group for `options`, created on first use.
    fn group_pool(&self, options: &ConnectionOptions, key: &PoolKey) -> Result<Pool<NativeHandleManager>> {
        let mut groups = self.groups();
        if let Some(group) = groups.get(key) {
            return Ok(group.pool.clone());
        }
        let group = PoolGroup::build(options, key)?;
        let pool = group.pool.clone();
        groups.insert(key.clone(), group);
        debug!(key = %key, max_size = options.max_pool_size, "created pool group");
        Ok(pool)
    }

    /// Park the handle in its slot if it may be reused, otherwise close it.
    /// Dropping the lease hands the slot back to r2d2.
    fn give_back(&self, pooled: PooledHandle, reusable: bool) {
        let PooledHandle {
            handle,
            mut lease,
            key,
            pooling,
            retired,
        } = pooled;
        if reusable && pooling && !retired {
            lease.handle = Some(handle);
            debug!(key = %key, "returned handle to pool");
        } else {
            debug!(key = %key, pooling, retired, "closing returned handle");
            drop(handle);
        }
    }
}

impl HandlePool for SqlitePool {
    fn acquire(&self, options: &ConnectionOptions) -> Result<PooledHandle> {
        let key = options.pool_key();
        let pool = self.group_pool(options, &key)?;
        let mut lease = pool.get().map_err(|source| Error::Pool { source })?;
        // A failed open drops the empty lease, which r2d2 then forgets.
        let handle = match lease.handle.take() {
            Some(handle) => {
                debug!(key = %key, "reusing pooled handle");
                handle
            }
            None => NativeHandle::open(options)?,
        };
        Ok(PooledHandle {
            handle,
            lease,
            key,
            pooling: options.pooling,
            retired: false,
        })
    }

    fn release(&self, handle: PooledHandle) {
        // A handle still inside a transaction or with live statements would
        // leak them to the next borrower.
        let reusable = handle.is_autocommit() && !handle.has_open_statements();
        if !reusable {
            warn!(key = %handle.key, "returned handle is not clean; closing it");
        }
        self.give_back(handle, reusable);
    }

    fn discard(&self, handle: PooledHandle) {
        warn!(key = %handle.key, "discarding handle");
        self.give_back(handle, false);
    }

    fn clear(&self, key: &PoolKey) {
        let group = self.groups().remove(key);
        let closed = group.map_or(0, PoolGroup::drain);
        info!(key = %key, closed, "cleared pool group");
    }

    fn clear_all(&self) {
        let groups: Vec<PoolGroup> = self.groups().drain().map(|(_, group)| group).collect();
        let closed: usize = groups.into_iter().map(PoolGroup::drain).sum();
        info!(closed, "cleared all pool groups");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn options(conn_str: &str) -> ConnectionOptions {
        ConnectionOptions::parse(conn_str).unwrap()
    }

    #[test]
    fn released_handles_are_reused() {
        let pool = SqlitePool::new();
        let opts = options("Data Source=:memory:");
        let key = opts.pool_key();

        let first = pool.acquire(&opts).unwrap();
        let first_ptr = first.handle().as_ptr();
        assert_eq!(pool.outstanding(&key), 1);
        pool.release(first);
        assert_eq!((pool.outstanding(&key), pool.idle(&key)), (0, 1));

        let second = pool.acquire(&opts).unwrap();
        assert_eq!(second.handle().as_ptr(), first_ptr);
        assert_eq!(pool.idle(&key), 0);
        pool.release(second);
    }

    #[test]
    fn pooling_disabled_closes_handles() {
        let pool = SqlitePool::new();
        let opts = options("Data Source=:memory:;Pooling=False");
        let key = opts.pool_key();
        let handle = pool.acquire(&opts).unwrap();
        pool.release(handle);
        assert_eq!((pool.outstanding(&key), pool.idle(&key)), (0, 0));
    }

    #[test]
    fn clear_closes_idle_and_late_returns() {
        let pool = SqlitePool::new();
        let opts = options("Data Source=:memory:");
        let key = opts.pool_key();
        let idle = pool.acquire(&opts).unwrap();
        let on_loan = pool.acquire(&opts).unwrap();
        pool.release(idle);
        assert_eq!(pool.idle(&key), 1);

        pool.clear(&key);
        assert_eq!(pool.idle(&key), 0);
        pool.release(on_loan);
        assert_eq!((pool.outstanding(&key), pool.idle(&key)), (0, 0));

        let fresh = pool.acquire(&opts).unwrap();
        pool.release(fresh);
        assert_eq!(pool.idle(&key), 1);
        pool.clear_all();
        assert_eq!(pool.idle(&key), 0);
    }

    #[test]
    fn dirty_retired_and_discarded_handles_are_not_pooled() {
        let pool = SqlitePool::new();
        let opts = options("Data Source=:memory:");
        let key = opts.pool_key();

        let in_txn = pool.acquire(&opts).unwrap();
        in_txn.handle().exec("BEGIN").unwrap();
        pool.release(in_txn);
        assert_eq!(pool.idle(&key), 0);

        let mut retired = pool.acquire(&opts).unwrap();
        retired.retire("test");
        assert!(retired.is_retired());
        pool.release(retired);
        assert_eq!(pool.idle(&key), 0);

        let discarded = pool.acquire(&opts).unwrap();
        pool.discard(discarded);
        assert_eq!((pool.outstanding(&key), pool.idle(&key)), (0, 0));
    }

    #[test]
    fn failed_acquire_does_not_count() {
        let pool = SqlitePool::new();
        let opts = options("Data Source=/nonexistent/dir/db.sqlite;Mode=ReadWrite");
        let err = pool.acquire(&opts).unwrap_err();
        assert_eq!(err.sqlite_code(), Some(libsqlite3_sys::SQLITE_CANTOPEN));
        assert_eq!(pool.outstanding(&opts.pool_key()), 0);
        assert_eq!(pool.idle(&opts.pool_key()), 0);
    }

    #[test]
    fn memory_databases_keep_their_tables_between_borrowers() {
        let pool = SqlitePool::new();
        let opts = options("Data Source=:memory:");
        let first = pool.acquire(&opts).unwrap();
        first.handle().exec("CREATE TABLE left_behind (x INTEGER)").unwrap();
        pool.release(first);

        let second = pool.acquire(&opts).unwrap();
        second.handle().exec("SELECT x FROM left_behind").unwrap();
        pool.release(second);

        let isolated = options("Data Source=:memory:;Pooling=False");
        let first = pool.acquire(&isolated).unwrap();
        first.handle().exec("CREATE TABLE left_behind (x INTEGER)").unwrap();
        pool.release(first);
        let second = pool.acquire(&isolated).unwrap();
        assert!(second.handle().exec("SELECT x FROM left_behind").is_err());
        pool.release(second);
    }

    #[test]
    fn borrowers_on_many_threads_share_a_group() {
        let pool = Arc::new(SqlitePool::new());
        let opts = options("Data Source=:memory:;Max Pool Size=4");
        let key = opts.pool_key();
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let opts = opts.clone();
                thread::spawn(move || {
                    for _ in 0..20 {
                        let handle = pool.acquire(&opts).unwrap();
                        handle.handle().exec("SELECT 1;").unwrap();
                        pool.release(handle);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(pool.outstanding(&key), 0);
        assert!(pool.idle(&key) <= 4);
    }

    #[test]
    fn shared_pool_is_a_singleton() {
        assert!(Arc::ptr_eq(&SqlitePool::shared(), &SqlitePool::shared()));
    }
}
