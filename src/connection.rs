//! The session: a connection state machine over a pooled native handle.
//!
//! Opening borrows a handle from the pool, applies the session pragmas and
//! replays the extensibility registry onto it. Closing rolls back the active
//! transaction, disposes dependent statements, undoes the registry and returns
//! the handle. Registrations live on the `Connection` and survive any number
//! of close/reopen cycles.

use std::cmp::Ordering;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use libsqlite3_sys::SQLITE_NOTADB;
use tracing::{debug, info, warn};

use crate::callbacks::{erase_aggregate, erase_collation, erase_scalar};
use crate::command::{self, RawStatement, Statement, StatementArena};
use crate::config::{CacheMode, ConnectionOptions, PoolKey};
use crate::conversion::Arguments;
use crate::errors::{Error, Result};
use crate::exceptions::CallbackError;
use crate::native::{library_version, NativeHandle};
use crate::pool::{HandlePool, PooledHandle, SqlitePool};
use crate::registry::{
    is_builtin_collation, is_builtin_function, Arity, ExtensionRef, FunctionDef, FunctionKey,
    Registry, ReplayCounts,
};
use crate::transaction::{BeginPlan, IsolationLevel, Transaction};
use crate::types::{ConnectionState, StateChange, Value};
use crate::utils::quote_literal;

/// State shared between a connection and its dependents.
#[derive(Default)]
pub(crate) struct SessionCore {
    /// Present iff the session is open.
    pub(crate) handle: Option<PooledHandle>,
    /// Id of the active transaction, if any.
    pub(crate) transaction: Option<u64>,
    pub(crate) statements: StatementArena,
    last_transaction: u64,
}

pub(crate) fn lock_core(core: &Mutex<SessionCore>) -> MutexGuard<'_, SessionCore> {
    core.lock().unwrap_or_else(PoisonError::into_inner)
}

type StateListener = Box<dyn Fn(StateChange) + Send + Sync>;

/// A session over the embedded database.
///
/// A `Connection` starts closed. It is used from one thread at a time; the
/// pool behind it may be shared by any number of connections.
pub struct Connection {
    connection_string: String,
    options: ConnectionOptions,
    default_timeout: Duration,
    pool: Arc<dyn HandlePool>,
    core: Arc<Mutex<SessionCore>>,
    registry: Registry,
    listeners: Vec<StateListener>,
}

impl Connection {
    /// Create a closed connection that borrows handles from the shared pool.
    pub fn new(connection_string: &str) -> Result<Self> {
        Self::with_pool(connection_string, SqlitePool::shared())
    }

    /// Create a closed connection that borrows handles from `pool`.
    pub fn with_pool(connection_string: &str, pool: Arc<dyn HandlePool>) -> Result<Self> {
        let options = ConnectionOptions::parse(connection_string)?;
        Ok(Self {
            connection_string: connection_string.to_string(),
            default_timeout: options.default_timeout(),
            options,
            pool,
            core: Arc::new(Mutex::new(SessionCore::default())),
            registry: Registry::default(),
            listeners: Vec::new(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        if lock_core(&self.core).handle.is_some() {
            ConnectionState::Open
        } else {
            ConnectionState::Closed
        }
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// Replace the connection string. Only allowed while closed.
    pub fn set_connection_string(&mut self, connection_string: &str) -> Result<()> {
        if self.state() == ConnectionState::Open {
            return Err(Error::usage(
                "The connection string cannot be changed while the connection is open",
            ));
        }
        let options = ConnectionOptions::parse(connection_string)?;
        self.default_timeout = options.default_timeout();
        self.options = options;
        self.connection_string = connection_string.to_string();
        Ok(())
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Key of this connection's pool group.
    pub fn pool_key(&self) -> PoolKey {
        self.options.pool_key()
    }

    /// File backing the main database while open, the configured data source
    /// otherwise (and for in-memory databases).
    pub fn data_source(&self) -> String {
        let core = lock_core(&self.core);
        core.handle
            .as_ref()
            .and_then(|pooled| pooled.handle().filename(self.database()))
            .unwrap_or_else(|| self.options.data_source.clone())
    }

    pub fn database(&self) -> &'static str {
        "main"
    }

    pub fn server_version(&self) -> String {
        library_version()
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Change the busy timeout; applied to the live handle when open and to
    /// every later open.
    pub fn set_default_timeout(&mut self, timeout: Duration) -> Result<()> {
        let core = lock_core(&self.core);
        if let Some(pooled) = core.handle.as_ref() {
            pooled.handle().set_busy_timeout(busy_timeout_millis(timeout))?;
        }
        self.default_timeout = timeout;
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        lock_core(&self.core).transaction.is_some()
    }

    /// Register a listener for Closed→Open and Open→Closed transitions.
    pub fn on_state_change(&mut self, listener: impl Fn(StateChange) + Send + Sync + 'static) {
        self.listeners.push(Box::new(listener));
    }

    fn notify(&self, change: StateChange) {
        for listener in &self.listeners {
            listener(change);
        }
    }

    /// Open the connection. Does nothing if it is already open.
    ///
    /// On any failure the handle goes back to the pool and the connection
    /// stays closed.
    pub fn open(&mut self) -> Result<()> {
        if self.state() == ConnectionState::Open {
            return Ok(());
        }
        let mut pooled = self.pool.acquire(&self.options)?;
        if let Err(err) = self.activate(&mut pooled) {
            warn!(key = %pooled.pool_key(), error = %err, "open failed; returning handle");
            if let Err(undo_err) = self.return_handle(pooled) {
                warn!(error = %undo_err, "handle from failed open was discarded");
            }
            return Err(err);
        }
        lock_core(&self.core).handle = Some(pooled);
        info!(data_source = %self.options.data_source, registrations = self.registry.len(), "connection opened");
        self.notify(StateChange::OPENED);
        Ok(())
    }

    /// Session pragmas and registry replay on a freshly borrowed handle.
    ///
    /// A handle left with something undo cannot remove is retired, whether or
    /// not the replay finished.
    fn activate(&self, pooled: &mut PooledHandle) -> Result<()> {
        let handle = pooled.handle();
        handle.set_busy_timeout(busy_timeout_millis(self.default_timeout))?;
        if let Some(password) = &self.options.password {
            apply_password(handle, password)?;
        }
        if let Some(enabled) = self.options.foreign_keys {
            handle.exec(if enabled {
                "PRAGMA foreign_keys = 1;"
            } else {
                "PRAGMA foreign_keys = 0;"
            })?;
        }
        if self.options.recursive_triggers {
            handle.exec("PRAGMA recursive_triggers = 1;")?;
        }
        let mut counts = ReplayCounts::default();
        let replayed = self.registry.replay(handle, &mut counts);
        if counts.leaves_residue() {
            pooled.retire("registrations replace built-ins or load extensions");
        }
        replayed
    }

    /// Undo the registry on `pooled` and give it back; a retired handle or one
    /// that cannot be cleaned is discarded instead.
    fn return_handle(&self, pooled: PooledHandle) -> Result<()> {
        if pooled.is_retired() {
            self.pool.discard(pooled);
            return Ok(());
        }
        match self.registry.undo(pooled.handle()) {
            Ok(()) => {
                self.pool.release(pooled);
                Ok(())
            }
            Err(err) => {
                self.pool.discard(pooled);
                Err(Error::Deactivation {
                    source: Box::new(err),
                })
            }
        }
    }

    /// Close the connection. Does nothing if it is already closed.
    ///
    /// The connection is closed even when an error is returned; the error
    /// reports that the handle could not be cleaned and was discarded.
    pub fn close(&mut self) -> Result<()> {
        let pooled = {
            let mut core = lock_core(&self.core);
            let Some(pooled) = core.handle.take() else {
                return Ok(());
            };
            if core.transaction.take().is_some() {
                debug!("rolling back active transaction on close");
            }
            if !pooled.handle().is_autocommit() {
                if let Err(err) = pooled.handle().exec("ROLLBACK;") {
                    warn!(error = %err, "failed to roll back transaction on close");
                }
            }
            core.statements.dispose_all();
            pooled
        };
        let outcome = self.return_handle(pooled);
        info!(data_source = %self.options.data_source, "connection closed");
        self.notify(StateChange::CLOSED);
        outcome
    }

    /// Remove every registration from the current handle without forgetting
    /// them, and disable extension loading.
    ///
    /// The connection stays open; the registrations come back on the next
    /// open. After a failure the handle is retired: closing discards it.
    pub fn deactivate(&mut self) -> Result<()> {
        let mut core = lock_core(&self.core);
        let Some(pooled) = core.handle.as_mut() else {
            return Ok(());
        };
        if let Err(err) = self.registry.undo(pooled.handle()) {
            pooled.retire("deactivation failed");
            return Err(Error::Deactivation {
                source: Box::new(err),
            });
        }
        debug!(registrations = self.registry.len(), "deactivated session registrations");
        Ok(())
    }

    /// Register collation `name`, or remove it when `compare` is `None`.
    pub fn create_collation<T, F>(&mut self, name: &str, state: T, compare: Option<F>) -> Result<()>
    where
        T: Send + Sync + 'static,
        F: Fn(&T, &str, &str) -> Ordering + Send + Sync + 'static,
    {
        let compare = compare.map(|compare| erase_collation(state, compare));
        let mut core = lock_core(&self.core);
        if let Some(pooled) = core.handle.as_mut() {
            if is_builtin_collation(name) {
                pooled.retire("collation replaces a built-in");
            }
        }
        let live = core.handle.as_ref().map(PooledHandle::handle);
        self.registry.set_collation(name, compare, live)
    }

    pub fn remove_collation(&mut self, name: &str) -> Result<()> {
        self.create_collation(name, (), None::<fn(&(), &str, &str) -> Ordering>)
    }

    /// Register scalar function `name`/`arity`, or remove it when `function`
    /// is `None`.
    pub fn create_function<T, R, F>(
        &mut self,
        name: &str,
        arity: Arity,
        state: T,
        deterministic: bool,
        function: Option<F>,
    ) -> Result<()>
    where
        T: Send + Sync + 'static,
        R: Into<Value>,
        F: Fn(&T, &Arguments<'_>) -> Result<R, CallbackError> + Send + Sync + 'static,
    {
        let key = FunctionKey::new(name, arity)?;
        let def = function.map(|function| FunctionDef::Scalar {
            deterministic,
            function: erase_scalar(state, function),
        });
        self.set_function(key, def)
    }

    /// Remove the scalar or aggregate function `name`/`arity`.
    pub fn remove_function(&mut self, name: &str, arity: Arity) -> Result<()> {
        let key = FunctionKey::new(name, arity)?;
        self.set_function(key, None)
    }

    /// Register aggregate function `name`/`arity`.
    ///
    /// Every group starts from a clone of `seed`, folds rows with `step` and
    /// produces its result with `finalize` (NULL when `finalize` is `None`).
    /// Without `step` the function is removed.
    pub fn create_aggregate_function<A, R, S, F>(
        &mut self,
        name: &str,
        arity: Arity,
        seed: A,
        deterministic: bool,
        step: Option<S>,
        finalize: Option<F>,
    ) -> Result<()>
    where
        A: Clone + Send + Sync + 'static,
        R: Into<Value>,
        S: Fn(A, &Arguments<'_>) -> Result<A, CallbackError> + Send + Sync + 'static,
        F: Fn(A) -> Result<R, CallbackError> + Send + Sync + 'static,
    {
        let key = FunctionKey::new(name, arity)?;
        let def = step.map(|step| FunctionDef::Aggregate {
            deterministic,
            fns: erase_aggregate(seed, step, finalize),
        });
        self.set_function(key, def)
    }

    fn set_function(&mut self, key: FunctionKey, def: Option<FunctionDef>) -> Result<()> {
        let mut core = lock_core(&self.core);
        if let Some(pooled) = core.handle.as_mut() {
            if is_builtin_function(pooled.handle(), key.name.as_str()) {
                pooled.retire("function replaces a built-in");
            }
        }
        let live = core.handle.as_ref().map(PooledHandle::handle);
        self.registry.set_function(key, def, live)
    }

    /// Allow or forbid extension loading through SQL.
    pub fn enable_extensions(&mut self, enabled: bool) -> Result<()> {
        let core = lock_core(&self.core);
        let live = core.handle.as_ref().map(PooledHandle::handle);
        self.registry.set_extensions_enabled(enabled, live)
    }

    pub fn extensions_enabled(&self) -> bool {
        self.registry.extensions_enabled()
    }

    /// Extensions loaded on every open, in registration order.
    pub fn extensions(&self) -> impl Iterator<Item = &ExtensionRef> {
        self.registry.extensions()
    }

    /// Load extension `file` now if open, and on every later open.
    ///
    /// Loading the same file and entry point twice is a no-op.
    pub fn load_extension(&mut self, file: &str, entry_point: Option<&str>) -> Result<()> {
        let extension = ExtensionRef {
            file: file.to_string(),
            entry_point: entry_point.map(str::to_string),
        };
        let mut core = lock_core(&self.core);
        let live = core.handle.as_ref().map(PooledHandle::handle);
        if !self.registry.add_extension(extension, live)? {
            debug!(file, "extension already registered");
        } else if let Some(pooled) = core.handle.as_mut() {
            pooled.retire("extension libraries cannot be unloaded");
        }
        Ok(())
    }

    /// Begin the connection's single transaction.
    ///
    /// `deferred` defaults to `true` only for
    /// [`ReadUncommitted`](IsolationLevel::ReadUncommitted).
    pub fn begin_transaction(
        &self,
        isolation: IsolationLevel,
        deferred: Option<bool>,
    ) -> Result<Transaction> {
        let mut core = lock_core(&self.core);
        let Some(pooled) = core.handle.as_ref() else {
            return Err(Error::usage(
                "A transaction can only be started while the connection is open",
            ));
        };
        if core.transaction.is_some() {
            return Err(Error::usage(
                "A transaction is already active; nested transactions are not supported",
            ));
        }
        let plan = BeginPlan::new(isolation, deferred, self.options.cache == CacheMode::Shared);
        plan.apply(pooled.handle())?;
        core.last_transaction += 1;
        let id = core.last_transaction;
        core.transaction = Some(id);
        Ok(Transaction::new(Arc::clone(&self.core), id, plan))
    }

    /// Copy database `src_name` into database `dest_name` of `destination`.
    ///
    /// A closed destination is opened for the copy and closed again afterwards.
    pub fn backup_to(&self, destination: &mut Connection, dest_name: &str, src_name: &str) -> Result<()> {
        if self.state() != ConnectionState::Open {
            return Err(Error::usage(
                "Backup requires the source connection to be open",
            ));
        }
        let opened_here = destination.state() == ConnectionState::Closed;
        if opened_here {
            destination.open()?;
        }
        let copied = {
            let source = lock_core(&self.core);
            let dest = lock_core(&destination.core);
            match (source.handle.as_ref(), dest.handle.as_ref()) {
                (Some(source), Some(dest)) => {
                    source.handle().backup_to(dest.handle(), dest_name, src_name)
                }
                _ => Err(Error::usage("Backup requires both connections to be open")),
            }
        };
        if opened_here {
            let closed = destination.close();
            copied?;
            return closed;
        }
        debug!(dest_name, src_name, "backup finished");
        copied
    }

    /// Run every statement in `sql`; returns the number of rows changed.
    pub fn execute(&self, sql: &str) -> Result<usize> {
        self.with_handle(|handle| command::execute(handle, sql))
    }

    /// First column of the first row, or NULL.
    pub fn execute_scalar(&self, sql: &str) -> Result<Value> {
        self.with_handle(|handle| command::query_scalar(handle, sql))
    }

    pub fn query(&self, sql: &str) -> Result<Vec<Vec<Value>>> {
        self.with_handle(|handle| command::query_all(handle, sql))
    }

    /// Prepare a statement that stays usable until it is disposed or the
    /// connection closes.
    pub fn prepare(&self, sql: &str) -> Result<Statement> {
        let mut core = lock_core(&self.core);
        let pooled = core
            .handle
            .as_ref()
            .ok_or_else(|| Error::usage("A statement can only be prepared while the connection is open"))?;
        let raw = RawStatement::prepare(pooled.handle(), sql)?;
        Ok(Statement::register(&self.core, &mut core, raw, sql))
    }

    /// Number of live statements prepared on this connection.
    pub fn open_statements(&self) -> usize {
        lock_core(&self.core).statements.len()
    }

    fn with_handle<T>(&self, f: impl FnOnce(&NativeHandle) -> Result<T>) -> Result<T> {
        let core = lock_core(&self.core);
        let pooled = core
            .handle
            .as_ref()
            .ok_or_else(|| Error::usage("The connection is not open"))?;
        f(pooled.handle())
    }

    /// Close the idle handles of this connection's pool group.
    pub fn clear_pool(&self) {
        self.pool.clear(&self.pool_key());
    }

    /// Close the idle handles of every group in this connection's pool.
    pub fn clear_all_pools(&self) {
        self.pool.clear_all();
    }
}

/// `PRAGMA key` the handle and force a read to prove the key works.
fn apply_password(handle: &NativeHandle, password: &str) -> Result<()> {
    handle.exec(&format!("PRAGMA key = {};", quote_literal(password)))?;
    if command::query_all(handle, "PRAGMA cipher_version;")?.is_empty() {
        warn!("a password is configured but the engine has no encryption codec");
    }
    match handle.exec("SELECT COUNT(*) FROM sqlite_master;") {
        Err(err) if err.sqlite_code() == Some(SQLITE_NOTADB) => Err(Error::Decryption {
            code: err.extended_code().unwrap_or(SQLITE_NOTADB),
            message: err.to_string(),
        }),
        other => other,
    }
}

fn busy_timeout_millis(timeout: Duration) -> i32 {
    i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX)
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "failed to close connection on drop");
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("pool_key", &self.pool_key())
            .field("state", &self.state())
            .field("registrations", &self.registry.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn memory(pool: &Arc<SqlitePool>) -> Connection {
        Connection::with_pool("Data Source=:memory:", Arc::clone(pool) as Arc<dyn HandlePool>).unwrap()
    }

    #[test]
    fn starts_closed_and_open_is_idempotent() {
        let pool = Arc::new(SqlitePool::new());
        let mut conn = memory(&pool);
        assert_eq!(conn.state(), ConnectionState::Closed);
        conn.open().unwrap();
        conn.open().unwrap();
        assert_eq!(conn.state(), ConnectionState::Open);
        assert_eq!(pool.outstanding(&conn.pool_key()), 1);
        conn.close().unwrap();
        conn.close().unwrap();
        assert_eq!(pool.outstanding(&conn.pool_key()), 0);
        assert_eq!(pool.idle(&conn.pool_key()), 1);
    }

    #[test]
    fn state_changes_are_reported() {
        let pool = Arc::new(SqlitePool::new());
        let mut conn = memory(&pool);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        conn.on_state_change(move |change| sink.lock().unwrap().push(change));
        conn.open().unwrap();
        conn.open().unwrap();
        conn.close().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![StateChange::OPENED, StateChange::CLOSED]);
    }

    #[test]
    fn commands_require_an_open_connection() {
        let pool = Arc::new(SqlitePool::new());
        let conn = memory(&pool);
        assert!(matches!(conn.execute("SELECT 1"), Err(Error::Usage(_))));
        assert!(matches!(conn.prepare("SELECT 1"), Err(Error::Usage(_))));
        assert!(matches!(
            conn.begin_transaction(IsolationLevel::Serializable, None),
            Err(Error::Usage(_))
        ));
    }

    #[test]
    fn connection_string_is_fixed_while_open() {
        let pool = Arc::new(SqlitePool::new());
        let mut conn = memory(&pool);
        conn.open().unwrap();
        assert!(matches!(
            conn.set_connection_string("Data Source=other.db"),
            Err(Error::Usage(_))
        ));
        conn.close().unwrap();
        conn.set_connection_string("Data Source=other.db;Default Timeout=5").unwrap();
        assert_eq!(conn.data_source(), "other.db");
        assert_eq!(conn.default_timeout(), Duration::from_secs(5));
        assert!(Connection::with_pool("Bogus=1", pool as Arc<dyn HandlePool>).is_err());
    }

    #[test]
    fn registrations_apply_to_an_open_connection_immediately() {
        let pool = Arc::new(SqlitePool::new());
        let mut conn = memory(&pool);
        conn.open().unwrap();
        conn.create_function("add_n", Arity::Exact(1), 10_i64, true, Some(|n: &i64, args: &Arguments<'_>| {
            Ok(args.get_i64(0)? + *n)
        }))
        .unwrap();
        assert_eq!(conn.execute_scalar("SELECT add_n(5)").unwrap(), Value::Integer(15));
        conn.remove_function("ADD_N", Arity::Exact(1)).unwrap();
        assert!(conn.execute_scalar("SELECT add_n(5)").is_err());
    }

    #[test]
    fn foreign_keys_and_recursive_triggers_are_applied() {
        let pool = Arc::new(SqlitePool::new());
        let mut conn = Connection::with_pool(
            "Data Source=:memory:;Foreign Keys=True;Recursive Triggers=True",
            Arc::clone(&pool) as Arc<dyn HandlePool>,
        )
        .unwrap();
        conn.open().unwrap();
        assert_eq!(conn.execute_scalar("PRAGMA foreign_keys").unwrap(), Value::Integer(1));
        assert_eq!(conn.execute_scalar("PRAGMA recursive_triggers").unwrap(), Value::Integer(1));
    }

    #[test]
    fn transactions_commit_and_clear_the_slot() {
        let pool = Arc::new(SqlitePool::new());
        let mut conn = memory(&pool);
        conn.open().unwrap();
        conn.execute("CREATE TABLE t (x INTEGER)").unwrap();

        let txn = conn.begin_transaction(IsolationLevel::ReadCommitted, None).unwrap();
        assert_eq!(txn.isolation_level(), IsolationLevel::Serializable);
        assert!(!txn.is_deferred());
        assert!(conn.in_transaction());
        conn.execute("INSERT INTO t VALUES (1)").unwrap();
        txn.commit().unwrap();
        assert!(!conn.in_transaction());

        let txn = conn.begin_transaction(IsolationLevel::Unspecified, Some(true)).unwrap();
        conn.execute("INSERT INTO t VALUES (2)").unwrap();
        drop(txn);
        assert!(!conn.in_transaction());
        assert_eq!(conn.execute_scalar("SELECT COUNT(*) FROM t").unwrap(), Value::Integer(1));
    }

    #[test]
    fn savepoints_roll_back_partially() {
        let pool = Arc::new(SqlitePool::new());
        let mut conn = memory(&pool);
        conn.open().unwrap();
        conn.execute("CREATE TABLE t (x INTEGER)").unwrap();
        let mut txn = conn.begin_transaction(IsolationLevel::Serializable, None).unwrap();
        conn.execute("INSERT INTO t VALUES (1)").unwrap();
        txn.save("before_two").unwrap();
        conn.execute("INSERT INTO t VALUES (2)").unwrap();
        txn.rollback_to("before_two").unwrap();
        txn.release("before_two").unwrap();
        txn.commit().unwrap();
        assert_eq!(conn.query("SELECT x FROM t").unwrap(), vec![vec![Value::Integer(1)]]);
    }

    #[test]
    fn transaction_ended_by_sql_is_a_usage_error() {
        let pool = Arc::new(SqlitePool::new());
        let mut conn = memory(&pool);
        conn.open().unwrap();
        let txn = conn.begin_transaction(IsolationLevel::Serializable, None).unwrap();
        conn.execute("ROLLBACK").unwrap();
        assert!(matches!(txn.commit(), Err(Error::Usage(_))));
        assert!(!conn.in_transaction());
    }

    #[test]
    fn close_rolls_back_and_invalidates_the_transaction() {
        let pool = Arc::new(SqlitePool::new());
        let mut conn = memory(&pool);
        conn.open().unwrap();
        let txn = conn.begin_transaction(IsolationLevel::Serializable, None).unwrap();
        conn.close().unwrap();
        assert_eq!(pool.idle(&conn.pool_key()), 1);
        assert!(matches!(txn.rollback(), Err(Error::Usage(_))));
    }

    #[test]
    fn statements_are_disposed_by_close() {
        let pool = Arc::new(SqlitePool::new());
        let mut conn = memory(&pool);
        conn.open().unwrap();
        let mut stmt = conn.prepare("SELECT ?1 + 1").unwrap();
        stmt.bind(1, 41_i64).unwrap();
        assert_eq!(stmt.next_row().unwrap(), Some(vec![Value::Integer(42)]));
        assert_eq!(conn.open_statements(), 1);
        conn.close().unwrap();
        assert!(stmt.is_disposed());
        assert!(matches!(stmt.reset(), Err(Error::Usage(_))));
        assert_eq!(conn.open_statements(), 0);
    }

    #[test]
    fn drop_returns_the_handle() {
        let pool = Arc::new(SqlitePool::new());
        let key = {
            let mut conn = memory(&pool);
            conn.open().unwrap();
            conn.pool_key()
        };
        assert_eq!(pool.outstanding(&key), 0);
        assert_eq!(pool.idle(&key), 1);
    }

    #[test]
    fn extension_flag_survives_reopen() {
        let pool = Arc::new(SqlitePool::new());
        let mut conn = memory(&pool);
        conn.enable_extensions(true).unwrap();
        conn.open().unwrap();
        assert!(conn.extensions_enabled());
        conn.close().unwrap();
        conn.enable_extensions(false).unwrap();
        assert!(!conn.extensions_enabled());
    }

    #[test]
    fn password_without_codec_still_opens() {
        let pool = Arc::new(SqlitePool::new());
        let mut conn = Connection::with_pool(
            "Data Source=:memory:;Password='it''s'",
            Arc::clone(&pool) as Arc<dyn HandlePool>,
        )
        .unwrap();
        conn.open().unwrap();
        assert_eq!(conn.state(), ConnectionState::Open);
        let rendered = format!("{conn:?}");
        assert!(!rendered.contains("it's"), "{rendered}");
        assert!(rendered.contains("Password=***"), "{rendered}");
    }

    #[test]
    fn aggregate_seed_is_fresh_per_group() {
        let pool = Arc::new(SqlitePool::new());
        let mut conn = memory(&pool);
        let groups = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&groups);
        conn.create_aggregate_function(
            "concat_all",
            Arity::Exact(1),
            String::new(),
            true,
            Some(|mut acc: String, args: &Arguments<'_>| {
                acc.push_str(&args.get_text(0)?);
                Ok(acc)
            }),
            Some(move |acc: String| {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(acc)
            }),
        )
        .unwrap();
        conn.open().unwrap();
        conn.execute("CREATE TABLE t (g INTEGER, s TEXT); INSERT INTO t VALUES (1, 'a'), (1, 'b'), (2, 'c');")
            .unwrap();
        let rows = conn
            .query("SELECT g, concat_all(s) FROM t GROUP BY g ORDER BY g")
            .unwrap();
        assert_eq!(
            rows,
            vec![
                vec![Value::Integer(1), Value::from("ab")],
                vec![Value::Integer(2), Value::from("c")],
            ]
        );
        assert_eq!(groups.load(AtomicOrdering::SeqCst), 2);
    }
}
