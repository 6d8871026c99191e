//! Thin command layer: prepared statements and the per-session statement arena.

use std::collections::HashMap;
use std::ffi::{c_char, c_int};
use std::ptr::{self, NonNull};
use std::sync::{Arc, Mutex};

use libsqlite3_sys::{
    sqlite3, sqlite3_bind_parameter_count, sqlite3_changes, sqlite3_clear_bindings,
    sqlite3_column_count, sqlite3_finalize, sqlite3_prepare_v2, sqlite3_reset, sqlite3_step,
    sqlite3_stmt, sqlite3_stmt_readonly, SQLITE_DONE, SQLITE_OK, SQLITE_ROW,
};
use tracing::debug;

use crate::connection::{lock_core, SessionCore};
use crate::conversion::{bind_value, column_value};
use crate::errors::{native_error, Error, Result};
use crate::native::NativeHandle;
use crate::types::Value;

/// An owned `sqlite3_stmt*`, finalized on drop.
pub(crate) struct RawStatement {
    stmt: NonNull<sqlite3_stmt>,
    db: *mut sqlite3,
}

// Safety: a statement is only used through its session, which is never used
// from two threads at once; the pointer itself may move between threads.
unsafe impl Send for RawStatement {}

impl RawStatement {
    /// Prepare the first statement of `sql[offset..]`.
    ///
    /// Returns the statement (or `None` for whitespace/comments only) and the
    /// offset just past it.
    fn prepare_at(db: *mut sqlite3, sql: &str, offset: usize) -> Result<(Option<Self>, usize)> {
        let rest = &sql[offset..];
        let len = c_int::try_from(rest.len())
            .map_err(|_| Error::invalid_argument("SQL text is too long"))?;
        let start = rest.as_ptr() as *const c_char;
        let mut stmt: *mut sqlite3_stmt = ptr::null_mut();
        let mut tail: *const c_char = ptr::null();
        // Safety: db is open; the text pointer and length describe `rest`
        // (nByte makes a NUL terminator unnecessary); tail points into `rest`.
        let rc = unsafe { sqlite3_prepare_v2(db, start, len, &mut stmt, &mut tail) };
        if rc != SQLITE_OK {
            return Err(native_error(db, rc));
        }
        let consumed = if tail.is_null() {
            rest.len()
        } else {
            // Safety: tail is derived from start within the same allocation.
            unsafe { tail.offset_from(start) as usize }
        };
        let statement = NonNull::new(stmt).map(|stmt| Self { stmt, db });
        Ok((statement, offset + consumed))
    }

    /// Prepare exactly one statement.
    pub(crate) fn prepare(handle: &NativeHandle, sql: &str) -> Result<Self> {
        let (statement, end) = Self::prepare_at(handle.as_ptr(), sql, 0)?;
        let statement =
            statement.ok_or_else(|| Error::invalid_argument("SQL text contains no statement"))?;
        if !sql[end..].trim().trim_end_matches(';').trim().is_empty() {
            return Err(Error::invalid_argument(
                "SQL text contains more than one statement",
            ));
        }
        Ok(statement)
    }

    pub(crate) fn parameter_count(&self) -> usize {
        // Safety: stmt is a live statement.
        unsafe { sqlite3_bind_parameter_count(self.stmt.as_ptr()) as usize }
    }

    /// Bind `value` to the 1-based parameter `index`.
    pub(crate) fn bind(&mut self, index: usize, value: &Value) -> Result<()> {
        let count = self.parameter_count();
        if index == 0 || index > count {
            return Err(Error::invalid_argument(format!(
                "Parameter index {index} is out of range (statement has {count})"
            )));
        }
        // Safety: stmt is live; index was range-checked above.
        let rc = unsafe { bind_value(self.stmt.as_ptr(), index as c_int, value) };
        if rc == SQLITE_OK {
            Ok(())
        } else {
            Err(native_error(self.db, rc))
        }
    }

    /// Advance to the next row; `None` once the statement is done.
    pub(crate) fn next_row(&mut self) -> Result<Option<Vec<Value>>> {
        // Safety: stmt is live; column reads happen only while positioned on a row.
        unsafe {
            match sqlite3_step(self.stmt.as_ptr()) {
                SQLITE_ROW => {
                    let count = sqlite3_column_count(self.stmt.as_ptr());
                    let row = (0..count)
                        .map(|i| column_value(self.stmt.as_ptr(), i))
                        .collect();
                    Ok(Some(row))
                }
                SQLITE_DONE => Ok(None),
                rc => {
                    let err = native_error(self.db, rc);
                    sqlite3_reset(self.stmt.as_ptr());
                    Err(err)
                }
            }
        }
    }

    pub(crate) fn reset(&mut self) {
        // Safety: stmt is live. The status repeats the last step error, which
        // was already reported.
        unsafe {
            sqlite3_reset(self.stmt.as_ptr());
            sqlite3_clear_bindings(self.stmt.as_ptr());
        }
    }

    fn is_readonly(&self) -> bool {
        // Safety: stmt is live.
        unsafe { sqlite3_stmt_readonly(self.stmt.as_ptr()) != 0 }
    }

    fn changes(&self) -> usize {
        // Safety: db is open.
        unsafe { sqlite3_changes(self.db).max(0) as usize }
    }
}

impl Drop for RawStatement {
    fn drop(&mut self) {
        // Safety: the statement is exclusively owned and finalized once.
        unsafe {
            sqlite3_finalize(self.stmt.as_ptr());
        }
    }
}

/// Run every statement in `sql`, returning the rows changed by writes.
pub(crate) fn execute(handle: &NativeHandle, sql: &str) -> Result<usize> {
    let mut offset = 0;
    let mut changed = 0;
    while offset < sql.len() {
        let (statement, next) = RawStatement::prepare_at(handle.as_ptr(), sql, offset)?;
        offset = next;
        let Some(mut statement) = statement else {
            break;
        };
        while statement.next_row()?.is_some() {}
        if !statement.is_readonly() {
            changed += statement.changes();
        }
    }
    Ok(changed)
}

/// First column of the first row of `sql`, or `Value::Null` when there is none.
pub(crate) fn query_scalar(handle: &NativeHandle, sql: &str) -> Result<Value> {
    let mut statement = RawStatement::prepare(handle, sql)?;
    Ok(statement
        .next_row()?
        .and_then(|row| row.into_iter().next())
        .unwrap_or(Value::Null))
}

/// Every row of `sql`.
pub(crate) fn query_all(handle: &NativeHandle, sql: &str) -> Result<Vec<Vec<Value>>> {
    let mut statement = RawStatement::prepare(handle, sql)?;
    let mut rows = Vec::new();
    while let Some(row) = statement.next_row()? {
        rows.push(row);
    }
    Ok(rows)
}

/// Live statements of one session, keyed by id.
///
/// Statements unregister themselves on dispose; `dispose_all` finalizes
/// whatever is left when the session closes.
#[derive(Default)]
pub(crate) struct StatementArena {
    next_id: u64,
    live: HashMap<u64, RawStatement>,
}

impl StatementArena {
    pub(crate) fn insert(&mut self, statement: RawStatement) -> u64 {
        self.next_id += 1;
        self.live.insert(self.next_id, statement);
        self.next_id
    }

    fn get_mut(&mut self, id: u64) -> Option<&mut RawStatement> {
        self.live.get_mut(&id)
    }

    fn remove(&mut self, id: u64) -> Option<RawStatement> {
        self.live.remove(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.live.len()
    }

    /// Finalize every live statement; returns how many were disposed.
    pub(crate) fn dispose_all(&mut self) -> usize {
        let count = self.live.len();
        self.live.clear();
        if count > 0 {
            debug!(count, "disposed dependent statements");
        }
        count
    }
}

/// A prepared statement that depends on an open [`Connection`](crate::Connection).
///
/// Closing the connection disposes the statement; any later use fails with
/// [`Error::Usage`].
pub struct Statement {
    core: Arc<Mutex<SessionCore>>,
    id: u64,
    sql: String,
}

impl Statement {
    /// Track `statement` in the locked `core`'s arena; `shared` is that same core.
    pub(crate) fn register(
        shared: &Arc<Mutex<SessionCore>>,
        core: &mut SessionCore,
        statement: RawStatement,
        sql: &str,
    ) -> Self {
        let id = core.statements.insert(statement);
        Self {
            core: Arc::clone(shared),
            id,
            sql: sql.to_string(),
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Whether the statement was disposed (explicitly or by closing its connection).
    pub fn is_disposed(&self) -> bool {
        lock_core(&self.core).statements.get_mut(self.id).is_none()
    }

    /// Bind `value` to the 1-based parameter `index`.
    pub fn bind(&mut self, index: usize, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.with_statement(|statement| statement.bind(index, &value))
    }

    /// Step to the next row; `None` once the statement is done.
    pub fn next_row(&mut self) -> Result<Option<Vec<Value>>> {
        self.with_statement(RawStatement::next_row)
    }

    /// Rewind the statement and clear its bindings.
    pub fn reset(&mut self) -> Result<()> {
        self.with_statement(|statement| {
            statement.reset();
            Ok(())
        })
    }

    /// Finalize the statement now instead of on drop.
    pub fn dispose(self) {
        drop(self);
    }

    fn with_statement<T>(&mut self, f: impl FnOnce(&mut RawStatement) -> Result<T>) -> Result<T> {
        let mut core = lock_core(&self.core);
        let statement = core.statements.get_mut(self.id).ok_or_else(|| {
            Error::usage("Statement has been disposed or its connection was closed")
        })?;
        f(statement)
    }
}

impl Drop for Statement {
    fn drop(&mut self) {
        let removed = lock_core(&self.core).statements.remove(self.id);
        drop(removed);
    }
}

impl std::fmt::Debug for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statement")
            .field("id", &self.id)
            .field("sql", &self.sql)
            .finish()
    }
}
