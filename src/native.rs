//! Owned native database handle and process-wide engine initialization.
//!
//! Every session borrows a `NativeHandle` from a pool for the duration of its
//! open state. The handle itself knows nothing about sessions; it exposes the
//! handle-scoped engine calls the session, registry and pool are built on.
//! Registration calls (collations, functions) live next to their trampolines
//! in [`crate::callbacks`].

use std::ffi::{c_char, c_void};
use std::ptr::{self, NonNull};
use std::sync::OnceLock;

use libsqlite3_sys::{
    sqlite3, sqlite3_backup_finish, sqlite3_backup_init, sqlite3_backup_step,
    sqlite3_busy_timeout, sqlite3_close, sqlite3_db_filename, sqlite3_enable_load_extension,
    sqlite3_errcode, sqlite3_exec, sqlite3_extended_result_codes, sqlite3_free,
    sqlite3_get_autocommit, sqlite3_initialize, sqlite3_libversion, sqlite3_load_extension,
    sqlite3_next_stmt, sqlite3_open_v2, SQLITE_BUSY, SQLITE_DONE, SQLITE_NOMEM, SQLITE_OK,
};
use tracing::{debug, warn};

use crate::config::ConnectionOptions;
use crate::errors::{check, native_error, Error, Result};
use crate::utils::{cstr_to_string, to_cstring};

static ENGINE_INIT: OnceLock<i32> = OnceLock::new();

/// Initialize the engine once per process.
///
/// Idempotent and lazy: the pool calls it before opening the first handle.
/// There is no matching teardown; all sessions share the initialized engine
/// for the lifetime of the process.
pub fn initialize() -> Result<()> {
    // Safety: sqlite3_initialize is itself idempotent and thread-safe.
    let rc = *ENGINE_INIT.get_or_init(|| unsafe { sqlite3_initialize() });
    if rc == SQLITE_OK {
        Ok(())
    } else {
        Err(Error::from_code(rc))
    }
}

/// Version string of the linked engine, e.g. `"3.46.0"`.
pub fn library_version() -> String {
    // Safety: sqlite3_libversion returns a static string.
    unsafe { cstr_to_string(sqlite3_libversion()) }
}

/// An open `sqlite3*`. Closed on drop.
#[derive(Debug)]
pub struct NativeHandle {
    db: NonNull<sqlite3>,
}

// Safety: the engine is built in serialized threading mode and a handle is only
// ever used by one session at a time; moving it between threads is sound.
unsafe impl Send for NativeHandle {}

impl NativeHandle {
    /// Open a new handle for `options`.
    pub(crate) fn open(options: &ConnectionOptions) -> Result<Self> {
        initialize()?;
        let path = to_cstring(&options.data_source, "Data source")?;
        let mut db: *mut sqlite3 = ptr::null_mut();
        // Safety: path is a valid C string, db is an out-parameter.
        let rc = unsafe { sqlite3_open_v2(path.as_ptr(), &mut db, options.open_flags(), ptr::null()) };
        if rc != SQLITE_OK {
            let err = native_error(db, rc);
            if !db.is_null() {
                // Safety: open_v2 hands back a handle even on failure; it must be
                // closed and has no statements yet.
                unsafe {
                    sqlite3_close(db);
                }
            }
            return Err(err);
        }
        let db = NonNull::new(db).ok_or_else(|| Error::from_code(SQLITE_NOMEM))?;
        // Safety: db was just opened successfully.
        unsafe {
            sqlite3_extended_result_codes(db.as_ptr(), 1);
        }
        debug!(data_source = %options.data_source, "opened native handle");
        Ok(Self { db })
    }

    pub(crate) fn as_ptr(&self) -> *mut sqlite3 {
        self.db.as_ptr()
    }

    /// Run one or more SQL statements, discarding any rows.
    pub(crate) fn exec(&self, sql: &str) -> Result<()> {
        let sql_c = to_cstring(sql, "SQL")?;
        // Safety: handle is open, sql_c is a valid C string; no callback is used
        // and the error message is read from the handle instead of the out-param.
        let rc = unsafe { sqlite3_exec(self.as_ptr(), sql_c.as_ptr(), None, ptr::null_mut(), ptr::null_mut()) };
        check(self.as_ptr(), rc)
    }

    pub(crate) fn set_busy_timeout(&self, millis: i32) -> Result<()> {
        // Safety: handle is open.
        let rc = unsafe { sqlite3_busy_timeout(self.as_ptr(), millis) };
        check(self.as_ptr(), rc)
    }

    pub(crate) fn enable_load_extension(&self, enabled: bool) -> Result<()> {
        // Safety: handle is open; only toggles the handle's extension flag.
        let rc = unsafe { sqlite3_enable_load_extension(self.as_ptr(), i32::from(enabled)) };
        check(self.as_ptr(), rc)
    }

    /// Load an extension library. Loading must already be enabled.
    pub(crate) fn load_extension(&self, file: &str, entry_point: Option<&str>) -> Result<()> {
        let file_c = to_cstring(file, "Extension file")?;
        let entry_c = entry_point
            .map(|proc| to_cstring(proc, "Extension entry point"))
            .transpose()?;
        let mut errmsg: *mut c_char = ptr::null_mut();
        // Safety: handle is open, both strings are valid C strings (or null for
        // the default entry point), errmsg is freed below with sqlite3_free.
        let rc = unsafe {
            sqlite3_load_extension(
                self.as_ptr(),
                file_c.as_ptr(),
                entry_c.as_ref().map_or(ptr::null(), |p| p.as_ptr()),
                &mut errmsg,
            )
        };
        if rc == SQLITE_OK {
            return Ok(());
        }
        let detail = if errmsg.is_null() {
            native_error(self.as_ptr(), rc).to_string()
        } else {
            // Safety: errmsg was allocated by the engine; copy then free it.
            unsafe {
                let msg = cstr_to_string(errmsg);
                sqlite3_free(errmsg as *mut c_void);
                msg
            }
        };
        Err(Error::Native {
            code: rc & 0xff,
            extended_code: rc,
            message: format!("Failed to load extension '{file}': {detail}"),
        })
    }

    /// Whether any prepared statement is still alive on this handle.
    pub(crate) fn has_open_statements(&self) -> bool {
        // Safety: handle is open; next_stmt only walks the statement list.
        unsafe { !sqlite3_next_stmt(self.as_ptr(), ptr::null_mut()).is_null() }
    }

    /// `false` while an explicit transaction is open on the handle.
    pub(crate) fn is_autocommit(&self) -> bool {
        // Safety: handle is open.
        unsafe { sqlite3_get_autocommit(self.as_ptr()) != 0 }
    }

    /// File backing database `db_name`; `None` for in-memory and temporary databases.
    pub(crate) fn filename(&self, db_name: &str) -> Option<String> {
        let name = to_cstring(db_name, "Database name").ok()?;
        // Safety: handle is open; the returned string lives as long as the attachment.
        unsafe {
            let ptr = sqlite3_db_filename(self.as_ptr(), name.as_ptr());
            if ptr.is_null() {
                return None;
            }
            let filename = cstr_to_string(ptr);
            (!filename.is_empty()).then_some(filename)
        }
    }

    /// Copy database `src_name` of this handle into `dest_name` of `dest` in a
    /// single backup step covering every page.
    pub(crate) fn backup_to(&self, dest: &NativeHandle, dest_name: &str, src_name: &str) -> Result<()> {
        let dest_c = to_cstring(dest_name, "Destination database name")?;
        let src_c = to_cstring(src_name, "Source database name")?;
        // Safety: both handles are open and distinct; names are valid C strings.
        let backup = unsafe {
            sqlite3_backup_init(dest.as_ptr(), dest_c.as_ptr(), self.as_ptr(), src_c.as_ptr())
        };
        if backup.is_null() {
            // Safety: errcode only reads the destination's last error.
            let rc = unsafe { sqlite3_errcode(dest.as_ptr()) };
            return Err(native_error(dest.as_ptr(), rc));
        }
        // Safety: backup is valid until finish, which is always called.
        let (step_rc, finish_rc) = unsafe {
            let step_rc = sqlite3_backup_step(backup, -1);
            (step_rc, sqlite3_backup_finish(backup))
        };
        if step_rc != SQLITE_DONE && step_rc != SQLITE_OK {
            return Err(native_error(dest.as_ptr(), step_rc));
        }
        check(dest.as_ptr(), finish_rc)
    }
}

impl Drop for NativeHandle {
    fn drop(&mut self) {
        // Safety: the handle is exclusively owned and closed once. Sessions
        // finalize their statements before a handle can be dropped.
        let rc = unsafe { sqlite3_close(self.as_ptr()) };
        match rc {
            SQLITE_OK => {}
            SQLITE_BUSY => warn!("native handle still has unfinalized statements; it stays open"),
            rc => warn!(rc, "failed to close native handle"),
        }
    }
}
