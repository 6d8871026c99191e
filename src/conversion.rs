//! Conversion between native SQLite values and [`Value`].

use std::ffi::{c_char, c_int, c_void};
use std::slice;

use libsqlite3_sys::{
    sqlite3_bind_blob, sqlite3_bind_double, sqlite3_bind_int64, sqlite3_bind_null,
    sqlite3_bind_text, sqlite3_column_blob, sqlite3_column_bytes, sqlite3_column_double,
    sqlite3_column_int64, sqlite3_column_text, sqlite3_column_type, sqlite3_context,
    sqlite3_result_blob, sqlite3_result_double, sqlite3_result_int64, sqlite3_result_null,
    sqlite3_result_text, sqlite3_stmt, sqlite3_value, sqlite3_value_blob, sqlite3_value_bytes,
    sqlite3_value_double, sqlite3_value_int64, sqlite3_value_text, sqlite3_value_type,
    SQLITE_BLOB, SQLITE_FLOAT, SQLITE_INTEGER, SQLITE_NULL, SQLITE_TEXT, SQLITE_TRANSIENT,
};

use crate::exceptions::CallbackError;
use crate::types::Value;

/// Read-only view over the arguments of one function invocation.
pub struct Arguments<'a> {
    args: &'a [*mut sqlite3_value],
}

impl<'a> Arguments<'a> {
    /// # Safety
    ///
    /// `argv` must point to `argc` valid value pointers for the lifetime `'a`
    /// (the duration of the native callback).
    pub(crate) unsafe fn from_raw(argc: c_int, argv: *mut *mut sqlite3_value) -> Self {
        let args = if argc <= 0 || argv.is_null() {
            &[][..]
        } else {
            slice::from_raw_parts(argv, argc as usize)
        };
        Self { args }
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Decode argument `index` into an owned [`Value`].
    pub fn value(&self, index: usize) -> Result<Value, CallbackError> {
        let ptr = self.raw(index)?;
        // Safety: ptr comes from argv, valid for the duration of the callback.
        Ok(unsafe { value_from_native(ptr) })
    }

    /// All arguments, decoded.
    pub fn values(&self) -> Vec<Value> {
        self.args
            .iter()
            // Safety: see `value`.
            .map(|ptr| unsafe { value_from_native(*ptr) })
            .collect()
    }

    pub fn is_null(&self, index: usize) -> Result<bool, CallbackError> {
        let ptr = self.raw(index)?;
        // Safety: see `value`.
        Ok(unsafe { sqlite3_value_type(ptr) } == SQLITE_NULL)
    }

    pub fn get_i64(&self, index: usize) -> Result<i64, CallbackError> {
        let ptr = self.raw(index)?;
        // Safety: see `value`. The engine applies its usual numeric coercion.
        Ok(unsafe { sqlite3_value_int64(ptr) })
    }

    pub fn get_f64(&self, index: usize) -> Result<f64, CallbackError> {
        let ptr = self.raw(index)?;
        // Safety: see `value`.
        Ok(unsafe { sqlite3_value_double(ptr) })
    }

    pub fn get_text(&self, index: usize) -> Result<String, CallbackError> {
        let ptr = self.raw(index)?;
        // Safety: see `value`.
        Ok(unsafe { value_text(ptr) })
    }

    pub fn get_blob(&self, index: usize) -> Result<Vec<u8>, CallbackError> {
        let ptr = self.raw(index)?;
        // Safety: see `value`.
        Ok(unsafe { value_blob(ptr) })
    }

    fn raw(&self, index: usize) -> Result<*mut sqlite3_value, CallbackError> {
        self.args.get(index).copied().ok_or_else(|| {
            CallbackError::new(format!(
                "Argument index {index} is out of range ({} arguments)",
                self.args.len()
            ))
        })
    }
}

/// # Safety
///
/// `ptr` must be a valid `sqlite3_value*`.
pub(crate) unsafe fn value_from_native(ptr: *mut sqlite3_value) -> Value {
    match sqlite3_value_type(ptr) {
        SQLITE_INTEGER => Value::Integer(sqlite3_value_int64(ptr)),
        SQLITE_FLOAT => Value::Real(sqlite3_value_double(ptr)),
        SQLITE_TEXT => Value::Text(value_text(ptr)),
        SQLITE_BLOB => Value::Blob(value_blob(ptr)),
        _ => Value::Null,
    }
}

unsafe fn value_text(ptr: *mut sqlite3_value) -> String {
    // text must be fetched before bytes so the length refers to the UTF-8 form
    let text = sqlite3_value_text(ptr);
    let len = sqlite3_value_bytes(ptr);
    if text.is_null() || len <= 0 {
        return String::new();
    }
    String::from_utf8_lossy(slice::from_raw_parts(text, len as usize)).into_owned()
}

unsafe fn value_blob(ptr: *mut sqlite3_value) -> Vec<u8> {
    let blob = sqlite3_value_blob(ptr) as *const u8;
    let len = sqlite3_value_bytes(ptr);
    if blob.is_null() || len <= 0 {
        return Vec::new();
    }
    slice::from_raw_parts(blob, len as usize).to_vec()
}

/// Write `value` into the function result slot.
///
/// # Safety
///
/// `ctx` must be the context of the currently executing callback.
pub(crate) unsafe fn set_result(ctx: *mut sqlite3_context, value: &Value) -> Result<(), CallbackError> {
    match value {
        Value::Null => sqlite3_result_null(ctx),
        Value::Integer(v) => sqlite3_result_int64(ctx, *v),
        Value::Real(v) => sqlite3_result_double(ctx, *v),
        Value::Text(v) => {
            let len = c_len(v.len())?;
            sqlite3_result_text(ctx, v.as_ptr() as *const c_char, len, SQLITE_TRANSIENT());
        }
        Value::Blob(v) => {
            let len = c_len(v.len())?;
            sqlite3_result_blob(ctx, v.as_ptr() as *const c_void, len, SQLITE_TRANSIENT());
        }
    }
    Ok(())
}

/// Decode column `index` of the current row.
///
/// # Safety
///
/// `stmt` must be a valid statement positioned on a row.
pub(crate) unsafe fn column_value(stmt: *mut sqlite3_stmt, index: c_int) -> Value {
    match sqlite3_column_type(stmt, index) {
        SQLITE_INTEGER => Value::Integer(sqlite3_column_int64(stmt, index)),
        SQLITE_FLOAT => Value::Real(sqlite3_column_double(stmt, index)),
        SQLITE_TEXT => {
            let text = sqlite3_column_text(stmt, index);
            let len = sqlite3_column_bytes(stmt, index);
            if text.is_null() || len <= 0 {
                Value::Text(String::new())
            } else {
                Value::Text(
                    String::from_utf8_lossy(slice::from_raw_parts(text, len as usize)).into_owned(),
                )
            }
        }
        SQLITE_BLOB => {
            let blob = sqlite3_column_blob(stmt, index) as *const u8;
            let len = sqlite3_column_bytes(stmt, index);
            if blob.is_null() || len <= 0 {
                Value::Blob(Vec::new())
            } else {
                Value::Blob(slice::from_raw_parts(blob, len as usize).to_vec())
            }
        }
        _ => Value::Null,
    }
}

/// Bind `value` to the 1-based parameter `index`. Returns the native status.
///
/// # Safety
///
/// `stmt` must be a valid statement that is reset or not yet stepped.
pub(crate) unsafe fn bind_value(stmt: *mut sqlite3_stmt, index: c_int, value: &Value) -> c_int {
    match value {
        Value::Null => sqlite3_bind_null(stmt, index),
        Value::Integer(v) => sqlite3_bind_int64(stmt, index, *v),
        Value::Real(v) => sqlite3_bind_double(stmt, index, *v),
        Value::Text(v) => match c_len(v.len()) {
            Ok(len) => sqlite3_bind_text(
                stmt,
                index,
                v.as_ptr() as *const c_char,
                len,
                SQLITE_TRANSIENT(),
            ),
            Err(_) => libsqlite3_sys::SQLITE_TOOBIG,
        },
        Value::Blob(v) => match c_len(v.len()) {
            Ok(len) => sqlite3_bind_blob(
                stmt,
                index,
                v.as_ptr() as *const c_void,
                len,
                SQLITE_TRANSIENT(),
            ),
            Err(_) => libsqlite3_sys::SQLITE_TOOBIG,
        },
    }
}

fn c_len(len: usize) -> Result<c_int, CallbackError> {
    c_int::try_from(len).map_err(|_| {
        CallbackError::with_code(
            format!("Value of {len} bytes is too large"),
            libsqlite3_sys::SQLITE_TOOBIG,
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_arguments() {
        // Safety: a null argv with argc 0 is the zero-argument case.
        let args = unsafe { Arguments::from_raw(0, std::ptr::null_mut()) };
        assert!(args.is_empty());
        assert!(args.values().is_empty());
        let err = args.get_i64(0).unwrap_err();
        assert!(err.message().contains("out of range"));
    }

    #[test]
    fn c_len_rejects_oversized_values() {
        assert_eq!(c_len(5).unwrap(), 5);
        let err = c_len(usize::MAX).unwrap_err();
        assert_eq!(err.code(), Some(libsqlite3_sys::SQLITE_TOOBIG));
    }
}
