//! Error taxonomy and native status mapping.

use std::ffi::CStr;

use libsqlite3_sys::{sqlite3, sqlite3_errmsg, sqlite3_errstr, sqlite3_extended_errcode};
use thiserror::Error;

use crate::utils::cstr_to_string;

/// Errors surfaced by sessions, statements, transactions and pools.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid state transition or misuse of the API (never retried).
    #[error("{0}")]
    Usage(String),

    /// Non-success status returned by the engine.
    #[error("SQLite Error {code}: '{message}'")]
    Native {
        /// Primary result code (`extended_code & 0xff`).
        code: i32,
        extended_code: i32,
        message: String,
    },

    /// The configured password did not decrypt the database.
    #[error("Failed to decrypt database with the configured password: {message}")]
    Decryption { code: i32, message: String },

    /// Undoing session registrations on a pooled handle failed; the handle
    /// was discarded instead of being returned to the pool.
    #[error("Failed to deactivate pooled handle: {source}")]
    Deactivation {
        #[source]
        source: Box<Error>,
    },

    #[error("{0}")]
    InvalidArgument(String),

    /// No pooled handle became available within the default timeout.
    #[error("Failed to borrow a pooled handle: {source}")]
    Pool {
        #[source]
        source: r2d2::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn usage(msg: impl Into<String>) -> Self {
        Error::Usage(msg.into())
    }

    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Build a `Native` error from a bare result code (no handle available).
    pub(crate) fn from_code(rc: i32) -> Self {
        Error::Native {
            code: rc & 0xff,
            extended_code: rc,
            message: errstr(rc),
        }
    }

    /// The engine result code carried by this error, if any.
    pub fn sqlite_code(&self) -> Option<i32> {
        match self {
            Error::Native { code, .. } | Error::Decryption { code, .. } => Some(*code),
            Error::Deactivation { source } => source.sqlite_code(),
            _ => None,
        }
    }

    /// The extended engine result code carried by this error, if any.
    pub fn extended_code(&self) -> Option<i32> {
        match self {
            Error::Native { extended_code, .. } => Some(*extended_code),
            Error::Decryption { code, .. } => Some(*code),
            Error::Deactivation { source } => source.extended_code(),
            _ => None,
        }
    }
}

/// Map a non-success status to an `Error`, reading the message from `db`.
///
/// The handle message is only trusted when the handle's own extended code
/// matches `rc`; otherwise the generic description for `rc` is used (e.g. a
/// `sqlite3_backup_step` failure reported through another handle).
pub(crate) fn native_error(db: *mut sqlite3, rc: i32) -> Error {
    if db.is_null() {
        return Error::from_code(rc);
    }
    // Safety: db is a live handle owned by the caller; errcode/errmsg only read
    // the handle's last-error slot.
    let (extended_code, message) = unsafe {
        let extended = sqlite3_extended_errcode(db);
        let msg = sqlite3_errmsg(db);
        let message = if msg.is_null() || (extended & 0xff) != (rc & 0xff) {
            errstr(rc)
        } else {
            cstr_to_string(msg)
        };
        let extended_code = if (extended & 0xff) == (rc & 0xff) {
            extended
        } else {
            rc
        };
        (extended_code, message)
    };
    Error::Native {
        code: rc & 0xff,
        extended_code,
        message,
    }
}

/// Convert `rc` into `Ok(())` or a mapped native error.
pub(crate) fn check(db: *mut sqlite3, rc: i32) -> Result<()> {
    if rc == libsqlite3_sys::SQLITE_OK {
        Ok(())
    } else {
        Err(native_error(db, rc))
    }
}

fn errstr(rc: i32) -> String {
    // Safety: sqlite3_errstr returns a pointer to a static string.
    unsafe {
        let ptr = sqlite3_errstr(rc);
        if ptr.is_null() {
            format!("SQLite error code {rc}")
        } else {
            CStr::from_ptr(ptr).to_string_lossy().into_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libsqlite3_sys::{SQLITE_BUSY, SQLITE_CONSTRAINT_UNIQUE};

    #[test]
    fn from_code_splits_primary_and_extended() {
        let err = Error::from_code(SQLITE_CONSTRAINT_UNIQUE);
        assert_eq!(err.sqlite_code(), Some(libsqlite3_sys::SQLITE_CONSTRAINT));
        assert_eq!(err.extended_code(), Some(SQLITE_CONSTRAINT_UNIQUE));
    }

    #[test]
    fn native_error_without_handle_uses_errstr() {
        let err = native_error(std::ptr::null_mut(), SQLITE_BUSY);
        match err {
            Error::Native { code, message, .. } => {
                assert_eq!(code, SQLITE_BUSY);
                assert!(message.contains("locked"), "{message}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn deactivation_exposes_inner_code() {
        let err = Error::Deactivation {
            source: Box::new(Error::from_code(SQLITE_BUSY)),
        };
        assert_eq!(err.sqlite_code(), Some(SQLITE_BUSY));
        assert!(err.to_string().starts_with("Failed to deactivate"));
    }

    #[test]
    fn usage_has_no_code() {
        assert_eq!(Error::usage("nope").sqlite_code(), None);
    }
}
