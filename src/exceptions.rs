//! Failure type raised by user callbacks (scalar and aggregate functions).

use thiserror::Error;

use crate::errors::Error as NativeError;

/// A failure raised inside a user function.
///
/// The bridge reports `message` to the statement that invoked the function and,
/// when present, attaches `code` as the engine result code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CallbackError {
    message: String,
    code: Option<i32>,
}

impl CallbackError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// A failure that carries an engine result code (e.g. `SQLITE_CONSTRAINT`).
    pub fn with_code(message: impl Into<String>, code: i32) -> Self {
        Self {
            message: message.into(),
            code: Some(code),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn code(&self) -> Option<i32> {
        self.code
    }

    pub(crate) fn from_panic(what: &str, payload: Box<dyn std::any::Any + Send>) -> Self {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned());
        match detail {
            Some(detail) => Self::new(format!("{what} panicked: {detail}")),
            None => Self::new(format!("{what} panicked")),
        }
    }
}

impl From<String> for CallbackError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for CallbackError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

// Engine errors raised from inside a callback keep their code so the bridge
// can forward it.
impl From<NativeError> for CallbackError {
    fn from(err: NativeError) -> Self {
        match err {
            NativeError::Native {
                extended_code,
                message,
                ..
            } => Self::with_code(message, extended_code),
            other => {
                let code = other.extended_code();
                Self {
                    message: other.to_string(),
                    code,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_error_keeps_code() {
        let err = CallbackError::from(NativeError::from_code(libsqlite3_sys::SQLITE_CONSTRAINT_CHECK));
        assert_eq!(err.code(), Some(libsqlite3_sys::SQLITE_CONSTRAINT_CHECK));
    }

    #[test]
    fn usage_error_has_no_code() {
        let err = CallbackError::from(NativeError::usage("bad state"));
        assert_eq!(err.code(), None);
        assert_eq!(err.message(), "bad state");
        assert_eq!(err.to_string(), "bad state");
    }

    #[test]
    fn panic_payloads_are_described() {
        let err = CallbackError::from_panic("function 'f'", Box::new("boom"));
        assert_eq!(err.message(), "function 'f' panicked: boom");
        let err = CallbackError::from_panic("function 'f'", Box::new(42_u8));
        assert_eq!(err.message(), "function 'f' panicked");
    }
}
