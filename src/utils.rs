//! Miscellaneous internal helpers (paths, literals, C strings).

use std::ffi::{c_char, CStr, CString};

use crate::errors::{Error, Result};

/// Validate a data source path.
///
/// An empty path is allowed (the engine opens a private temporary database);
/// interior NUL bytes are not.
pub(crate) fn validate_path(path: &str) -> Result<()> {
    if path.contains('\0') {
        return Err(Error::invalid_argument(
            "Database path cannot contain null bytes",
        ));
    }
    Ok(())
}

/// Quote a string as an SQL text literal, doubling embedded single quotes.
///
/// PRAGMA statements cannot take bound parameters, so values spliced into
/// them go through here.
pub(crate) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Quote a name as an SQL identifier, doubling embedded double quotes.
pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Convert a Rust string into a `CString`, naming `what` in the error.
pub(crate) fn to_cstring(value: &str, what: &str) -> Result<CString> {
    CString::new(value)
        .map_err(|e| Error::invalid_argument(format!("{what} contains a null byte: {e}")))
}

/// Copy a NUL-terminated C string into an owned `String` (lossy UTF-8).
///
/// # Safety
///
/// `ptr` must be non-null and point to a NUL-terminated string that stays
/// valid for the duration of the call.
pub(crate) unsafe fn cstr_to_string(ptr: *const c_char) -> String {
    CStr::from_ptr(ptr).to_string_lossy().into_owned()
}

/// Parse the boolean spellings accepted in connection strings.
pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_path() {
        assert!(validate_path("").is_ok());
        assert!(validate_path(":memory:").is_ok());
        assert!(validate_path("file:db.sqlite?mode=ro").is_ok());
        assert!(validate_path("bad\0path").is_err());
    }

    #[test]
    fn test_quote_literal_escapes_quotes() {
        assert_eq!(quote_literal("secret"), "'secret'");
        assert_eq!(quote_literal("it's"), "'it''s'");
        assert_eq!(quote_literal("''"), "''''''");
        assert_eq!(quote_literal(""), "''");
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("sp1"), "\"sp1\"");
        assert_eq!(quote_identifier("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_to_cstring_rejects_nul() {
        assert!(to_cstring("name", "Function name").is_ok());
        let err = to_cstring("na\0me", "Function name").unwrap_err();
        assert!(err.to_string().starts_with("Function name contains a null byte"));
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("True"), Some(true));
        assert_eq!(parse_bool(" yes "), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("Off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
