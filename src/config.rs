//! Connection string parsing (`key=value;` pairs).

use std::fmt;
use std::time::Duration;

use libsqlite3_sys::{
    SQLITE_OPEN_CREATE, SQLITE_OPEN_MEMORY, SQLITE_OPEN_PRIVATECACHE, SQLITE_OPEN_READONLY,
    SQLITE_OPEN_READWRITE, SQLITE_OPEN_SHAREDCACHE, SQLITE_OPEN_URI,
};

use crate::errors::{Error, Result};
use crate::utils::{parse_bool, validate_path};

/// How the database file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenMode {
    #[default]
    ReadWriteCreate,
    ReadWrite,
    ReadOnly,
    Memory,
}

/// Page cache sharing between handles opened on the same file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    #[default]
    Default,
    Private,
    Shared,
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OpenMode::ReadWriteCreate => "ReadWriteCreate",
            OpenMode::ReadWrite => "ReadWrite",
            OpenMode::ReadOnly => "ReadOnly",
            OpenMode::Memory => "Memory",
        })
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CacheMode::Default => "Default",
            CacheMode::Private => "Private",
            CacheMode::Shared => "Shared",
        })
    }
}

pub const DEFAULT_TIMEOUT_SECS: u32 = 30;

pub const DEFAULT_MAX_POOL_SIZE: u32 = 100;

/// Identity of a pool group: the canonical connection string.
///
/// Keys compare by the full string, password included, but display and debug
/// output mask the password so keys can be logged.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    canonical: String,
    redacted: String,
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted)
    }
}

impl fmt::Debug for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PoolKey").field(&self.redacted).finish()
    }
}

/// Parsed connection settings. The canonical connection string doubles as the
/// pool-group key.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub data_source: String,
    pub mode: OpenMode,
    pub cache: CacheMode,
    pub password: Option<String>,
    /// `None` leaves the engine default untouched.
    pub foreign_keys: Option<bool>,
    pub recursive_triggers: bool,
    pub default_timeout_secs: u32,
    pub pooling: bool,
    /// Most handles one pool group lends out at a time.
    pub max_pool_size: u32,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            data_source: String::new(),
            mode: OpenMode::default(),
            cache: CacheMode::default(),
            password: None,
            foreign_keys: None,
            recursive_triggers: false,
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
            pooling: true,
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
        }
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("data_source", &self.data_source)
            .field("mode", &self.mode)
            .field("cache", &self.cache)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("foreign_keys", &self.foreign_keys)
            .field("recursive_triggers", &self.recursive_triggers)
            .field("default_timeout_secs", &self.default_timeout_secs)
            .field("pooling", &self.pooling)
            .field("max_pool_size", &self.max_pool_size)
            .finish()
    }
}

impl ConnectionOptions {
    /// Options for a data source with every other setting at its default.
    pub fn new(data_source: impl Into<String>) -> Self {
        Self {
            data_source: data_source.into(),
            ..Self::default()
        }
    }

    /// Parse a connection string such as
    /// `Data Source=app.db;Foreign Keys=True;Default Timeout=5`.
    ///
    /// Keys are case-insensitive; values may be wrapped in `'` or `"` so they
    /// can contain `;`.
    pub fn parse(connection_string: &str) -> Result<Self> {
        let mut options = Self::default();
        for (key, value) in split_pairs(connection_string)? {
            let normalized = key.to_ascii_lowercase().replace(' ', "");
            match normalized.as_str() {
                "datasource" | "filename" => options.data_source = value,
                "mode" => {
                    options.mode = match value.to_ascii_lowercase().as_str() {
                        "readwritecreate" => OpenMode::ReadWriteCreate,
                        "readwrite" => OpenMode::ReadWrite,
                        "readonly" => OpenMode::ReadOnly,
                        "memory" => OpenMode::Memory,
                        _ => return Err(invalid_value(&key, &value)),
                    }
                }
                "cache" => {
                    options.cache = match value.to_ascii_lowercase().as_str() {
                        "default" => CacheMode::Default,
                        "private" => CacheMode::Private,
                        "shared" => CacheMode::Shared,
                        _ => return Err(invalid_value(&key, &value)),
                    }
                }
                "password" => {
                    options.password = if value.is_empty() { None } else { Some(value) }
                }
                "foreignkeys" => {
                    options.foreign_keys = if value.is_empty() {
                        None
                    } else {
                        Some(parse_bool(&value).ok_or_else(|| invalid_value(&key, &value))?)
                    }
                }
                "recursivetriggers" => {
                    options.recursive_triggers =
                        parse_bool(&value).ok_or_else(|| invalid_value(&key, &value))?
                }
                "defaulttimeout" | "commandtimeout" => {
                    options.default_timeout_secs = value
                        .parse()
                        .map_err(|_| invalid_value(&key, &value))?
                }
                "pooling" => {
                    options.pooling = parse_bool(&value).ok_or_else(|| invalid_value(&key, &value))?
                }
                "maxpoolsize" => {
                    options.max_pool_size = value
                        .parse()
                        .ok()
                        .filter(|size| *size > 0)
                        .ok_or_else(|| invalid_value(&key, &value))?
                }
                _ => {
                    return Err(Error::invalid_argument(format!(
                        "Connection string keyword '{key}' is not supported"
                    )))
                }
            }
        }
        validate_path(&options.data_source)?;
        Ok(options)
    }

    /// Canonical connection string; equal options render identically.
    ///
    /// The password is included in clear text; use [`pool_key`](Self::pool_key)
    /// for anything that may be logged.
    pub fn to_connection_string(&self) -> String {
        self.render(false)
    }

    /// Key of the pool group handles for these options belong to.
    pub fn pool_key(&self) -> PoolKey {
        PoolKey {
            canonical: self.render(false),
            redacted: self.render(true),
        }
    }

    fn render(&self, redact_password: bool) -> String {
        let mut parts = vec![format!("Data Source={}", quote_value(&self.data_source))];
        if self.mode != OpenMode::default() {
            parts.push(format!("Mode={}", self.mode));
        }
        if self.cache != CacheMode::default() {
            parts.push(format!("Cache={}", self.cache));
        }
        if let Some(password) = &self.password {
            if redact_password {
                parts.push("Password=***".to_string());
            } else {
                parts.push(format!("Password={}", quote_value(password)));
            }
        }
        if let Some(fk) = self.foreign_keys {
            parts.push(format!("Foreign Keys={}", bool_str(fk)));
        }
        if self.recursive_triggers {
            parts.push("Recursive Triggers=True".to_string());
        }
        if self.default_timeout_secs != DEFAULT_TIMEOUT_SECS {
            parts.push(format!("Default Timeout={}", self.default_timeout_secs));
        }
        if !self.pooling {
            parts.push("Pooling=False".to_string());
        }
        if self.max_pool_size != DEFAULT_MAX_POOL_SIZE {
            parts.push(format!("Max Pool Size={}", self.max_pool_size));
        }
        parts.join(";")
    }

    /// Flags passed to `sqlite3_open_v2`.
    pub(crate) fn open_flags(&self) -> i32 {
        let mut flags = SQLITE_OPEN_URI;
        flags |= match self.mode {
            OpenMode::ReadWriteCreate => SQLITE_OPEN_READWRITE | SQLITE_OPEN_CREATE,
            OpenMode::ReadWrite => SQLITE_OPEN_READWRITE,
            OpenMode::ReadOnly => SQLITE_OPEN_READONLY,
            OpenMode::Memory => SQLITE_OPEN_READWRITE | SQLITE_OPEN_CREATE | SQLITE_OPEN_MEMORY,
        };
        flags |= match self.cache {
            CacheMode::Default => 0,
            CacheMode::Private => SQLITE_OPEN_PRIVATECACHE,
            CacheMode::Shared => SQLITE_OPEN_SHAREDCACHE,
        };
        flags
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.default_timeout_secs))
    }
}

fn split_pairs(input: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    let mut chars = input.chars().peekable();
    loop {
        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c == ';' {
                break;
            }
            key.push(c);
            chars.next();
        }
        let key = key.trim().to_string();
        match chars.next() {
            None => {
                if !key.is_empty() {
                    return Err(Error::invalid_argument(format!(
                        "Connection string keyword '{key}' has no value"
                    )));
                }
                break;
            }
            Some(';') => {
                if !key.is_empty() {
                    return Err(Error::invalid_argument(format!(
                        "Connection string keyword '{key}' has no value"
                    )));
                }
                continue;
            }
            Some(_) => {}
        }

        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        let mut value = String::new();
        match chars.peek().copied() {
            Some(quote @ ('\'' | '"')) => {
                chars.next();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    if c == quote {
                        // A doubled quote is an escaped quote character.
                        if chars.peek() == Some(&quote) {
                            chars.next();
                            value.push(quote);
                            continue;
                        }
                        closed = true;
                        break;
                    }
                    value.push(c);
                }
                if !closed {
                    return Err(Error::invalid_argument(format!(
                        "Unterminated quoted value for connection string keyword '{key}'"
                    )));
                }
                while let Some(c) = chars.next() {
                    if c == ';' {
                        break;
                    }
                    if !c.is_whitespace() {
                        return Err(Error::invalid_argument(format!(
                            "Unexpected text after quoted value for '{key}'"
                        )));
                    }
                }
            }
            _ => {
                for c in chars.by_ref() {
                    if c == ';' {
                        break;
                    }
                    value.push(c);
                }
                value = value.trim().to_string();
            }
        }
        if key.is_empty() {
            return Err(Error::invalid_argument(
                "Connection string contains a value without a keyword",
            ));
        }
        pairs.push((key, value));
    }
    Ok(pairs)
}

fn quote_value(value: &str) -> String {
    if value.contains([';', '\'', '"']) || value.trim() != value {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

fn invalid_value(key: &str, value: &str) -> Error {
    Error::invalid_argument(format!(
        "Invalid value '{value}' for connection string keyword '{key}'"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let options = ConnectionOptions::parse("Data Source=app.db").unwrap();
        assert_eq!(options.data_source, "app.db");
        assert_eq!(options.mode, OpenMode::ReadWriteCreate);
        assert_eq!(options.default_timeout_secs, DEFAULT_TIMEOUT_SECS);
        assert!(options.pooling);
        assert!(options.foreign_keys.is_none());
    }

    #[test]
    fn test_parse_all_keywords() {
        let options = ConnectionOptions::parse(
            "filename=:memory:; mode=Memory; CACHE=shared; Password='p;w''d'; \
             Foreign Keys=true; Recursive Triggers=1; Command Timeout=5; Pooling=False; \
             Max Pool Size=4",
        )
        .unwrap();
        assert_eq!(options.data_source, ":memory:");
        assert_eq!(options.mode, OpenMode::Memory);
        assert_eq!(options.cache, CacheMode::Shared);
        assert_eq!(options.password.as_deref(), Some("p;w'd"));
        assert_eq!(options.foreign_keys, Some(true));
        assert!(options.recursive_triggers);
        assert_eq!(options.default_timeout(), Duration::from_secs(5));
        assert!(!options.pooling);
        assert_eq!(options.max_pool_size, 4);
    }

    #[test]
    fn test_parse_rejects_unknown_and_bad_values() {
        assert!(ConnectionOptions::parse("Server=x").is_err());
        assert!(ConnectionOptions::parse("Mode=Sideways").is_err());
        assert!(ConnectionOptions::parse("Pooling=perhaps").is_err());
        assert!(ConnectionOptions::parse("Data Source").is_err());
        assert!(ConnectionOptions::parse("Password='open").is_err());
        assert!(ConnectionOptions::parse("Max Pool Size=0").is_err());
    }

    #[test]
    fn test_parse_empty_and_trailing_separators() {
        let options = ConnectionOptions::parse("").unwrap();
        assert_eq!(options, ConnectionOptions::default());
        let options = ConnectionOptions::parse("Data Source=a.db;;").unwrap();
        assert_eq!(options.data_source, "a.db");
    }

    #[test]
    fn test_canonical_string_round_trips() {
        let original = ConnectionOptions {
            data_source: "dir with space;/x.db".to_string(),
            mode: OpenMode::ReadOnly,
            cache: CacheMode::Private,
            password: Some("a\"b".to_string()),
            foreign_keys: Some(false),
            recursive_triggers: true,
            default_timeout_secs: 7,
            pooling: false,
            max_pool_size: 3,
        };
        let rendered = original.to_connection_string();
        assert_eq!(ConnectionOptions::parse(&rendered).unwrap(), original);
    }

    #[test]
    fn test_equivalent_strings_share_a_key() {
        let a = ConnectionOptions::parse("data source=x.db;pooling=true").unwrap();
        let b = ConnectionOptions::parse("Filename = x.db").unwrap();
        assert_eq!(a.to_connection_string(), b.to_connection_string());
        assert_eq!(a.pool_key(), b.pool_key());
    }

    #[test]
    fn test_pool_key_masks_the_password() {
        let options = ConnectionOptions::parse("Data Source=x.db;Password=hunter2").unwrap();
        let key = options.pool_key();
        assert_eq!(key.to_string(), "Data Source=x.db;Password=***");
        assert!(!format!("{key:?}").contains("hunter2"));
        assert!(!format!("{options:?}").contains("hunter2"));

        let other = ConnectionOptions::parse("Data Source=x.db;Password=swordfish").unwrap();
        assert_ne!(key, other.pool_key());
        assert_eq!(key.to_string(), other.pool_key().to_string());
    }

    #[test]
    fn test_open_flags() {
        let ro = ConnectionOptions {
            mode: OpenMode::ReadOnly,
            ..ConnectionOptions::default()
        };
        assert_eq!(ro.open_flags(), SQLITE_OPEN_URI | SQLITE_OPEN_READONLY);
        let shared = ConnectionOptions {
            cache: CacheMode::Shared,
            ..ConnectionOptions::default()
        };
        assert_ne!(shared.open_flags() & SQLITE_OPEN_SHAREDCACHE, 0);
        assert_ne!(shared.open_flags() & SQLITE_OPEN_CREATE, 0);
    }
}
