//! Pooled SQLite sessions.
//!
//! A [`Connection`] borrows a native handle from a [`HandlePool`] while it is
//! open. Collations, scalar and aggregate functions and loadable extensions
//! registered on the connection are replayed onto every handle it opens and
//! removed again before the handle goes back to the pool, so no registration
//! leaks to the next borrower.

mod callbacks;
mod command;
mod config;
mod connection;
mod conversion;
mod errors;
mod exceptions;
mod native;
mod pool;
mod registry;
mod transaction;
mod types;
mod utils;

pub use command::Statement;
pub use config::{
    CacheMode, ConnectionOptions, OpenMode, PoolKey, DEFAULT_MAX_POOL_SIZE, DEFAULT_TIMEOUT_SECS,
};
pub use connection::Connection;
pub use conversion::Arguments;
pub use errors::{Error, Result};
pub use exceptions::CallbackError;
pub use native::{initialize, library_version};
pub use pool::{HandlePool, PooledHandle, SqlitePool};
pub use registry::{Arity, ExtensionRef, MAX_FUNCTION_ARGS};
pub use transaction::{IsolationLevel, Transaction};
pub use types::{ConnectionState, StateChange, Value};
