//! Transactions and the begin policy.

use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::connection::{lock_core, SessionCore};
use crate::errors::{Error, Result};
use crate::native::NativeHandle;
use crate::utils::quote_identifier;

/// Requested isolation level.
///
/// The engine only distinguishes serializable and read-uncommitted (the latter
/// with a shared cache); every other level is promoted to
/// [`Serializable`](IsolationLevel::Serializable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    #[default]
    Unspecified,
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// Deferred-ness used when the caller does not choose.
    pub fn default_deferred(self) -> bool {
        self == IsolationLevel::ReadUncommitted
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IsolationLevel::Unspecified => "Unspecified",
            IsolationLevel::ReadUncommitted => "ReadUncommitted",
            IsolationLevel::ReadCommitted => "ReadCommitted",
            IsolationLevel::RepeatableRead => "RepeatableRead",
            IsolationLevel::Serializable => "Serializable",
        })
    }
}

/// Effective isolation and locking mode of a transaction about to begin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BeginPlan {
    pub(crate) isolation: IsolationLevel,
    pub(crate) deferred: bool,
}

impl BeginPlan {
    pub(crate) fn new(requested: IsolationLevel, deferred: Option<bool>, shared_cache: bool) -> Self {
        let deferred = deferred.unwrap_or_else(|| requested.default_deferred());
        let isolation = match requested {
            IsolationLevel::ReadUncommitted if shared_cache && deferred => {
                IsolationLevel::ReadUncommitted
            }
            _ => IsolationLevel::Serializable,
        };
        Self { isolation, deferred }
    }

    pub(crate) fn isolation_pragma(&self) -> &'static str {
        if self.isolation == IsolationLevel::ReadUncommitted {
            "PRAGMA read_uncommitted = 1;"
        } else {
            "PRAGMA read_uncommitted = 0;"
        }
    }

    pub(crate) fn begin_statement(&self) -> &'static str {
        if self.deferred {
            "BEGIN;"
        } else {
            "BEGIN IMMEDIATE;"
        }
    }

    pub(crate) fn apply(&self, handle: &NativeHandle) -> Result<()> {
        handle.exec(self.isolation_pragma())?;
        handle.exec(self.begin_statement())?;
        debug!(isolation = %self.isolation, deferred = self.deferred, "began transaction");
        Ok(())
    }
}

/// The single active transaction of a [`Connection`](crate::Connection).
///
/// A deferred transaction starts as a read transaction and is upgraded when
/// the first write executes. That upgrade can fail with `SQLITE_BUSY` under
/// lock contention; the whole transaction must then be retried from the start.
///
/// Dropping an unfinished transaction rolls it back.
pub struct Transaction {
    core: Arc<Mutex<SessionCore>>,
    id: u64,
    plan: BeginPlan,
    finished: bool,
}

impl Transaction {
    pub(crate) fn new(core: Arc<Mutex<SessionCore>>, id: u64, plan: BeginPlan) -> Self {
        Self {
            core,
            id,
            plan,
            finished: false,
        }
    }

    /// Isolation level in effect after promotion.
    pub fn isolation_level(&self) -> IsolationLevel {
        self.plan.isolation
    }

    pub fn is_deferred(&self) -> bool {
        self.plan.deferred
    }

    pub fn commit(mut self) -> Result<()> {
        self.finish("COMMIT;")?;
        self.finished = true;
        Ok(())
    }

    pub fn rollback(mut self) -> Result<()> {
        self.finish("ROLLBACK;")?;
        self.finished = true;
        Ok(())
    }

    /// Create savepoint `name`.
    pub fn save(&mut self, name: &str) -> Result<()> {
        self.run(&format!("SAVEPOINT {};", quote_identifier(name)))
    }

    /// Roll back to savepoint `name`, keeping it.
    pub fn rollback_to(&mut self, name: &str) -> Result<()> {
        self.run(&format!("ROLLBACK TO SAVEPOINT {};", quote_identifier(name)))
    }

    /// Release savepoint `name`, keeping its changes.
    pub fn release(&mut self, name: &str) -> Result<()> {
        self.run(&format!("RELEASE SAVEPOINT {};", quote_identifier(name)))
    }

    fn run(&mut self, sql: &str) -> Result<()> {
        let mut core = lock_core(&self.core);
        let handle = active_handle(&mut core, self.id)?;
        handle.exec(sql)
    }

    /// Run `COMMIT;`/`ROLLBACK;` and clear the session's slot on success.
    fn finish(&mut self, sql: &str) -> Result<()> {
        let mut core = lock_core(&self.core);
        let handle = active_handle(&mut core, self.id)?;
        handle.exec(sql)?;
        core.transaction = None;
        Ok(())
    }
}

/// The handle of the session if transaction `id` is still its active one.
fn active_handle(core: &mut SessionCore, id: u64) -> Result<&NativeHandle> {
    if core.transaction != Some(id) {
        return Err(Error::usage(
            "This transaction has completed; it is no longer usable",
        ));
    }
    let autocommit = match core.handle.as_ref() {
        Some(pooled) => pooled.handle().is_autocommit(),
        None => {
            core.transaction = None;
            return Err(Error::usage("The connection of this transaction was closed"));
        }
    };
    if autocommit {
        core.transaction = None;
        return Err(Error::usage(
            "The transaction was already committed or rolled back by SQL",
        ));
    }
    core.handle
        .as_ref()
        .map(|pooled| pooled.handle())
        .ok_or_else(|| Error::usage("The connection of this transaction was closed"))
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut core = lock_core(&self.core);
        if core.transaction != Some(self.id) {
            return;
        }
        core.transaction = None;
        if let Some(pooled) = core.handle.as_ref() {
            if !pooled.handle().is_autocommit() {
                if let Err(err) = pooled.handle().exec("ROLLBACK;") {
                    warn!(error = %err, "failed to roll back abandoned transaction");
                }
            }
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("isolation", &self.plan.isolation)
            .field("deferred", &self.plan.deferred)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_deferral_follows_isolation() {
        assert!(IsolationLevel::ReadUncommitted.default_deferred());
        assert!(!IsolationLevel::Serializable.default_deferred());
        assert!(!IsolationLevel::Unspecified.default_deferred());
    }

    #[test]
    fn levels_are_promoted_to_serializable() {
        for level in [
            IsolationLevel::Unspecified,
            IsolationLevel::ReadCommitted,
            IsolationLevel::RepeatableRead,
            IsolationLevel::Serializable,
        ] {
            let plan = BeginPlan::new(level, None, true);
            assert_eq!(plan.isolation, IsolationLevel::Serializable);
            assert_eq!(plan.begin_statement(), "BEGIN IMMEDIATE;");
            assert_eq!(plan.isolation_pragma(), "PRAGMA read_uncommitted = 0;");
        }
    }

    #[test]
    fn read_uncommitted_needs_shared_cache_and_deferral() {
        let plan = BeginPlan::new(IsolationLevel::ReadUncommitted, None, true);
        assert_eq!(plan.isolation, IsolationLevel::ReadUncommitted);
        assert!(plan.deferred);
        assert_eq!(plan.begin_statement(), "BEGIN;");
        assert_eq!(plan.isolation_pragma(), "PRAGMA read_uncommitted = 1;");

        let private = BeginPlan::new(IsolationLevel::ReadUncommitted, None, false);
        assert_eq!(private.isolation, IsolationLevel::Serializable);
        assert_eq!(private.begin_statement(), "BEGIN;");

        let immediate = BeginPlan::new(IsolationLevel::ReadUncommitted, Some(false), true);
        assert_eq!(immediate.isolation, IsolationLevel::Serializable);
        assert_eq!(immediate.begin_statement(), "BEGIN IMMEDIATE;");
    }

    #[test]
    fn explicit_deferral_overrides_default() {
        let plan = BeginPlan::new(IsolationLevel::Serializable, Some(true), false);
        assert!(plan.deferred);
        assert_eq!(plan.begin_statement(), "BEGIN;");
    }
}
