//! Extensibility registry: the collations, functions and extensions a session
//! replays onto every handle it opens and undoes before the handle goes back
//! to the pool.
//!
//! The registry:
//! - Keys collations by case-insensitive name
//! - Keys functions by case-insensitive name and exact arity
//! - Keeps one entry per key (last write wins)
//! - Applies changes to the live handle first, then records them
//! - Replays collations, then scalar functions, then aggregates, then extensions
//!
//! Undo cannot restore a built-in that a registration replaced, nor unload an
//! extension library; replay reports both so the handle can be retired.

use std::collections::HashSet;
use std::ffi::c_int;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

use indexmap::{IndexMap, IndexSet};
use tracing::{debug, warn};

use crate::callbacks::{AggregateFns, CollationFn, ScalarFn};
use crate::command::query_all;
use crate::errors::{Error, Result};
use crate::native::NativeHandle;
use crate::types::Value;
use crate::utils::validate_path;

/// Largest fixed argument count the engine accepts for a function.
pub const MAX_FUNCTION_ARGS: u8 = 127;

/// Collations every handle is opened with.
const BUILTIN_COLLATIONS: [&str; 3] = ["BINARY", "NOCASE", "RTRIM"];

/// Lower-cased names of the engine's built-in functions.
static BUILTIN_FUNCTIONS: OnceLock<HashSet<String>> = OnceLock::new();

/// Whether collation `name` replaces one of the engine's own.
pub(crate) fn is_builtin_collation(name: &str) -> bool {
    BUILTIN_COLLATIONS
        .iter()
        .any(|builtin| builtin.eq_ignore_ascii_case(name))
}

/// Whether a function called `name` (any arity) would hide a built-in one.
///
/// The built-in list is global to the library, so it is read once from the
/// first handle asked. When it cannot be read the name is assumed to clash.
pub(crate) fn is_builtin_function(handle: &NativeHandle, name: &str) -> bool {
    let builtins = match BUILTIN_FUNCTIONS.get() {
        Some(builtins) => builtins,
        None => match list_builtin_functions(handle) {
            Ok(names) => BUILTIN_FUNCTIONS.get_or_init(|| names),
            Err(err) => {
                warn!(function = name, error = %err, "cannot list built-in functions");
                return true;
            }
        },
    };
    builtins.contains(&name.to_ascii_lowercase())
}

fn list_builtin_functions(handle: &NativeHandle) -> Result<HashSet<String>> {
    let rows = query_all(
        handle,
        "SELECT DISTINCT name FROM pragma_function_list WHERE builtin = 1;",
    )?;
    Ok(rows
        .into_iter()
        .filter_map(|row| match row.into_iter().next() {
            Some(Value::Text(name)) => Some(name.to_ascii_lowercase()),
            _ => None,
        })
        .collect())
}

/// Number of arguments a function accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arity {
    /// Any number of arguments.
    Any,
    Exact(u8),
}

impl Arity {
    pub(crate) fn as_native(self) -> c_int {
        match self {
            Arity::Any => -1,
            Arity::Exact(n) => c_int::from(n),
        }
    }

    fn validate(self) -> Result<()> {
        match self {
            Arity::Exact(n) if n > MAX_FUNCTION_ARGS => Err(Error::invalid_argument(format!(
                "Function arity {n} exceeds the maximum of {MAX_FUNCTION_ARGS}"
            ))),
            _ => Ok(()),
        }
    }
}

impl From<u8> for Arity {
    fn from(n: u8) -> Self {
        Arity::Exact(n)
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Any => f.write_str("any"),
            Arity::Exact(n) => write!(f, "{n}"),
        }
    }
}

/// A collation or function name compared the way the engine compares them:
/// ASCII case-insensitively. The spelling of the first registration is kept.
#[derive(Debug, Clone)]
pub(crate) struct Name(String);

impl Name {
    fn new(name: &str, what: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(Error::invalid_argument(format!("{what} name cannot be empty")));
        }
        Ok(Self(name.to_string()))
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for Name {}

impl Hash for Name {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for byte in self.0.bytes() {
            state.write_u8(byte.to_ascii_lowercase());
        }
        state.write_u8(0xff);
    }
}

/// Registry key of a scalar or aggregate function.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct FunctionKey {
    pub(crate) name: Name,
    pub(crate) arity: Arity,
}

impl FunctionKey {
    pub(crate) fn new(name: &str, arity: Arity) -> Result<Self> {
        arity.validate()?;
        Ok(Self {
            name: Name::new(name, "Function")?,
            arity,
        })
    }
}

#[derive(Clone)]
pub(crate) enum FunctionDef {
    Scalar {
        deterministic: bool,
        function: ScalarFn,
    },
    Aggregate {
        deterministic: bool,
        fns: AggregateFns,
    },
}

impl FunctionDef {
    fn is_aggregate(&self) -> bool {
        matches!(self, FunctionDef::Aggregate { .. })
    }

    fn install(&self, handle: &NativeHandle, key: &FunctionKey) -> Result<()> {
        let arity = key.arity.as_native();
        match self {
            FunctionDef::Scalar {
                deterministic,
                function,
            } => handle.create_scalar_function(key.name.as_str(), arity, *deterministic, Some(function)),
            FunctionDef::Aggregate { deterministic, fns } => {
                handle.create_aggregate_function(key.name.as_str(), arity, *deterministic, Some(fns))
            }
        }
    }
}

/// Loadable extension library and optional entry point.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExtensionRef {
    pub file: String,
    pub entry_point: Option<String>,
}

/// Number of entries applied by one replay, including a replay that failed
/// part way.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ReplayCounts {
    pub(crate) collations: usize,
    pub(crate) scalars: usize,
    pub(crate) aggregates: usize,
    pub(crate) extensions: usize,
    /// Registrations that replaced a built-in collation or function.
    pub(crate) shadowed: usize,
}

impl ReplayCounts {
    /// Whether the handle keeps something undo cannot take back: a hidden
    /// built-in or a loaded extension library.
    pub(crate) fn leaves_residue(&self) -> bool {
        self.shadowed > 0 || self.extensions > 0
    }
}

#[derive(Default)]
pub(crate) struct Registry {
    collations: IndexMap<Name, CollationFn>,
    functions: IndexMap<FunctionKey, FunctionDef>,
    extensions: IndexSet<ExtensionRef>,
    extensions_enabled: bool,
}

impl Registry {
    /// Register (`Some`) or remove (`None`) a collation.
    pub(crate) fn set_collation(
        &mut self,
        name: &str,
        compare: Option<CollationFn>,
        live: Option<&NativeHandle>,
    ) -> Result<()> {
        let key = Name::new(name, "Collation")?;
        if let Some(handle) = live {
            handle.create_collation(name, compare.as_ref())?;
        }
        match compare {
            Some(compare) => {
                self.collations.insert(key, compare);
            }
            None => {
                self.collations.shift_remove(&key);
            }
        }
        Ok(())
    }

    /// Register (`Some`) or remove (`None`) a scalar or aggregate function.
    ///
    /// A scalar and an aggregate with the same key replace each other, as they
    /// do in the engine.
    pub(crate) fn set_function(
        &mut self,
        key: FunctionKey,
        def: Option<FunctionDef>,
        live: Option<&NativeHandle>,
    ) -> Result<()> {
        if let Some(handle) = live {
            match &def {
                Some(def) => def.install(handle, &key)?,
                None => handle.create_scalar_function(key.name.as_str(), key.arity.as_native(), false, None)?,
            }
        }
        match def {
            Some(def) => {
                // shift_remove first so the spelling of the new registration wins
                self.functions.shift_remove(&key);
                self.functions.insert(key, def);
            }
            None => {
                self.functions.shift_remove(&key);
            }
        }
        Ok(())
    }

    /// Add an extension; returns `false` if the same file and entry point were
    /// already registered, in which case nothing is loaded again.
    pub(crate) fn add_extension(
        &mut self,
        extension: ExtensionRef,
        live: Option<&NativeHandle>,
    ) -> Result<bool> {
        validate_path(&extension.file)?;
        if self.extensions.contains(&extension) {
            return Ok(false);
        }
        if let Some(handle) = live {
            self.load_extensions(handle, std::slice::from_ref(&extension), &mut 0)?;
        }
        self.extensions.insert(extension);
        Ok(true)
    }

    pub(crate) fn extensions_enabled(&self) -> bool {
        self.extensions_enabled
    }

    pub(crate) fn set_extensions_enabled(
        &mut self,
        enabled: bool,
        live: Option<&NativeHandle>,
    ) -> Result<()> {
        if let Some(handle) = live {
            handle.enable_load_extension(enabled)?;
        }
        self.extensions_enabled = enabled;
        Ok(())
    }

    pub(crate) fn extensions(&self) -> impl Iterator<Item = &ExtensionRef> {
        self.extensions.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.collations.len() + self.functions.len() + self.extensions.len()
    }

    /// Apply every registration to a freshly acquired handle, counting into
    /// `counts` as it goes.
    ///
    /// Stops at the first failure; the caller undoes what was applied.
    pub(crate) fn replay(&self, handle: &NativeHandle, counts: &mut ReplayCounts) -> Result<()> {
        for (name, compare) in &self.collations {
            if is_builtin_collation(name.as_str()) {
                counts.shadowed += 1;
            }
            handle.create_collation(name.as_str(), Some(compare))?;
            counts.collations += 1;
        }
        let scalars = self.functions.iter().filter(|(_, def)| !def.is_aggregate());
        let aggregates = self.functions.iter().filter(|(_, def)| def.is_aggregate());
        for (key, def) in scalars.chain(aggregates) {
            if is_builtin_function(handle, key.name.as_str()) {
                counts.shadowed += 1;
            }
            def.install(handle, key)?;
            if def.is_aggregate() {
                counts.aggregates += 1;
            } else {
                counts.scalars += 1;
            }
        }
        if !self.extensions.is_empty() {
            let extensions: Vec<ExtensionRef> = self.extensions.iter().cloned().collect();
            self.load_extensions(handle, &extensions, &mut counts.extensions)?;
        } else if self.extensions_enabled {
            handle.enable_load_extension(true)?;
        }
        debug!(
            collations = counts.collations,
            scalars = counts.scalars,
            aggregates = counts.aggregates,
            extensions = counts.extensions,
            shadowed = counts.shadowed,
            "replayed session registry"
        );
        Ok(())
    }

    /// Remove every registration from `handle` and disable extension loading.
    ///
    /// Keeps going after a failure so as much as possible is removed, then
    /// reports the first failure. The in-memory entries are left untouched.
    pub(crate) fn undo(&self, handle: &NativeHandle) -> Result<()> {
        let mut first_error: Option<Error> = None;
        let mut note = |outcome: Result<()>, what: &str, name: &str| {
            if let Err(err) = outcome {
                warn!(kind = what, name, error = %err, "failed to remove registration");
                first_error.get_or_insert(err);
            }
        };
        for name in self.collations.keys() {
            note(handle.create_collation(name.as_str(), None), "collation", name.as_str());
        }
        for key in self.functions.keys() {
            let outcome =
                handle.create_scalar_function(key.name.as_str(), key.arity.as_native(), false, None);
            note(outcome, "function", key.name.as_str());
        }
        if self.extensions_enabled || !self.extensions.is_empty() {
            note(handle.enable_load_extension(false), "extension loading", "");
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Load `extensions` with loading temporarily enabled, then restore the
    /// configured flag whether or not loading succeeded. `loaded` counts the
    /// libraries that made it in.
    fn load_extensions(
        &self,
        handle: &NativeHandle,
        extensions: &[ExtensionRef],
        loaded: &mut usize,
    ) -> Result<()> {
        if !self.extensions_enabled {
            handle.enable_load_extension(true)?;
        }
        let outcome = extensions.iter().try_for_each(|ext| {
            handle.load_extension(&ext.file, ext.entry_point.as_deref())?;
            *loaded += 1;
            debug!(file = %ext.file, entry_point = ?ext.entry_point, "loaded extension");
            Ok(())
        });
        let restored = handle.enable_load_extension(self.extensions_enabled);
        outcome.and(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::sync::Arc;

    use crate::callbacks::{erase_collation, erase_scalar};
    use crate::command::query_all;
    use crate::config::ConnectionOptions;
    use crate::conversion::Arguments;
    use crate::types::Value;

    fn memory_handle() -> NativeHandle {
        NativeHandle::open(&ConnectionOptions::new(":memory:")).unwrap()
    }

    fn hash_of<T: Hash>(value: &T) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        hasher.finish()
    }

    fn constant(n: i64) -> FunctionDef {
        FunctionDef::Scalar {
            deterministic: true,
            function: erase_scalar(n, |n: &i64, _args: &Arguments<'_>| Ok(*n)),
        }
    }

    #[test]
    fn function_keys_ignore_name_case_but_not_arity() {
        let a = FunctionKey::new("Upper_X", Arity::Exact(1)).unwrap();
        let b = FunctionKey::new("upper_x", Arity::Exact(1)).unwrap();
        let c = FunctionKey::new("UPPER_X", Arity::Any).unwrap();
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_ne!(a, c);
    }

    #[test]
    fn keys_reject_bad_input() {
        assert!(FunctionKey::new("", Arity::Any).is_err());
        assert!(FunctionKey::new("f", Arity::Exact(MAX_FUNCTION_ARGS + 1)).is_err());
        assert_eq!(Arity::Any.as_native(), -1);
        assert_eq!(Arity::from(3).as_native(), 3);
    }

    #[test]
    fn last_registration_wins() {
        let mut registry = Registry::default();
        let key = || FunctionKey::new("answer", Arity::Exact(0)).unwrap();
        registry.set_function(key(), Some(constant(1)), None).unwrap();
        registry.set_function(FunctionKey::new("ANSWER", Arity::Exact(0)).unwrap(), Some(constant(42)), None).unwrap();
        assert_eq!(registry.len(), 1);

        let handle = memory_handle();
        let mut counts = ReplayCounts::default();
        registry.replay(&handle, &mut counts).unwrap();
        assert_eq!(counts.scalars, 1);
        assert!(!counts.leaves_residue());
        assert_eq!(query_all(&handle, "SELECT answer()").unwrap(), vec![vec![Value::Integer(42)]]);
    }

    #[test]
    fn removal_drops_the_entry_and_the_live_function() {
        let handle = memory_handle();
        let mut registry = Registry::default();
        let key = || FunctionKey::new("gone", Arity::Exact(0)).unwrap();
        registry.set_function(key(), Some(constant(7)), Some(&handle)).unwrap();
        assert_eq!(query_all(&handle, "SELECT gone()").unwrap(), vec![vec![Value::Integer(7)]]);
        registry.set_function(key(), None, Some(&handle)).unwrap();
        assert_eq!(registry.len(), 0);
        assert!(query_all(&handle, "SELECT gone()").is_err());
    }

    #[test]
    fn undo_removes_registrations_but_keeps_entries() {
        let handle = memory_handle();
        let mut registry = Registry::default();
        let reverse: CollationFn = erase_collation((), |_: &(), a: &str, b: &str| b.cmp(a));
        registry.set_collation("Reverse", Some(Arc::clone(&reverse)), None).unwrap();
        registry
            .set_function(FunctionKey::new("seven", Arity::Any).unwrap(), Some(constant(7)), None)
            .unwrap();
        registry.replay(&handle, &mut ReplayCounts::default()).unwrap();
        assert!(query_all(&handle, "SELECT seven(1, 2, 3)").is_ok());

        registry.undo(&handle).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(query_all(&handle, "SELECT seven()").is_err());
        let err = query_all(&handle, "SELECT 'a' COLLATE reverse").unwrap_err();
        assert!(err.to_string().contains("no such collation"), "{err}");

        registry.replay(&handle, &mut ReplayCounts::default()).unwrap();
        assert!(query_all(&handle, "SELECT 'a' COLLATE REVERSE").is_ok());
    }

    #[test]
    fn duplicate_extensions_are_ignored_and_missing_files_fail() {
        let mut registry = Registry::default();
        let ext = ExtensionRef {
            file: "/nonexistent/libmissing".into(),
            entry_point: None,
        };
        assert!(registry.add_extension(ext.clone(), None).unwrap());
        assert!(!registry.add_extension(ext, None).unwrap());
        assert_eq!(registry.extensions().count(), 1);

        let handle = memory_handle();
        let mut counts = ReplayCounts::default();
        let err = registry.replay(&handle, &mut counts).unwrap_err();
        assert!(err.to_string().contains("Failed to load extension"), "{err}");
        assert_eq!(counts.extensions, 0);
        registry.undo(&handle).unwrap();
    }

    #[test]
    fn builtin_names_are_recognised() {
        assert!(is_builtin_collation("nocase"));
        assert!(is_builtin_collation("RTRIM"));
        assert!(!is_builtin_collation("reverse"));

        let handle = memory_handle();
        assert!(is_builtin_function(&handle, "LOWER"));
        assert!(is_builtin_function(&handle, "json_extract"));
        assert!(!is_builtin_function(&handle, "seven"));
    }

    #[test]
    fn replay_counts_entries_that_shadow_builtins() {
        let mut registry = Registry::default();
        let upper_first: CollationFn = erase_collation((), |_: &(), a: &str, b: &str| b.cmp(a));
        registry.set_collation("NoCase", Some(upper_first), None).unwrap();
        registry
            .set_function(FunctionKey::new("Lower", Arity::Exact(1)).unwrap(), Some(constant(0)), None)
            .unwrap();
        registry
            .set_function(FunctionKey::new("seven", Arity::Any).unwrap(), Some(constant(7)), None)
            .unwrap();

        let handle = memory_handle();
        let mut counts = ReplayCounts::default();
        registry.replay(&handle, &mut counts).unwrap();
        assert_eq!(counts.shadowed, 2);
        assert!(counts.leaves_residue());
    }
}
