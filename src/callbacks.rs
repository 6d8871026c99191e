//! Callback bridge: native dispatch into user collations and functions.
//!
//! Each registration is boxed into an adapter that is handed to the engine as
//! user data and released by the engine through `destroy_adapter`. The
//! `extern "C"` trampolines below are the only code the engine calls; they
//! translate arguments and results and make sure neither a returned
//! [`CallbackError`] nor a panic ever unwinds across the native boundary.

use std::any::Any;
use std::borrow::Cow;
use std::cmp::Ordering;
use std::ffi::{c_char, c_int, c_void};
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::slice;
use std::sync::Arc;

use libsqlite3_sys::{
    sqlite3_aggregate_context, sqlite3_context, sqlite3_create_collation_v2,
    sqlite3_create_function_v2, sqlite3_result_error, sqlite3_result_error_code,
    sqlite3_result_error_nomem, sqlite3_user_data, sqlite3_value, SQLITE_DETERMINISTIC,
    SQLITE_OK, SQLITE_UTF8,
};
use tracing::error;

use crate::conversion::{set_result, Arguments};
use crate::errors::{check, Result};
use crate::exceptions::CallbackError;
use crate::native::NativeHandle;
use crate::types::Value;
use crate::utils::to_cstring;

pub(crate) type CollationFn = Arc<dyn Fn(&str, &str) -> Ordering + Send + Sync>;
pub(crate) type ScalarFn =
    Arc<dyn Fn(&Arguments<'_>) -> Result<Value, CallbackError> + Send + Sync>;
pub(crate) type Accumulator = Box<dyn Any + Send>;
type SeedFn = Arc<dyn Fn() -> Accumulator + Send + Sync>;
type StepFn =
    Arc<dyn Fn(Accumulator, &Arguments<'_>) -> Result<Accumulator, CallbackError> + Send + Sync>;
type FinalFn = Arc<dyn Fn(Accumulator) -> Result<Value, CallbackError> + Send + Sync>;

/// Type-erased aggregate definition.
#[derive(Clone)]
pub(crate) struct AggregateFns {
    seed: SeedFn,
    step: StepFn,
    /// `None` makes the aggregate yield NULL.
    finalize: Option<FinalFn>,
}

pub(crate) fn erase_collation<T, F>(state: T, compare: F) -> CollationFn
where
    T: Send + Sync + 'static,
    F: Fn(&T, &str, &str) -> Ordering + Send + Sync + 'static,
{
    Arc::new(move |lhs: &str, rhs: &str| compare(&state, lhs, rhs))
}

pub(crate) fn erase_scalar<T, R, F>(state: T, function: F) -> ScalarFn
where
    T: Send + Sync + 'static,
    R: Into<Value>,
    F: Fn(&T, &Arguments<'_>) -> Result<R, CallbackError> + Send + Sync + 'static,
{
    Arc::new(move |args: &Arguments<'_>| {
        function(&state, args).map(Into::<Value>::into)
    })
}

pub(crate) fn erase_aggregate<A, R, S, F>(seed: A, step: S, finalize: Option<F>) -> AggregateFns
where
    A: Clone + Send + Sync + 'static,
    R: Into<Value>,
    S: Fn(A, &Arguments<'_>) -> Result<A, CallbackError> + Send + Sync + 'static,
    F: Fn(A) -> Result<R, CallbackError> + Send + Sync + 'static,
{
    let finalize = finalize.map(|finalize| {
        Arc::new(move |acc: Accumulator| {
            finalize(downcast::<A>(acc)?).map(Into::<Value>::into)
        }) as FinalFn
    });
    AggregateFns {
        seed: Arc::new(move || Box::new(seed.clone()) as Accumulator),
        step: Arc::new(move |acc: Accumulator, args: &Arguments<'_>| {
            step(downcast::<A>(acc)?, args).map(|next| Box::new(next) as Accumulator)
        }),
        finalize,
    }
}

fn downcast<A: 'static>(acc: Accumulator) -> Result<A, CallbackError> {
    acc.downcast::<A>()
        .map(|boxed| *boxed)
        .map_err(|_| CallbackError::new("Aggregate accumulator has an unexpected type"))
}

/// Per-group state of one aggregate evaluation.
///
/// Once `error` is set every later step is skipped and `finish` reports that
/// error instead of calling the finalize function.
pub(crate) struct AggregateContext {
    accumulator: Option<Accumulator>,
    error: Option<CallbackError>,
}

impl AggregateContext {
    pub(crate) fn new(name: &str, fns: &AggregateFns) -> Self {
        match panic::catch_unwind(AssertUnwindSafe(|| (fns.seed)())) {
            Ok(seed) => Self {
                accumulator: Some(seed),
                error: None,
            },
            Err(payload) => Self {
                accumulator: None,
                error: Some(CallbackError::from_panic(
                    &format!("aggregate '{name}' seed"),
                    payload,
                )),
            },
        }
    }

    pub(crate) fn has_failed(&self) -> bool {
        self.error.is_some()
    }

    pub(crate) fn step(&mut self, name: &str, fns: &AggregateFns, args: &Arguments<'_>) {
        if self.error.is_some() {
            return;
        }
        let Some(acc) = self.accumulator.take() else {
            self.error = Some(CallbackError::new(format!(
                "Aggregate '{name}' has no accumulator"
            )));
            return;
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (fns.step)(acc, args)))
            .unwrap_or_else(|payload| {
                Err(CallbackError::from_panic(&format!("aggregate '{name}' step"), payload))
            });
        match outcome {
            Ok(next) => self.accumulator = Some(next),
            Err(err) => self.error = Some(err),
        }
    }

    /// Consume the context, producing the aggregate result or the first failure.
    pub(crate) fn finish(self, name: &str, fns: &AggregateFns) -> Result<Value, CallbackError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let Some(finalize) = &fns.finalize else {
            return Ok(Value::Null);
        };
        let acc = self
            .accumulator
            .ok_or_else(|| CallbackError::new(format!("Aggregate '{name}' has no accumulator")))?;
        panic::catch_unwind(AssertUnwindSafe(|| finalize(acc))).unwrap_or_else(|payload| {
            Err(CallbackError::from_panic(
                &format!("aggregate '{name}' finalize"),
                payload,
            ))
        })
    }
}

struct CollationAdapter {
    name: String,
    compare: CollationFn,
}

struct ScalarAdapter {
    name: String,
    function: ScalarFn,
}

struct AggregateAdapter {
    name: String,
    fns: AggregateFns,
}

/// Report `err` as the function result: message first, then the code.
///
/// # Safety
///
/// `ctx` must be the context of the currently executing callback.
unsafe fn report_error(ctx: *mut sqlite3_context, err: &CallbackError) {
    let message = err.message();
    let len = c_int::try_from(message.len()).unwrap_or(c_int::MAX);
    sqlite3_result_error(ctx, message.as_ptr() as *const c_char, len);
    if let Some(code) = err.code() {
        sqlite3_result_error_code(ctx, code);
    }
}

extern "C" fn scalar_trampoline(
    ctx: *mut sqlite3_context,
    argc: c_int,
    argv: *mut *mut sqlite3_value,
) {
    // Safety: ctx is the live context the engine passed in; user data was set
    // to a boxed ScalarAdapter at registration and is freed only by
    // destroy_adapter, which cannot run while the function executes.
    unsafe {
        let Some(adapter) = (sqlite3_user_data(ctx) as *const ScalarAdapter).as_ref() else {
            report_error(ctx, &CallbackError::new("Function state is missing"));
            return;
        };
        let args = Arguments::from_raw(argc, argv);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (adapter.function)(&args)))
            .unwrap_or_else(|payload| {
                Err(CallbackError::from_panic(
                    &format!("function '{}'", adapter.name),
                    payload,
                ))
            })
            .and_then(|value| set_result(ctx, &value));
        if let Err(err) = outcome {
            report_error(ctx, &err);
        }
    }
}

/// Slot inside the engine's per-group aggregate memory holding a pointer to
/// the boxed `AggregateContext`. The engine zeroes the memory on first use.
unsafe fn context_slot(ctx: *mut sqlite3_context, allocate: bool) -> *mut *mut AggregateContext {
    let size = if allocate {
        mem::size_of::<*mut AggregateContext>() as c_int
    } else {
        0
    };
    sqlite3_aggregate_context(ctx, size) as *mut *mut AggregateContext
}

extern "C" fn aggregate_step_trampoline(
    ctx: *mut sqlite3_context,
    argc: c_int,
    argv: *mut *mut sqlite3_value,
) {
    // Safety: as in scalar_trampoline for the adapter. The slot is engine
    // memory private to this group; the context it points to was created here
    // and is only reclaimed by aggregate_final_trampoline.
    unsafe {
        let Some(adapter) = (sqlite3_user_data(ctx) as *const AggregateAdapter).as_ref() else {
            report_error(ctx, &CallbackError::new("Aggregate state is missing"));
            return;
        };
        let slot = context_slot(ctx, true);
        if slot.is_null() {
            sqlite3_result_error_nomem(ctx);
            return;
        }
        let mut context = ptr::read_unaligned(slot);
        if context.is_null() {
            context = Box::into_raw(Box::new(AggregateContext::new(&adapter.name, &adapter.fns)));
            ptr::write_unaligned(slot, context);
        }
        let context = &mut *context;
        if context.has_failed() {
            return;
        }
        let args = Arguments::from_raw(argc, argv);
        context.step(&adapter.name, &adapter.fns, &args);
    }
}

extern "C" fn aggregate_final_trampoline(ctx: *mut sqlite3_context) {
    // Safety: see aggregate_step_trampoline. The context pointer is taken out
    // of the slot before it is consumed, so it is reclaimed exactly once.
    unsafe {
        let Some(adapter) = (sqlite3_user_data(ctx) as *const AggregateAdapter).as_ref() else {
            report_error(ctx, &CallbackError::new("Aggregate state is missing"));
            return;
        };
        let slot = context_slot(ctx, false);
        let stored = if slot.is_null() {
            ptr::null_mut()
        } else {
            let stored = ptr::read_unaligned(slot);
            ptr::write_unaligned(slot, ptr::null_mut());
            stored
        };
        // No rows reached step: finalize the seed.
        let context = if stored.is_null() {
            AggregateContext::new(&adapter.name, &adapter.fns)
        } else {
            *Box::from_raw(stored)
        };
        let outcome = context
            .finish(&adapter.name, &adapter.fns)
            .and_then(|value| set_result(ctx, &value));
        if let Err(err) = outcome {
            report_error(ctx, &err);
        }
    }
}

extern "C" fn collation_trampoline(
    user_data: *mut c_void,
    lhs_len: c_int,
    lhs_ptr: *const c_void,
    rhs_len: c_int,
    rhs_ptr: *const c_void,
) -> c_int {
    // Safety: user data is the boxed CollationAdapter registered with this
    // collation; the engine passes UTF-8 text (registered with SQLITE_UTF8)
    // of the given lengths.
    unsafe {
        let Some(adapter) = (user_data as *const CollationAdapter).as_ref() else {
            return 0;
        };
        let lhs = text_arg(lhs_ptr, lhs_len);
        let rhs = text_arg(rhs_ptr, rhs_len);
        match panic::catch_unwind(AssertUnwindSafe(|| (adapter.compare)(&lhs, &rhs))) {
            Ok(Ordering::Less) => -1,
            Ok(Ordering::Equal) => 0,
            Ok(Ordering::Greater) => 1,
            Err(_) => {
                error!(
                    collation = %adapter.name,
                    "collation panicked; comparing operands as equal"
                );
                0
            }
        }
    }
}

unsafe fn text_arg<'a>(ptr: *const c_void, len: c_int) -> Cow<'a, str> {
    if ptr.is_null() || len <= 0 {
        return Cow::Borrowed("");
    }
    String::from_utf8_lossy(slice::from_raw_parts(ptr as *const u8, len as usize))
}

extern "C" fn destroy_adapter<T>(data: *mut c_void) {
    if !data.is_null() {
        // Safety: data was produced by Box::into_raw::<T> at registration.
        unsafe { drop(Box::from_raw(data as *mut T)) };
    }
}

fn function_flags(deterministic: bool) -> c_int {
    if deterministic {
        SQLITE_UTF8 | SQLITE_DETERMINISTIC
    } else {
        SQLITE_UTF8
    }
}

impl NativeHandle {
    /// Install `compare` as collation `name`, or delete the collation when `None`.
    pub(crate) fn create_collation(&self, name: &str, compare: Option<&CollationFn>) -> Result<()> {
        let name_c = to_cstring(name, "Collation name")?;
        let Some(compare) = compare else {
            // Safety: handle is open; null callbacks delete the collation.
            let rc = unsafe {
                sqlite3_create_collation_v2(self.as_ptr(), name_c.as_ptr(), SQLITE_UTF8, ptr::null_mut(), None, None)
            };
            return check(self.as_ptr(), rc);
        };
        let adapter = Box::into_raw(Box::new(CollationAdapter {
            name: name.to_string(),
            compare: Arc::clone(compare),
        }));
        // Safety: handle is open; the adapter is owned by the engine on success
        // and released through destroy_adapter.
        let rc = unsafe {
            sqlite3_create_collation_v2(
                self.as_ptr(),
                name_c.as_ptr(),
                SQLITE_UTF8,
                adapter as *mut c_void,
                Some(collation_trampoline),
                Some(destroy_adapter::<CollationAdapter>),
            )
        };
        if rc != SQLITE_OK {
            // The engine does not run the destructor when registration fails.
            // Safety: the adapter was never handed over.
            unsafe { drop(Box::from_raw(adapter)) };
        }
        check(self.as_ptr(), rc)
    }

    /// Install a scalar function, or delete `name`/`arity` when `function` is `None`.
    pub(crate) fn create_scalar_function(
        &self,
        name: &str,
        arity: c_int,
        deterministic: bool,
        function: Option<&ScalarFn>,
    ) -> Result<()> {
        let name_c = to_cstring(name, "Function name")?;
        let Some(function) = function else {
            return self.delete_function(&name_c, arity);
        };
        let adapter = Box::into_raw(Box::new(ScalarAdapter {
            name: name.to_string(),
            function: Arc::clone(function),
        }));
        // Safety: handle is open; the engine owns the adapter from here on and
        // runs destroy_adapter on replacement, deletion, close or failure.
        let rc = unsafe {
            sqlite3_create_function_v2(
                self.as_ptr(),
                name_c.as_ptr(),
                arity,
                function_flags(deterministic),
                adapter as *mut c_void,
                Some(scalar_trampoline),
                None,
                None,
                Some(destroy_adapter::<ScalarAdapter>),
            )
        };
        check(self.as_ptr(), rc)
    }

    /// Install an aggregate function, or delete `name`/`arity` when `fns` is `None`.
    pub(crate) fn create_aggregate_function(
        &self,
        name: &str,
        arity: c_int,
        deterministic: bool,
        fns: Option<&AggregateFns>,
    ) -> Result<()> {
        let name_c = to_cstring(name, "Function name")?;
        let Some(fns) = fns else {
            return self.delete_function(&name_c, arity);
        };
        let adapter = Box::into_raw(Box::new(AggregateAdapter {
            name: name.to_string(),
            fns: fns.clone(),
        }));
        // Safety: see create_scalar_function.
        let rc = unsafe {
            sqlite3_create_function_v2(
                self.as_ptr(),
                name_c.as_ptr(),
                arity,
                function_flags(deterministic),
                adapter as *mut c_void,
                None,
                Some(aggregate_step_trampoline),
                Some(aggregate_final_trampoline),
                Some(destroy_adapter::<AggregateAdapter>),
            )
        };
        check(self.as_ptr(), rc)
    }

    fn delete_function(&self, name: &std::ffi::CStr, arity: c_int) -> Result<()> {
        // Safety: handle is open; all-null callbacks delete the function.
        let rc = unsafe {
            sqlite3_create_function_v2(
                self.as_ptr(),
                name.as_ptr(),
                arity,
                SQLITE_UTF8,
                ptr::null_mut(),
                None,
                None,
                None,
                None,
            )
        };
        check(self.as_ptr(), rc)
    }
}
