//! Scalar and aggregate user-defined SQL functions.
//!
//! Registered callables are owned by the engine: the registration passes an
//! `xDestroy` destructor, so replacing a function or closing the connection
//! releases the host callback.

use std::ffi::CString;
use std::os::raw::{c_char, c_int, c_void};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use libsqlite3_sys::{
    sqlite3_aggregate_context, sqlite3_context, sqlite3_create_function_v2, sqlite3_result_blob,
    sqlite3_result_double, sqlite3_result_error, sqlite3_result_int64, sqlite3_result_null,
    sqlite3_result_text, sqlite3_user_data, sqlite3_value, SQLITE_DETERMINISTIC, SQLITE_OK,
    SQLITE_TRANSIENT, SQLITE_UTF8,
};

use crate::connection::ConnectionInner;
use crate::error::{Error, Result};
use crate::value::{decode_raw, Value};

// not exported by every libsqlite3-sys release
const SQLITE_DIRECTONLY: c_int = 0x0008_0000; // 3.30.0
const SQLITE_SUBTYPE: c_int = 0x0010_0000; // 3.30.0
const SQLITE_INNOCUOUS: c_int = 0x0020_0000; // 3.31.0

/// Behavior flags for a registered function.
///
/// The argument count is given at registration;
/// [`varargs`](FunctionOptions::varargs) overrides it and registers the
/// function as variadic instead.
#[derive(Clone, Copy, Debug, Default)]
pub struct FunctionOptions {
    deterministic: bool,
    direct_only: bool,
    subtype: bool,
    innocuous: bool,
    varargs: bool,
}

impl FunctionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// The function always produces the same output for the same inputs.
    pub fn deterministic(mut self) -> Self {
        self.deterministic = true;
        self
    }

    /// The function may only be invoked from top-level SQL, not from views,
    /// triggers, or schema structures.
    pub fn direct_only(mut self) -> Self {
        self.direct_only = true;
        self
    }

    /// The function may read the subtype of its arguments.
    pub fn subtype(mut self) -> Self {
        self.subtype = true;
        self
    }

    /// The function is unlikely to cause problems even when misused.
    pub fn innocuous(mut self) -> Self {
        self.innocuous = true;
        self
    }

    /// Accept any number of arguments, ignoring the registered arity.
    pub fn varargs(mut self) -> Self {
        self.varargs = true;
        self
    }

    fn sqlite_flags(&self) -> c_int {
        let mut flags = SQLITE_UTF8;

        if self.deterministic {
            flags |= SQLITE_DETERMINISTIC;
        }

        if self.direct_only {
            flags |= SQLITE_DIRECTONLY;
        }

        if self.subtype {
            flags |= SQLITE_SUBTYPE;
        }

        if self.innocuous {
            flags |= SQLITE_INNOCUOUS;
        }

        flags
    }

    /// The argument count sent to the engine; variadic functions send −1.
    fn sqlite_arity(&self, arity: u8) -> c_int {
        if self.varargs {
            -1
        } else {
            c_int::from(arity)
        }
    }
}

/// A user-defined aggregate: a seed, a per-row fold, and an optional final
/// transform.
pub trait Aggregate {
    /// Seed value for each new group.
    fn start(&self) -> Value {
        Value::Null
    }

    /// Fold one row's arguments into the accumulator.
    fn step(&self, accumulator: Value, args: &[Value]) -> Result<Value>;

    /// Compute the group's result; defaults to the accumulator itself.
    fn finish(&self, accumulator: Value) -> Result<Value> {
        Ok(accumulator)
    }
}

struct ScalarData<F> {
    f: F,
    int64: bool,
}

struct AggregateData<A> {
    aggregate: A,
    int64: bool,
}

pub(crate) fn create_scalar<F>(
    conn: &Arc<ConnectionInner>,
    name: &str,
    arity: u8,
    options: FunctionOptions,
    f: F,
) -> Result<()>
where
    F: Fn(&[Value]) -> Result<Value> + 'static,
{
    let handle = conn.handle()?;

    let name = CString::new(name)
        .map_err(|_| Error::Function("function name must not contain nul bytes".into()))?;

    let data = Box::into_raw(Box::new(ScalarData {
        f,
        int64: conn.int64,
    }));

    // the engine owns `data` from here on; xDestroy runs even when
    // registration itself fails
    // <https://www.sqlite.org/c3ref/create_function.html>
    let status = unsafe {
        sqlite3_create_function_v2(
            handle.as_ptr(),
            name.as_ptr(),
            options.sqlite_arity(arity),
            options.sqlite_flags(),
            data as *mut c_void,
            Some(scalar_call::<F>),
            None,
            None,
            Some(drop_boxed::<ScalarData<F>>),
        )
    };

    if status != SQLITE_OK {
        return Err(Error::Sqlite(handle.last_error()));
    }

    Ok(())
}

pub(crate) fn create_aggregate<A>(
    conn: &Arc<ConnectionInner>,
    name: &str,
    arity: u8,
    options: FunctionOptions,
    aggregate: A,
) -> Result<()>
where
    A: Aggregate + 'static,
{
    let handle = conn.handle()?;

    let name = CString::new(name)
        .map_err(|_| Error::Function("function name must not contain nul bytes".into()))?;

    let data = Box::into_raw(Box::new(AggregateData {
        aggregate,
        int64: conn.int64,
    }));

    let status = unsafe {
        sqlite3_create_function_v2(
            handle.as_ptr(),
            name.as_ptr(),
            options.sqlite_arity(arity),
            options.sqlite_flags(),
            data as *mut c_void,
            None,
            Some(aggregate_step::<A>),
            Some(aggregate_final::<A>),
            Some(drop_boxed::<AggregateData<A>>),
        )
    };

    if status != SQLITE_OK {
        return Err(Error::Sqlite(handle.last_error()));
    }

    Ok(())
}

unsafe extern "C" fn drop_boxed<T>(data: *mut c_void) {
    drop(Box::from_raw(data.cast::<T>()));
}

unsafe fn decode_args(argc: c_int, argv: *mut *mut sqlite3_value, int64: bool) -> Vec<Value> {
    if argc <= 0 || argv.is_null() {
        return Vec::new();
    }

    std::slice::from_raw_parts(argv, argc as usize)
        .iter()
        .map(|value| decode_raw(*value, int64))
        .collect()
}

/// Encode a host value as the function result.
///
/// Only null, numbers, 64-bit integers, text, and blobs are representable;
/// anything else is a function error for the caller to report.
unsafe fn set_result(ctx: *mut sqlite3_context, value: &Value) -> Result<()> {
    match value {
        Value::Null => sqlite3_result_null(ctx),

        Value::Integer(v) | Value::BigInt(v) => sqlite3_result_int64(ctx, *v),

        Value::Real(v) => sqlite3_result_double(ctx, *v),

        Value::Text(text) => {
            // a non-null pointer keeps the empty string distinct from NULL
            static EMPTY: &[u8] = b"\0";

            let ptr = if text.is_empty() {
                EMPTY.as_ptr()
            } else {
                text.as_ptr()
            };

            sqlite3_result_text(
                ctx,
                ptr as *const c_char,
                text.len() as c_int,
                SQLITE_TRANSIENT(),
            );
        }

        Value::Blob(blob) => {
            static EMPTY: &[u8] = b"\0";

            let ptr = if blob.is_empty() {
                EMPTY.as_ptr()
            } else {
                blob.as_ptr()
            };

            sqlite3_result_blob(
                ctx,
                ptr as *const c_void,
                blob.len() as c_int,
                SQLITE_TRANSIENT(),
            );
        }

        Value::DateTime(_) | Value::Json(_) => {
            return Err(Error::Function(format!(
                "unsupported function result: {:?}",
                value
            )));
        }
    }

    Ok(())
}

unsafe fn set_error(ctx: *mut sqlite3_context, message: &str) {
    sqlite3_result_error(ctx, message.as_ptr() as *const c_char, message.len() as c_int);
}

unsafe extern "C" fn scalar_call<F>(
    ctx: *mut sqlite3_context,
    argc: c_int,
    argv: *mut *mut sqlite3_value,
) where
    F: Fn(&[Value]) -> Result<Value> + 'static,
{
    let data = &*(sqlite3_user_data(ctx) as *const ScalarData<F>);
    let args = decode_args(argc, argv, data.int64);

    match catch_unwind(AssertUnwindSafe(|| (data.f)(&args))) {
        Ok(Ok(value)) => {
            if let Err(error) = set_result(ctx, &value) {
                set_error(ctx, &error.to_string());
            }
        }
        Ok(Err(error)) => set_error(ctx, &error.to_string()),
        Err(_) => set_error(ctx, "user function panicked"),
    }
}

unsafe extern "C" fn aggregate_step<A>(
    ctx: *mut sqlite3_context,
    argc: c_int,
    argv: *mut *mut sqlite3_value,
) where
    A: Aggregate + 'static,
{
    let data = &*(sqlite3_user_data(ctx) as *const AggregateData<A>);

    // per-group scratch holds a boxed accumulator, seeded on first use
    // <https://www.sqlite.org/c3ref/aggregate_context.html>
    let slot =
        sqlite3_aggregate_context(ctx, std::mem::size_of::<*mut Value>() as c_int) as *mut *mut Value;

    if slot.is_null() {
        set_error(ctx, "out of memory allocating aggregate context");
        return;
    }

    if (*slot).is_null() {
        let seed = match catch_unwind(AssertUnwindSafe(|| data.aggregate.start())) {
            Ok(seed) => seed,

            Err(_) => {
                set_error(ctx, "user aggregate panicked");
                return;
            }
        };

        *slot = Box::into_raw(Box::new(seed));
    }

    let args = decode_args(argc, argv, data.int64);
    let accumulator = std::mem::replace(&mut **slot, Value::Null);

    match catch_unwind(AssertUnwindSafe(|| data.aggregate.step(accumulator, &args))) {
        Ok(Ok(next)) => **slot = next,
        Ok(Err(error)) => set_error(ctx, &error.to_string()),
        Err(_) => set_error(ctx, "user aggregate panicked"),
    }
}

unsafe extern "C" fn aggregate_final<A>(ctx: *mut sqlite3_context)
where
    A: Aggregate + 'static,
{
    let data = &*(sqlite3_user_data(ctx) as *const AggregateData<A>);

    // zero size: look up the existing scratch without allocating
    let slot = sqlite3_aggregate_context(ctx, 0) as *mut *mut Value;

    let accumulator = if slot.is_null() || (*slot).is_null() {
        // no rows reached the step callback; fall back to the seed
        match catch_unwind(AssertUnwindSafe(|| data.aggregate.start())) {
            Ok(seed) => seed,

            Err(_) => {
                set_error(ctx, "user aggregate panicked");
                return;
            }
        }
    } else {
        let accumulator = *Box::from_raw(*slot);
        *slot = std::ptr::null_mut();

        accumulator
    };

    match catch_unwind(AssertUnwindSafe(|| data.aggregate.finish(accumulator))) {
        Ok(Ok(value)) => {
            if let Err(error) = set_result(ctx, &value) {
                set_error(ctx, &error.to_string());
            }
        }
        Ok(Err(error)) => set_error(ctx, &error.to_string()),
        Err(_) => set_error(ctx, "user aggregate panicked"),
    }
}
