//! Prepared statements: bind, step, decode, reset, finalize.

use std::cell::{Cell, RefCell};
use std::os::raw::c_char;
use std::ptr::{null_mut, NonNull};
use std::sync::{Arc, Weak};

use libsqlite3_sys::{
    sqlite3_prepare_v3, SQLITE_BLOB, SQLITE_DONE, SQLITE_FLOAT, SQLITE_INTEGER, SQLITE_OK,
    SQLITE_ROW, SQLITE_TEXT,
};

use crate::connection::ConnectionInner;
use crate::error::{Error, Result};
use crate::row::Row;
use crate::value::{decode_integer, decode_text, Params, PinnedBuffers, Value};

mod handle;

pub(crate) use handle::StatementHandle;

/// A single SQL statement compiled into the engine's binary form, ready to be
/// bound, stepped, and decoded.
///
/// Every data-returning call starts from a reset statement; when parameters
/// have not been frozen with [`bind`](Statement::bind), stale bindings and
/// their pinned buffers are dropped as well. Finalization happens explicitly
/// through [`finalize`](Statement::finalize), on drop, or — authoritatively —
/// when the owning connection closes.
pub struct Statement {
    pub(crate) inner: Arc<StatementInner>,
}

pub(crate) struct StatementInner {
    handle: Cell<Option<StatementHandle>>,
    conn: Weak<ConnectionInner>,

    /// Snapshot of `sqlite3_bind_parameter_count` at prepare time.
    param_count: usize,

    /// Parameters were frozen by an explicit `bind`.
    bound: Cell<bool>,

    /// The statement may invoke registered host functions while stepping;
    /// per-statement memoization stays off while this is set.
    callback: Cell<bool>,

    /// Owned text/blob payloads the engine currently borrows as bindings.
    pins: RefCell<PinnedBuffers>,

    /// Memoized column-name header; populated only under the connection's
    /// unsafe-concurrency promise.
    column_names: RefCell<Option<Arc<[String]>>>,
}

impl Statement {
    /// Compile the first statement of `sql` against `conn` and register it so
    /// that connection close can finalize it.
    pub(crate) fn prepare(conn: &Arc<ConnectionInner>, sql: &str) -> Result<Self> {
        let db = conn.handle()?;

        if sql.len() > i32::MAX as usize {
            return Err(Error::Misuse("sql is longer than the engine can accept"));
        }

        let mut statement = null_mut();

        // only the first statement is compiled; the tail is not consulted
        // <https://www.sqlite.org/c3ref/prepare.html>
        let status = unsafe {
            sqlite3_prepare_v3(
                db.as_ptr(),
                sql.as_ptr() as *const c_char,
                sql.len() as i32,
                0,
                &mut statement,
                null_mut(),
            )
        };

        if status != SQLITE_OK {
            return Err(Error::Prepare(db.last_error()));
        }

        let statement = match NonNull::new(statement) {
            Some(ptr) => StatementHandle::new(ptr),

            // whitespace or comments compile to nothing
            None => return Err(Error::Misuse("sql contained no statement")),
        };

        log::trace!("prepared statement {:?}", statement.sql());

        let inner = Arc::new(StatementInner {
            param_count: statement.bind_parameter_count(),
            handle: Cell::new(Some(statement)),
            conn: Arc::downgrade(conn),
            bound: Cell::new(false),
            callback: Cell::new(false),
            pins: RefCell::new(PinnedBuffers::default()),
            column_names: RefCell::new(None),
        });

        conn.register_statement(&inner);

        Ok(Self { inner })
    }

    /// Freeze the parameter set for every subsequent call.
    ///
    /// Fails when the parameters are already frozen.
    pub fn bind(&self, params: impl Into<Params>) -> Result<&Self> {
        if self.inner.bound.get() {
            return Err(Error::Misuse("statement parameters are already bound"));
        }

        let handle = self.inner.handle()?;

        handle.reset();
        handle.clear_bindings();
        self.inner.pins.borrow_mut().clear();

        self.inner.apply_params(&handle, params.into())?;
        self.inner.bound.set(true);

        Ok(self)
    }

    /// Step the statement to completion, discarding any rows, and return the
    /// connection's change counter.
    pub fn run(&self, params: impl Into<Params>) -> Result<u64> {
        let (conn, handle) = self.inner.start(params.into())?;

        loop {
            match handle.step() {
                SQLITE_ROW => continue,
                SQLITE_DONE => break,

                _ => {
                    handle.reset();
                    return Err(Error::Step(handle.last_error()));
                }
            }
        }

        handle.reset();

        Ok(conn.handle()?.changes())
    }

    /// All rows, each as an ordered sequence of decoded columns.
    pub fn values(&self, params: impl Into<Params>) -> Result<Vec<Vec<Value>>> {
        let (conn, handle) = self.inner.start(params.into())?;
        let mut rows = Vec::new();

        loop {
            match handle.step() {
                SQLITE_ROW => rows.push(read_values(&handle, conn.int64)),
                SQLITE_DONE => break,

                _ => {
                    handle.reset();
                    return Err(Error::Step(handle.last_error()));
                }
            }
        }

        handle.reset();

        Ok(rows)
    }

    /// All rows, each as a column-name-to-value mapping.
    pub fn all(&self, params: impl Into<Params>) -> Result<Vec<Row>> {
        let (conn, handle) = self.inner.start(params.into())?;
        let columns = self.inner.column_header(&conn, &handle);
        let mut rows = Vec::new();

        loop {
            match handle.step() {
                SQLITE_ROW => rows.push(Row::new(
                    Arc::clone(&columns),
                    read_values(&handle, conn.int64),
                )),
                SQLITE_DONE => break,

                _ => {
                    handle.reset();
                    return Err(Error::Step(handle.last_error()));
                }
            }
        }

        handle.reset();

        Ok(rows)
    }

    /// The first row as a mapping, or `None` when the statement produces no
    /// rows. The statement is reset either way.
    pub fn get(&self, params: impl Into<Params>) -> Result<Option<Row>> {
        let (conn, handle) = self.inner.start(params.into())?;

        let row = match handle.step() {
            SQLITE_ROW => {
                let columns = self.inner.column_header(&conn, &handle);

                Some(Row::new(columns, read_values(&handle, conn.int64)))
            }

            SQLITE_DONE => None,

            _ => {
                handle.reset();
                return Err(Error::Step(handle.last_error()));
            }
        };

        handle.reset();

        Ok(row)
    }

    /// The first row as an ordered sequence, or `None` when the statement
    /// produces no rows.
    pub fn value(&self, params: impl Into<Params>) -> Result<Option<Vec<Value>>> {
        let (conn, handle) = self.inner.start(params.into())?;

        let row = match handle.step() {
            SQLITE_ROW => Some(read_values(&handle, conn.int64)),
            SQLITE_DONE => None,

            _ => {
                handle.reset();
                return Err(Error::Step(handle.last_error()));
            }
        };

        handle.reset();

        Ok(row)
    }

    /// Iterate rows lazily, one step per row. Exhausting (or dropping) the
    /// iterator resets the statement.
    pub fn iter(&self, params: impl Into<Params>) -> Result<Rows<'_>> {
        let (conn, handle) = self.inner.start(params.into())?;
        let columns = self.inner.column_header(&conn, &handle);

        Ok(Rows {
            statement: self,
            int64: conn.int64,
            columns,
            done: false,
        })
    }

    /// Mark this statement as one that invokes registered host functions
    /// while stepping. Disables per-statement memoization for the duration.
    pub fn enable_callback(&self) -> &Self {
        self.inner.callback.set(true);
        self.inner.column_names.borrow_mut().take();
        self
    }

    /// The original SQL text.
    pub fn sql(&self) -> Result<String> {
        Ok(self.inner.handle()?.sql())
    }

    /// The SQL text with bound parameters expanded into literals.
    pub fn expanded_sql(&self) -> Result<Option<String>> {
        Ok(self.inner.handle()?.expanded_sql())
    }

    /// True when the statement makes no direct changes to the database.
    pub fn readonly(&self) -> Result<bool> {
        Ok(self.inner.handle()?.readonly())
    }

    /// Number of bind parameters in the compiled statement.
    pub fn bind_parameter_count(&self) -> usize {
        self.inner.param_count
    }

    /// Number of result columns.
    pub fn column_count(&self) -> Result<usize> {
        Ok(self.inner.handle()?.column_count())
    }

    /// Result column names, in column order.
    pub fn column_names(&self) -> Result<Vec<String>> {
        let handle = self.inner.handle()?;

        Ok((0..handle.column_count())
            .map(|index| handle.column_name(index))
            .collect())
    }

    /// Release the compiled statement. Idempotent; the statement is also
    /// finalized on drop and by connection close.
    pub fn finalize(&self) {
        if let Some(conn) = self.inner.conn.upgrade() {
            conn.deregister_statement(&self.inner);
        }

        self.inner.finalize_handle();
    }
}

impl StatementInner {
    fn handle(&self) -> Result<StatementHandle> {
        self.handle
            .get()
            .ok_or(Error::Misuse("statement is finalized"))
    }

    fn conn(&self) -> Result<Arc<ConnectionInner>> {
        self.conn
            .upgrade()
            .ok_or(Error::Misuse("connection is closed"))
    }

    /// Reset, drop stale unfrozen bindings, and apply `params`.
    fn start(&self, params: Params) -> Result<(Arc<ConnectionInner>, StatementHandle)> {
        let conn = self.conn()?;

        // reject a closed connection before touching the statement
        conn.handle()?;

        let handle = self.handle()?;

        handle.reset();

        if !self.bound.get() && self.param_count > 0 {
            handle.clear_bindings();
            self.pins.borrow_mut().clear();
        }

        self.apply_params(&handle, params)?;

        Ok((conn, handle))
    }

    fn apply_params(&self, handle: &StatementHandle, params: Params) -> Result<()> {
        if params.is_empty() {
            return Ok(());
        }

        if self.bound.get() {
            return Err(Error::Misuse("statement parameters are already bound"));
        }

        let mut pins = self.pins.borrow_mut();

        match params {
            Params::Empty => {}

            Params::Positional(values) => {
                if values.len() != self.param_count {
                    return Err(Error::Bind(format!(
                        "expected {} parameters, got {}",
                        self.param_count,
                        values.len()
                    )));
                }

                for (index, value) in values.iter().enumerate() {
                    value.bind(handle, (index + 1) as i32, &mut pins)?;
                }
            }

            Params::Named(values) => {
                for (name, value) in &values {
                    let index = resolve_parameter(handle, name).ok_or_else(|| {
                        let known: Vec<String> = (1..=self.param_count as i32)
                            .filter_map(|index| handle.bind_parameter_name(index))
                            .collect();

                        Error::Bind(format!(
                            "unknown bind parameter {:?} (statement has {:?})",
                            name, known
                        ))
                    })?;

                    value.bind(handle, index, &mut pins)?;
                }
            }
        }

        Ok(())
    }

    /// Shared column-name header for the rows of one call. Memoized only
    /// while the connection promises a single caller and the statement does
    /// not re-enter host code.
    fn column_header(&self, conn: &ConnectionInner, handle: &StatementHandle) -> Arc<[String]> {
        let memoize = conn.unsafe_concurrency && !self.callback.get();

        if memoize {
            if let Some(columns) = self.column_names.borrow().as_ref() {
                return Arc::clone(columns);
            }
        }

        let columns: Arc<[String]> = (0..handle.column_count())
            .map(|index| handle.column_name(index))
            .collect();

        if memoize {
            *self.column_names.borrow_mut() = Some(Arc::clone(&columns));
        }

        columns
    }

    /// Release the handle and pinned buffers without touching the registry.
    pub(crate) fn finalize_handle(&self) {
        if let Some(handle) = self.handle.take() {
            handle.finalize();
            self.pins.borrow_mut().clear();
        }
    }
}

impl Drop for StatementInner {
    fn drop(&mut self) {
        // the registry entry, if any, is a dead weak reference by now and is
        // pruned on the connection's next sweep
        self.finalize_handle();
    }
}

/// Resolve a bind-parameter name to its 1-based index, applying the automatic
/// `:` prefix when the name carries none of `:`, `@`, `$`.
fn resolve_parameter(handle: &StatementHandle, name: &str) -> Option<i32> {
    if name.starts_with([':', '@', '$']) {
        return handle.bind_parameter_index(name);
    }

    handle.bind_parameter_index(&format!(":{}", name))
}

/// Decode the current row, column by column.
fn read_values(handle: &StatementHandle, int64_mode: bool) -> Vec<Value> {
    (0..handle.column_count())
        .map(|index| match handle.column_type(index) {
            SQLITE_INTEGER => decode_integer(handle.column_int64(index), int64_mode),

            SQLITE_FLOAT => Value::Real(handle.column_double(index)),

            SQLITE_TEXT => decode_text(handle.column_text(index), handle.column_subtype(index)),

            SQLITE_BLOB => Value::Blob(handle.column_blob(index)),

            // SQLITE_NULL, or anything unrecognized
            _ => Value::Null,
        })
        .collect()
}

/// Lazy row iterator returned by [`Statement::iter`].
pub struct Rows<'s> {
    statement: &'s Statement,
    int64: bool,
    columns: Arc<[String]>,
    done: bool,
}

impl Iterator for Rows<'_> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let handle = match self.statement.inner.handle() {
            Ok(handle) => handle,

            Err(err) => {
                self.done = true;
                return Some(Err(err));
            }
        };

        match handle.step() {
            SQLITE_ROW => Some(Ok(Row::new(
                Arc::clone(&self.columns),
                read_values(&handle, self.int64),
            ))),

            SQLITE_DONE => {
                self.done = true;
                handle.reset();
                None
            }

            _ => {
                self.done = true;
                let error = Error::Step(handle.last_error());
                handle.reset();
                Some(Err(error))
            }
        }
    }
}

impl Drop for Rows<'_> {
    fn drop(&mut self) {
        if !self.done {
            if let Ok(handle) = self.statement.inner.handle() {
                handle.reset();
            }
        }
    }
}
