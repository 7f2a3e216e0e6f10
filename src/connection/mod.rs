//! A connection to a SQLite database.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ffi::CString;
use std::fmt::{self, Debug, Formatter};
use std::os::raw::c_void;
use std::ptr::{null, null_mut, NonNull};
use std::sync::{Arc, Weak};
use std::time::Duration;

use libsqlite3_sys::{
    sqlite3_complete, sqlite3_free, sqlite3_load_extension, sqlite3_prepare_v3,
    sqlite3_serialize, SQLITE_DONE, SQLITE_OK, SQLITE_PREPARE_PERSISTENT, SQLITE_ROW,
};

use crate::blob::{Blob, BlobInner};
use crate::error::{Error, Result};
use crate::options::OpenOptions;
use crate::statement::{Statement, StatementHandle, StatementInner};
use crate::transaction::Transaction;
use crate::value::{Params, Value};

mod establish;
pub(crate) mod function;
pub(crate) mod handle;

pub(crate) use handle::ConnectionHandle;

use self::function::{Aggregate, FunctionOptions};

/// An open database.
///
/// `Connection` is a cheap clonable handle over shared state; the connection
/// and everything derived from it belong to a single task. Closing — whether
/// through [`close`](Connection::close) or by dropping the last handle — is
/// authoritative: attached statements are finalized and open blob handles are
/// closed first.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnectionInner>,
}

pub(crate) struct ConnectionInner {
    handle: Cell<Option<ConnectionHandle>>,
    path: String,

    /// Decode out-of-safe-range INTEGER columns as explicit 64-bit values.
    pub(crate) int64: bool,

    /// Exactly one caller uses this connection; statements may memoize.
    pub(crate) unsafe_concurrency: bool,

    load_extension_enabled: bool,

    /// Every live statement prepared on this connection, so close can
    /// finalize stragglers. Weak: a statement must never keep its
    /// connection alive.
    statements: RefCell<Vec<Weak<StatementInner>>>,

    /// Open incremental-blob handles, closed alongside the connection.
    blobs: RefCell<Vec<Weak<BlobInner>>>,

    /// Transaction-control statements (BEGIN variants, COMMIT, ROLLBACK and
    /// the savepoint family), prepared once and reused.
    tx_statements: RefCell<HashMap<&'static str, StatementHandle>>,
}

impl Connection {
    /// Open (or create) the database at `path` with default options.
    pub fn open(path: &str) -> Result<Self> {
        Self::open_with(path, OpenOptions::new())
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::open_with(":memory:", OpenOptions::new().memory(true))
    }

    /// Open the database at `path` as configured by `options`.
    pub fn open_with(path: &str, options: OpenOptions) -> Result<Self> {
        let handle = establish::establish(path, &options)?;

        Ok(Self {
            inner: Arc::new(ConnectionInner {
                handle: Cell::new(Some(handle)),
                path: path.to_owned(),
                int64: options.int64,
                unsafe_concurrency: options.unsafe_concurrency,
                load_extension_enabled: options.enable_load_extension,
                statements: RefCell::new(Vec::new()),
                blobs: RefCell::new(Vec::new()),
                tx_statements: RefCell::new(HashMap::new()),
            }),
        })
    }

    /// The path this database was opened with.
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Rows changed by the most recent statement.
    pub fn changes(&self) -> Result<u64> {
        Ok(self.inner.handle()?.changes())
    }

    /// Rows changed since the connection opened.
    pub fn total_changes(&self) -> Result<u64> {
        Ok(self.inner.handle()?.total_changes())
    }

    /// Rowid of the most recent successful insert.
    pub fn last_insert_rowid(&self) -> Result<i64> {
        Ok(self.inner.handle()?.last_insert_rowid())
    }

    /// True while the connection is outside an explicit transaction.
    pub fn autocommit(&self) -> Result<bool> {
        Ok(self.inner.handle()?.autocommit())
    }

    /// Compile a single statement.
    pub fn prepare(&self, sql: &str) -> Result<Statement> {
        Statement::prepare(&self.inner, sql)
    }

    /// Run SQL to completion and report the change count.
    ///
    /// Without parameters the whole string runs through the multi-statement
    /// exec primitive; with parameters it is prepared as a one-shot single
    /// statement, bound, and stepped to completion.
    pub fn exec(&self, sql: &str, params: impl Into<Params>) -> Result<u64> {
        let params = params.into();

        if params.is_empty() {
            self.inner.handle()?.exec(sql)?;

            return self.changes();
        }

        let statement = self.prepare(sql)?;
        let changes = statement.run(params);
        statement.finalize();

        changes
    }

    /// Run zero or more semicolon-separated statements, discarding any rows.
    pub fn exec_batch(&self, sql: &str) -> Result<()> {
        self.inner.handle()?.exec(sql)
    }

    /// Serialize an attached database (`"main"` by default) into its on-disk
    /// image.
    ///
    /// <https://www.sqlite.org/c3ref/serialize.html>
    pub fn serialize(&self, schema: Option<&str>) -> Result<Vec<u8>> {
        let handle = self.inner.handle()?;

        let schema = CString::new(schema.unwrap_or("main"))
            .map_err(|_| Error::Misuse("schema name must not contain nul bytes"))?;

        let mut size: libsqlite3_sys::sqlite3_int64 = 0;

        let data = unsafe {
            sqlite3_serialize(handle.as_ptr(), schema.as_ptr(), &mut size, 0)
        };

        if data.is_null() {
            return Err(Error::Sqlite(handle.last_error()));
        }

        let image = unsafe { std::slice::from_raw_parts(data, size as usize).to_vec() };

        unsafe { sqlite3_free(data as *mut c_void) };

        Ok(image)
    }

    /// Open an incremental handle onto one BLOB cell, addressed by schema
    /// (`None` means `"main"`), table, column, and rowid.
    pub fn open_blob(
        &self,
        database: Option<&str>,
        table: &str,
        column: &str,
        row: i64,
        readonly: bool,
    ) -> Result<Blob> {
        Blob::open(&self.inner, database.unwrap_or("main"), table, column, row, readonly)
    }

    /// Register a scalar function taking exactly `arity` arguments
    /// ([`FunctionOptions::varargs`] lifts the restriction).
    ///
    /// The function receives decoded argument values and its result is
    /// encoded back through the same codec; an `Err` surfaces as a SQL error
    /// in the invoking statement.
    pub fn create_function<F>(
        &self,
        name: &str,
        arity: u8,
        options: FunctionOptions,
        f: F,
    ) -> Result<()>
    where
        F: Fn(&[Value]) -> Result<Value> + 'static,
    {
        function::create_scalar(&self.inner, name, arity, options, f)
    }

    /// Register an aggregate function taking exactly `arity` arguments
    /// ([`FunctionOptions::varargs`] lifts the restriction).
    pub fn create_aggregate<A>(
        &self,
        name: &str,
        arity: u8,
        options: FunctionOptions,
        aggregate: A,
    ) -> Result<()>
    where
        A: Aggregate + 'static,
    {
        function::create_aggregate(&self.inner, name, arity, options, aggregate)
    }

    /// Load a runtime-loadable extension. Fails unless the connection was
    /// opened with [`OpenOptions::enable_load_extension`].
    ///
    /// <https://www.sqlite.org/c3ref/load_extension.html>
    pub fn load_extension(&self, file: &str, entry_point: Option<&str>) -> Result<()> {
        if !self.inner.load_extension_enabled {
            return Err(Error::Extension(
                "extension loading is disabled for this connection".into(),
            ));
        }

        let handle = self.inner.handle()?;

        let file = CString::new(file)
            .map_err(|_| Error::Extension("extension path must not contain nul bytes".into()))?;

        let entry_point = match entry_point {
            Some(name) => Some(CString::new(name).map_err(|_| {
                Error::Extension("entry point must not contain nul bytes".into())
            })?),
            None => None,
        };

        let mut errmsg = null_mut();

        let status = unsafe {
            sqlite3_load_extension(
                handle.as_ptr(),
                file.as_ptr(),
                entry_point.as_ref().map_or(null(), |name| name.as_ptr()),
                &mut errmsg,
            )
        };

        if status != SQLITE_OK {
            let message = if errmsg.is_null() {
                handle.last_error().to_string()
            } else {
                let message = unsafe { handle::cstr_to_string(errmsg) };
                unsafe { sqlite3_free(errmsg as *mut c_void) };
                message
            };

            return Err(Error::Extension(message));
        }

        Ok(())
    }

    /// Wrap `f` in a transaction controller; see [`Transaction`].
    pub fn transaction<F>(&self, f: F) -> Transaction<F> {
        Transaction::new(self.clone(), f)
    }

    /// Sleep-and-retry for up to `timeout` when a competing connection holds
    /// a conflicting lock.
    pub fn busy_timeout(&self, timeout: Duration) -> Result<()> {
        let ms = i32::try_from(timeout.as_millis())
            .map_err(|_| Error::Misuse("busy timeout is out of range"))?;

        establish::set_busy_timeout(&self.inner.handle()?, ms)
    }

    /// True when `sql` ends in a complete SQL statement.
    ///
    /// <https://www.sqlite.org/c3ref/complete.html>
    pub fn is_complete(&self, sql: &str) -> bool {
        let Ok(sql) = CString::new(sql) else {
            return false;
        };

        unsafe { sqlite3_complete(sql.as_ptr()) != 0 }
    }

    /// Finalize every attached statement, close open blob handles, and close
    /// the database. Idempotent; further operations report misuse.
    pub fn close(&self) {
        self.inner.close();
    }

    /// The connection has not been closed yet.
    pub fn is_open(&self) -> bool {
        self.inner.handle().is_ok()
    }
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("path", &self.inner.path)
            .finish_non_exhaustive()
    }
}

impl ConnectionInner {
    pub(crate) fn handle(&self) -> Result<ConnectionHandle> {
        self.handle.get().ok_or(Error::Misuse("connection is closed"))
    }

    pub(crate) fn register_statement(&self, statement: &Arc<StatementInner>) {
        let mut statements = self.statements.borrow_mut();

        statements.retain(|weak| weak.strong_count() > 0);
        statements.push(Arc::downgrade(statement));
    }

    pub(crate) fn deregister_statement(&self, statement: &Arc<StatementInner>) {
        let target = Arc::as_ptr(statement);

        self.statements
            .borrow_mut()
            .retain(|weak| weak.strong_count() > 0 && weak.as_ptr() != target);
    }

    pub(crate) fn register_blob(&self, blob: &Arc<BlobInner>) {
        let mut blobs = self.blobs.borrow_mut();

        blobs.retain(|weak| weak.strong_count() > 0);
        blobs.push(Arc::downgrade(blob));
    }

    pub(crate) fn deregister_blob(&self, blob: &Arc<BlobInner>) {
        let target = Arc::as_ptr(blob);

        self.blobs
            .borrow_mut()
            .retain(|weak| weak.strong_count() > 0 && weak.as_ptr() != target);
    }

    pub(crate) fn autocommit(&self) -> Result<bool> {
        Ok(self.handle()?.autocommit())
    }

    /// Run one cached transaction-control statement to completion.
    pub(crate) fn run_tx_statement(&self, sql: &'static str) -> Result<()> {
        let statement = self.tx_statement(sql)?;

        statement.reset();

        loop {
            match statement.step() {
                SQLITE_ROW => continue,
                SQLITE_DONE => break,

                _ => {
                    let error = Error::Step(statement.last_error());
                    statement.reset();
                    return Err(error);
                }
            }
        }

        statement.reset();

        Ok(())
    }

    fn tx_statement(&self, sql: &'static str) -> Result<StatementHandle> {
        if let Some(statement) = self.tx_statements.borrow().get(sql) {
            return Ok(*statement);
        }

        let handle = self.handle()?;

        let mut statement = null_mut();

        // <https://www.sqlite.org/c3ref/prepare.html>
        let status = unsafe {
            sqlite3_prepare_v3(
                handle.as_ptr(),
                sql.as_ptr() as *const std::os::raw::c_char,
                sql.len() as i32,
                SQLITE_PREPARE_PERSISTENT as u32,
                &mut statement,
                null_mut(),
            )
        };

        if status != SQLITE_OK {
            return Err(Error::Prepare(handle.last_error()));
        }

        let statement = StatementHandle::new(
            NonNull::new(statement).expect("transaction statements are never empty"),
        );

        self.tx_statements.borrow_mut().insert(sql, statement);

        Ok(statement)
    }

    /// The authoritative teardown path, shared by `close()` and drop.
    pub(crate) fn close(&self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        for (_, statement) in self.tx_statements.borrow_mut().drain() {
            statement.finalize();
        }

        for statement in self.statements.borrow_mut().drain(..) {
            if let Some(statement) = statement.upgrade() {
                statement.finalize_handle();
            }
        }

        for blob in self.blobs.borrow_mut().drain(..) {
            if let Some(blob) = blob.upgrade() {
                blob.close_handle();
            }
        }

        log::debug!("closing database {:?}", self.path);

        handle.close();
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.close();
    }
}
