//! Error and Result types.

use std::ffi::CStr;
use std::fmt::{self, Display, Formatter};
use std::os::raw::c_int;

use libsqlite3_sys::{sqlite3, sqlite3_errmsg, sqlite3_errstr, sqlite3_extended_errcode};

/// A specialized `Result` type for this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All the ways a database operation can fail.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The database could not be opened. The partially-created handle has
    /// already been closed by the time this surfaces.
    #[error("unable to open database: {0}")]
    Open(#[source] SqliteError),

    /// A SQL string failed to compile into a prepared statement.
    #[error("error preparing statement: {0}")]
    Prepare(#[source] SqliteError),

    /// A parameter had an unsupported shape or an unknown name.
    #[error("bind error: {0}")]
    Bind(String),

    /// A step of the statement state machine returned neither a row nor
    /// completion.
    #[error("error stepping statement: {0}")]
    Step(#[source] SqliteError),

    /// An incremental BLOB operation failed.
    #[error("blob error: {0}")]
    Blob(#[source] SqliteError),

    /// A user-defined function reported failure; this surfaces as a SQL
    /// error in the statement that invoked it.
    #[error("user function error: {0}")]
    Function(String),

    /// Extension loading failed, or is disabled on this connection.
    #[error("extension error: {0}")]
    Extension(String),

    /// An operation against a closed connection, a finalized statement, or a
    /// statement whose parameters are already frozen.
    #[error("misuse: {0}")]
    Misuse(&'static str),

    /// Any other engine-reported failure (serialization, configuration, …).
    #[error("sqlite error: {0}")]
    Sqlite(#[source] SqliteError),
}

impl Error {
    /// The engine result code carried by this error, if any.
    pub fn code(&self) -> Option<c_int> {
        match self {
            Error::Open(err)
            | Error::Prepare(err)
            | Error::Step(err)
            | Error::Blob(err)
            | Error::Sqlite(err) => Some(err.code()),

            _ => None,
        }
    }
}

/// A result code and message pair reported by the SQLite engine.
#[derive(Debug)]
pub struct SqliteError {
    code: c_int,
    message: String,
}

impl SqliteError {
    /// Read the most recent error from a live database handle.
    ///
    /// <https://www.sqlite.org/c3ref/errcode.html>
    pub(crate) fn new(handle: *mut sqlite3) -> Self {
        let code = unsafe { sqlite3_extended_errcode(handle) };

        let message = unsafe {
            let msg = sqlite3_errmsg(handle);
            debug_assert!(!msg.is_null());

            CStr::from_ptr(msg).to_string_lossy().into_owned()
        };

        Self { code, message }
    }

    /// Build an error from a bare result code, without a handle to consult.
    /// The message is the engine's English-language description of the code.
    ///
    /// <https://www.sqlite.org/c3ref/errcode.html>
    pub(crate) fn from_code(code: c_int) -> Self {
        let message = unsafe {
            let msg = sqlite3_errstr(code);
            debug_assert!(!msg.is_null());

            CStr::from_ptr(msg).to_string_lossy().into_owned()
        };

        Self { code, message }
    }

    /// The extended result code.
    pub fn code(&self) -> c_int {
        self.code
    }

    /// The engine-provided message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for SqliteError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "(code: {}) {}", self.code, self.message)
    }
}

impl std::error::Error for SqliteError {}
