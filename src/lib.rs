//! An ergonomic, synchronous SQLite client built directly on the SQLite
//! C API.
//!
//! A [`Connection`] produces prepared [`Statement`]s; statements bind host
//! [`Value`]s, step, and decode rows either as ordered column sequences or as
//! name-to-value [`Row`] mappings. On top of that sit savepoint-aware
//! [transactions](Transaction), scalar and [aggregate](Aggregate)
//! user-defined functions, and incremental [`Blob`] I/O.
//!
//! ```no_run
//! use squill::{params, Connection};
//!
//! fn main() -> squill::Result<()> {
//!     let db = Connection::open_in_memory()?;
//!
//!     db.exec_batch("create table users (name text, age integer)")?;
//!     db.exec("insert into users values (?, ?)", params!["alice", 33])?;
//!
//!     let stmt = db.prepare("select name, age from users where age > ?")?;
//!
//!     for row in stmt.iter(params![18])? {
//!         let row = row?;
//!         println!("{:?} is {:?}", row.get_named("name"), row.get_named("age"));
//!     }
//!
//!     Ok(())
//! }
//! ```

// SQLite is a C library; everything below the public surface crosses FFI.
// Unsafe blocks carry pointers to the SQLite docs for the invariants they
// rely on.

use std::ffi::CStr;

use libsqlite3_sys::{sqlite3_libversion, sqlite3_sourceid};

mod blob;
mod connection;
mod error;
mod options;
mod row;
mod statement;
mod transaction;
mod value;

pub use blob::{Blob, BlobChunks};
pub use connection::function::{Aggregate, FunctionOptions};
pub use connection::Connection;
pub use error::{Error, Result, SqliteError};
pub use options::{OpenFlags, OpenOptions};
pub use row::Row;
pub use statement::{Rows, Statement};
pub use transaction::{Transaction, TransactionBehavior};
pub use value::{Params, Value};

/// The run-time SQLite library version, e.g. `"3.38.2"`.
///
/// <https://www.sqlite.org/c3ref/libversion.html>
pub fn version() -> &'static str {
    unsafe { CStr::from_ptr(sqlite3_libversion()) }
        .to_str()
        .unwrap()
}

/// The check-in identifier of the run-time SQLite library.
pub fn source_id() -> &'static str {
    unsafe { CStr::from_ptr(sqlite3_sourceid()) }
        .to_str()
        .unwrap()
}
