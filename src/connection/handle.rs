use std::ffi::{CStr, CString};
use std::os::raw::c_void;
use std::ptr::{null_mut, NonNull};

use libsqlite3_sys::{
    sqlite3, sqlite3_changes, sqlite3_close_v2, sqlite3_exec, sqlite3_free,
    sqlite3_get_autocommit, sqlite3_last_insert_rowid, sqlite3_total_changes, SQLITE_OK,
};

use crate::error::{Error, Result, SqliteError};

/// Thin typed wrapper around a raw `sqlite3` database handle.
///
/// Closing is explicit; the owning connection state decides when, so that
/// attached statements can be finalized first.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConnectionHandle(NonNull<sqlite3>);

impl ConnectionHandle {
    pub(crate) unsafe fn new(ptr: *mut sqlite3) -> Self {
        Self(NonNull::new_unchecked(ptr))
    }

    pub(crate) fn as_ptr(&self) -> *mut sqlite3 {
        self.0.as_ptr()
    }

    pub(crate) fn last_error(&self) -> SqliteError {
        SqliteError::new(self.as_ptr())
    }

    /// Number of rows changed by the most recent statement.
    ///
    /// <https://www.sqlite.org/c3ref/changes.html>
    pub(crate) fn changes(&self) -> u64 {
        unsafe { sqlite3_changes(self.as_ptr()) as u64 }
    }

    /// <https://www.sqlite.org/c3ref/total_changes.html>
    pub(crate) fn total_changes(&self) -> u64 {
        unsafe { sqlite3_total_changes(self.as_ptr()) as u64 }
    }

    /// <https://www.sqlite.org/c3ref/last_insert_rowid.html>
    pub(crate) fn last_insert_rowid(&self) -> i64 {
        unsafe { sqlite3_last_insert_rowid(self.as_ptr()) }
    }

    /// True while the connection is outside an explicit transaction.
    ///
    /// <https://www.sqlite.org/c3ref/get_autocommit.html>
    pub(crate) fn autocommit(&self) -> bool {
        unsafe { sqlite3_get_autocommit(self.as_ptr()) != 0 }
    }

    /// Run zero or more semicolon-separated statements, discarding rows.
    ///
    /// <https://www.sqlite.org/c3ref/exec.html>
    pub(crate) fn exec(&self, sql: &str) -> Result<()> {
        let sql = CString::new(sql)
            .map_err(|_| Error::Misuse("sql must not contain nul bytes"))?;

        let mut errmsg = null_mut();

        let status = unsafe {
            sqlite3_exec(self.as_ptr(), sql.as_ptr(), None, null_mut(), &mut errmsg)
        };

        if !errmsg.is_null() {
            // the error text is duplicated into sqlite3_malloc'd memory
            unsafe { sqlite3_free(errmsg as *mut c_void) };
        }

        if status != SQLITE_OK {
            return Err(Error::Step(self.last_error()));
        }

        Ok(())
    }

    /// Close the handle. Deferred-close semantics: the engine waits for any
    /// statement not yet finalized.
    ///
    /// <https://www.sqlite.org/c3ref/close.html>
    pub(crate) fn close(self) {
        let status = unsafe { sqlite3_close_v2(self.as_ptr()) };

        if status != SQLITE_OK {
            log::warn!(
                "sqlite3_close_v2 returned {}",
                SqliteError::from_code(status)
            );
        }
    }
}

/// Convert a borrowed C string into an owned `String`, lossily.
pub(crate) unsafe fn cstr_to_string(ptr: *const std::os::raw::c_char) -> String {
    CStr::from_ptr(ptr).to_string_lossy().into_owned()
}
