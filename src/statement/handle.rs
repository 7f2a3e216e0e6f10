use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::ptr::NonNull;

use libsqlite3_sys::{
    sqlite3, sqlite3_bind_blob, sqlite3_bind_double, sqlite3_bind_int, sqlite3_bind_int64,
    sqlite3_bind_null, sqlite3_bind_parameter_count, sqlite3_bind_parameter_index,
    sqlite3_bind_parameter_name, sqlite3_bind_text, sqlite3_clear_bindings, sqlite3_column_blob,
    sqlite3_column_bytes, sqlite3_column_count, sqlite3_column_double, sqlite3_column_int64,
    sqlite3_column_name, sqlite3_column_text, sqlite3_column_type, sqlite3_column_value,
    sqlite3_db_handle, sqlite3_expanded_sql, sqlite3_finalize, sqlite3_free, sqlite3_reset,
    sqlite3_sql, sqlite3_step, sqlite3_stmt, sqlite3_stmt_readonly, sqlite3_value_subtype,
    SQLITE_STATIC,
};

use crate::error::SqliteError;

/// Thin typed wrapper around a raw `sqlite3_stmt`.
///
/// Lifecycle is managed by the owning [`Statement`](crate::Statement); the
/// wrapper itself is a plain copyable pointer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StatementHandle(NonNull<sqlite3_stmt>);

impl StatementHandle {
    pub(crate) fn new(ptr: NonNull<sqlite3_stmt>) -> Self {
        Self(ptr)
    }

    pub(crate) fn as_ptr(&self) -> *mut sqlite3_stmt {
        self.0.as_ptr()
    }

    /// The database connection this statement belongs to.
    ///
    /// <https://www.sqlite.org/c3ref/db_handle.html>
    pub(crate) fn db_handle(&self) -> *mut sqlite3 {
        unsafe { sqlite3_db_handle(self.as_ptr()) }
    }

    pub(crate) fn last_error(&self) -> SqliteError {
        SqliteError::new(self.db_handle())
    }

    // https://sqlite.org/c3ref/bind_blob.html

    pub(crate) fn bind_null(&self, index: c_int) -> c_int {
        unsafe { sqlite3_bind_null(self.as_ptr(), index) }
    }

    pub(crate) fn bind_int(&self, index: c_int, value: i32) -> c_int {
        unsafe { sqlite3_bind_int(self.as_ptr(), index, value) }
    }

    pub(crate) fn bind_int64(&self, index: c_int, value: i64) -> c_int {
        unsafe { sqlite3_bind_int64(self.as_ptr(), index, value) }
    }

    pub(crate) fn bind_double(&self, index: c_int, value: f64) -> c_int {
        unsafe { sqlite3_bind_double(self.as_ptr(), index, value) }
    }

    /// Bind UTF-8 text the caller keeps alive until the bindings are cleared;
    /// the engine borrows it (`SQLITE_STATIC`) instead of copying.
    pub(crate) fn bind_text(&self, index: c_int, bytes: &[u8]) -> c_int {
        unsafe {
            sqlite3_bind_text(
                self.as_ptr(),
                index,
                bytes.as_ptr() as *const c_char,
                bytes.len() as c_int,
                SQLITE_STATIC(),
            )
        }
    }

    /// Bind a zero-length text value. The pointer must be non-null or the
    /// engine would store NULL instead of the empty string.
    pub(crate) fn bind_empty_text(&self, index: c_int) -> c_int {
        static EMPTY: &[u8] = b"\0";

        unsafe {
            sqlite3_bind_text(
                self.as_ptr(),
                index,
                EMPTY.as_ptr() as *const c_char,
                0,
                SQLITE_STATIC(),
            )
        }
    }

    pub(crate) fn bind_blob(&self, index: c_int, bytes: &[u8]) -> c_int {
        // a zero-length blob still needs a non-null pointer to be stored as
        // an empty blob rather than NULL
        static EMPTY: &[u8] = b"\0";

        let ptr = if bytes.is_empty() {
            EMPTY.as_ptr()
        } else {
            bytes.as_ptr()
        };

        unsafe {
            sqlite3_bind_blob(
                self.as_ptr(),
                index,
                ptr as *const c_void,
                bytes.len() as c_int,
                SQLITE_STATIC(),
            )
        }
    }

    /// <https://www.sqlite.org/c3ref/bind_parameter_count.html>
    pub(crate) fn bind_parameter_count(&self) -> usize {
        unsafe { sqlite3_bind_parameter_count(self.as_ptr()) as usize }
    }

    /// Index of a named parameter, given the exact name including its
    /// `:`/`@`/`$` prefix. Zero means no match.
    ///
    /// <https://www.sqlite.org/c3ref/bind_parameter_index.html>
    pub(crate) fn bind_parameter_index(&self, name: &str) -> Option<c_int> {
        let name = CString::new(name).ok()?;
        let index = unsafe { sqlite3_bind_parameter_index(self.as_ptr(), name.as_ptr()) };

        (index != 0).then(|| index)
    }

    /// <https://www.sqlite.org/c3ref/bind_parameter_name.html>
    pub(crate) fn bind_parameter_name(&self, index: c_int) -> Option<String> {
        unsafe {
            let name = sqlite3_bind_parameter_name(self.as_ptr(), index);

            (!name.is_null()).then(|| CStr::from_ptr(name).to_string_lossy().into_owned())
        }
    }

    // https://sqlite.org/c3ref/column_blob.html

    pub(crate) fn column_count(&self) -> usize {
        unsafe { sqlite3_column_count(self.as_ptr()) as usize }
    }

    pub(crate) fn column_name(&self, index: usize) -> String {
        unsafe {
            let name = sqlite3_column_name(self.as_ptr(), index as c_int);
            debug_assert!(!name.is_null());

            CStr::from_ptr(name).to_string_lossy().into_owned()
        }
    }

    pub(crate) fn column_type(&self, index: usize) -> c_int {
        unsafe { sqlite3_column_type(self.as_ptr(), index as c_int) }
    }

    pub(crate) fn column_int64(&self, index: usize) -> i64 {
        unsafe { sqlite3_column_int64(self.as_ptr(), index as c_int) }
    }

    pub(crate) fn column_double(&self, index: usize) -> f64 {
        unsafe { sqlite3_column_double(self.as_ptr(), index as c_int) }
    }

    /// The column's text, copied out of the engine-owned buffer.
    pub(crate) fn column_text(&self, index: usize) -> String {
        unsafe {
            let len = sqlite3_column_bytes(self.as_ptr(), index as c_int) as usize;
            let ptr = sqlite3_column_text(self.as_ptr(), index as c_int);

            if ptr.is_null() {
                String::new()
            } else {
                String::from_utf8_lossy(std::slice::from_raw_parts(ptr, len)).into_owned()
            }
        }
    }

    /// The column's blob as an independent copy; the engine-owned pointer is
    /// not retained.
    pub(crate) fn column_blob(&self, index: usize) -> Vec<u8> {
        unsafe {
            let len = sqlite3_column_bytes(self.as_ptr(), index as c_int) as usize;
            let ptr = sqlite3_column_blob(self.as_ptr(), index as c_int);

            if ptr.is_null() || len == 0 {
                Vec::new()
            } else {
                std::slice::from_raw_parts(ptr as *const u8, len).to_vec()
            }
        }
    }

    /// The value subtype of a result column.
    ///
    /// `sqlite3_column_value` hands back an unprotected value; reading its
    /// subtype without the connection mutex is sound because a connection and
    /// its statements are confined to one task.
    pub(crate) fn column_subtype(&self, index: usize) -> u32 {
        unsafe {
            let value = sqlite3_column_value(self.as_ptr(), index as c_int);

            sqlite3_value_subtype(value)
        }
    }

    /// <https://www.sqlite.org/c3ref/sql.html>
    pub(crate) fn sql(&self) -> String {
        unsafe {
            let sql = sqlite3_sql(self.as_ptr());
            debug_assert!(!sql.is_null());

            CStr::from_ptr(sql).to_string_lossy().into_owned()
        }
    }

    /// SQL with bound parameters expanded; `None` on out-of-memory.
    ///
    /// <https://www.sqlite.org/c3ref/expanded_sql.html>
    pub(crate) fn expanded_sql(&self) -> Option<String> {
        unsafe {
            let raw = sqlite3_expanded_sql(self.as_ptr());

            if raw.is_null() {
                return None;
            }

            let sql = CStr::from_ptr(raw).to_string_lossy().into_owned();

            // expanded SQL is allocated by the engine and must be freed by us
            sqlite3_free(raw as *mut c_void);

            Some(sql)
        }
    }

    /// <https://www.sqlite.org/c3ref/stmt_readonly.html>
    pub(crate) fn readonly(&self) -> bool {
        unsafe { sqlite3_stmt_readonly(self.as_ptr()) != 0 }
    }

    /// <https://www.sqlite.org/c3ref/step.html>
    pub(crate) fn step(&self) -> c_int {
        unsafe { sqlite3_step(self.as_ptr()) }
    }

    /// The status of reset merely replays the most recent step error, so it
    /// is ignored.
    ///
    /// <https://www.sqlite.org/c3ref/reset.html>
    pub(crate) fn reset(&self) {
        unsafe {
            let _ = sqlite3_reset(self.as_ptr());
        }
    }

    /// <https://www.sqlite.org/c3ref/clear_bindings.html>
    pub(crate) fn clear_bindings(&self) {
        unsafe {
            let _ = sqlite3_clear_bindings(self.as_ptr());
        }
    }

    /// <https://www.sqlite.org/c3ref/finalize.html>
    pub(crate) fn finalize(self) {
        unsafe {
            let _ = sqlite3_finalize(self.as_ptr());
        }
    }
}
