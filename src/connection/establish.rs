use std::ffi::CString;
use std::ptr::{null, null_mut};

use libsqlite3_sys::{
    sqlite3_busy_timeout, sqlite3_enable_load_extension, sqlite3_extended_result_codes,
    sqlite3_open_v2, SQLITE_MISUSE, SQLITE_NOMEM, SQLITE_OK,
};

use crate::connection::handle::ConnectionHandle;
use crate::error::{Error, Result, SqliteError};
use crate::options::OpenOptions;

/// Open a database handle for `path` with the composed open-v2 flags.
///
/// On failure the partially-created handle is closed before the error is
/// surfaced; the error carries the engine's numeric result code.
pub(super) fn establish(path: &str, options: &OpenOptions) -> Result<ConnectionHandle> {
    let filename = CString::new(path)
        .map_err(|_| Error::Open(SqliteError::from_code(SQLITE_MISUSE)))?;

    let mut handle = null_mut();

    // <https://www.sqlite.org/c3ref/open.html>
    let status = unsafe {
        sqlite3_open_v2(filename.as_ptr(), &mut handle, options.open_flags(), null())
    };

    if handle.is_null() {
        // the only way sqlite3_open_v2 leaves the out-pointer null is an
        // allocation failure for the handle itself
        return Err(Error::Open(SqliteError::from_code(SQLITE_NOMEM)));
    }

    let handle = unsafe { ConnectionHandle::new(handle) };

    if status != SQLITE_OK {
        let error = handle.last_error();
        handle.close();

        return Err(Error::Open(error));
    }

    // https://www.sqlite.org/c3ref/extended_result_codes.html
    unsafe {
        sqlite3_extended_result_codes(handle.as_ptr(), 1);
    }

    if options.enable_load_extension {
        // https://www.sqlite.org/c3ref/enable_load_extension.html
        let status = unsafe { sqlite3_enable_load_extension(handle.as_ptr(), 1) };

        if status != SQLITE_OK {
            let error = handle.last_error();
            handle.close();

            return Err(Error::Open(error));
        }
    }

    log::debug!("opened database {:?}", path);

    Ok(handle)
}

/// Configure the engine to sleep-and-retry when a competing connection holds
/// a lock, instead of failing the step outright.
///
/// <https://www.sqlite.org/c3ref/busy_timeout.html>
pub(super) fn set_busy_timeout(handle: &ConnectionHandle, ms: i32) -> Result<()> {
    let status = unsafe { sqlite3_busy_timeout(handle.as_ptr(), ms) };

    if status != SQLITE_OK {
        return Err(Error::Sqlite(handle.last_error()));
    }

    Ok(())
}
