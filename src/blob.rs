//! Incremental BLOB I/O.

use std::cell::{Cell, RefCell};
use std::ffi::CString;
use std::io;
use std::os::raw::{c_int, c_void};
use std::ptr::{null_mut, NonNull};
use std::sync::{Arc, Weak};
use std::thread;

use crossbeam_channel::{unbounded, Sender};
use futures_channel::oneshot;
use libsqlite3_sys::{
    sqlite3_blob, sqlite3_blob_bytes, sqlite3_blob_close, sqlite3_blob_open, sqlite3_blob_read,
    sqlite3_blob_write, SQLITE_OK,
};

use crate::connection::ConnectionInner;
use crate::error::{Error, Result, SqliteError};

/// Chunk size of the synchronous iterator.
const CHUNK_SIZE: usize = 16 * 1024;

/// Thin wrapper around a raw `sqlite3_blob`.
///
/// Safe to move between threads; access is serialized by the worker's
/// command channel on one side and the caller's suspension on the other.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BlobHandle(NonNull<sqlite3_blob>);

unsafe impl Send for BlobHandle {}

impl BlobHandle {
    fn as_ptr(&self) -> *mut sqlite3_blob {
        self.0.as_ptr()
    }
}

/// An open handle onto a single BLOB cell, supporting positional reads and
/// writes without loading the whole value.
///
/// The total size of an open blob is fixed; writes cannot grow it. The byte
/// length is read once at open and cached.
pub struct Blob {
    pub(crate) inner: Arc<BlobInner>,

    /// Cursor for the `std::io` adapters.
    pos: u64,
}

pub(crate) struct BlobInner {
    handle: Cell<Option<BlobHandle>>,
    conn: Weak<ConnectionInner>,
    len: u64,
    readonly: bool,

    /// Dedicated thread for the asynchronous operations, spawned on first
    /// use; the blocking FFI call runs there while the caller suspends.
    worker: RefCell<Option<Worker>>,
}

impl Blob {
    pub(crate) fn open(
        conn: &Arc<ConnectionInner>,
        database: &str,
        table: &str,
        column: &str,
        row: i64,
        readonly: bool,
    ) -> Result<Self> {
        let db = conn.handle()?;

        let database = CString::new(database)
            .map_err(|_| Error::Misuse("database name must not contain nul bytes"))?;
        let table = CString::new(table)
            .map_err(|_| Error::Misuse("table name must not contain nul bytes"))?;
        let column = CString::new(column)
            .map_err(|_| Error::Misuse("column name must not contain nul bytes"))?;

        let mut handle = null_mut();

        // <https://www.sqlite.org/c3ref/blob_open.html>
        let status = unsafe {
            sqlite3_blob_open(
                db.as_ptr(),
                database.as_ptr(),
                table.as_ptr(),
                column.as_ptr(),
                row,
                (!readonly) as c_int,
                &mut handle,
            )
        };

        if status != SQLITE_OK || handle.is_null() {
            return Err(Error::Blob(db.last_error()));
        }

        let handle = BlobHandle(unsafe { NonNull::new_unchecked(handle) });

        // https://www.sqlite.org/c3ref/blob_bytes.html
        let len = unsafe { sqlite3_blob_bytes(handle.as_ptr()) } as u64;

        let inner = Arc::new(BlobInner {
            handle: Cell::new(Some(handle)),
            conn: Arc::downgrade(conn),
            len,
            readonly,
            worker: RefCell::new(None),
        });

        conn.register_blob(&inner);

        Ok(Self { inner, pos: 0 })
    }

    /// Size of the underlying BLOB in bytes, cached at open.
    pub fn byte_length(&self) -> u64 {
        self.inner.len
    }

    /// The handle was opened without write access.
    pub fn readonly(&self) -> bool {
        self.inner.readonly
    }

    /// Fill `buf` from the BLOB starting at `offset`.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let (offset, len) = self.inner.range(offset, buf.len())?;
        let handle = self.inner.handle()?;

        // <https://www.sqlite.org/c3ref/blob_read.html>
        let status =
            unsafe { sqlite3_blob_read(handle.as_ptr(), buf.as_mut_ptr() as *mut c_void, len, offset) };

        self.inner.check(status)
    }

    /// Write `buf` into the BLOB starting at `offset`. Cannot change the
    /// BLOB's size.
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let (offset, len) = self.inner.range(offset, buf.len())?;
        let handle = self.inner.handle()?;

        // <https://www.sqlite.org/c3ref/blob_write.html>
        let status =
            unsafe { sqlite3_blob_write(handle.as_ptr(), buf.as_ptr() as *const c_void, len, offset) };

        self.inner.check(status)
    }

    /// Read `buf.len()` bytes starting at `offset` on the worker thread,
    /// resolving to the filled buffer.
    ///
    /// Taking the buffer by value is what keeps it untouched until the
    /// operation resolves; it is handed back on completion.
    pub async fn read(&self, offset: u64, mut buf: Vec<u8>) -> Result<Vec<u8>> {
        let (offset, len) = self.inner.range(offset, buf.len())?;
        let handle = self.inner.handle()?;

        let receiver = self.inner.run_on_worker(move || {
            let status = unsafe {
                sqlite3_blob_read(handle.as_ptr(), buf.as_mut_ptr() as *mut c_void, len, offset)
            };

            (status, buf)
        })?;

        let (status, buf) = receiver
            .await
            .map_err(|_| Error::Misuse("blob worker terminated"))?;

        self.inner.check(status)?;

        Ok(buf)
    }

    /// Write `buf` at `offset` on the worker thread, resolving to the
    /// returned buffer once the engine no longer reads from it.
    pub async fn write(&self, offset: u64, buf: Vec<u8>) -> Result<Vec<u8>> {
        let (offset, len) = self.inner.range(offset, buf.len())?;
        let handle = self.inner.handle()?;

        let receiver = self.inner.run_on_worker(move || {
            let status = unsafe {
                sqlite3_blob_write(handle.as_ptr(), buf.as_ptr() as *const c_void, len, offset)
            };

            (status, buf)
        })?;

        let (status, buf) = receiver
            .await
            .map_err(|_| Error::Misuse("blob worker terminated"))?;

        self.inner.check(status)?;

        Ok(buf)
    }

    /// Iterate the BLOB synchronously in chunks of 16 KiB.
    pub fn chunks(&self) -> BlobChunks<'_> {
        BlobChunks {
            blob: self,
            offset: 0,
        }
    }

    /// Close the handle. Idempotent; also happens on drop and when the
    /// owning connection closes.
    pub fn close(&self) {
        if let Some(conn) = self.inner.conn.upgrade() {
            conn.deregister_blob(&self.inner);
        }

        self.inner.close_handle();
    }
}

impl BlobInner {
    fn handle(&self) -> Result<BlobHandle> {
        self.handle.get().ok_or(Error::Misuse("blob is closed"))
    }

    /// Validate an `offset`/`len` window against the fixed BLOB size and
    /// narrow it to the engine's `c_int` domain.
    fn range(&self, offset: u64, len: usize) -> Result<(c_int, c_int)> {
        let end = offset.checked_add(len as u64);

        if end.map_or(true, |end| end > self.len) {
            return Err(Error::Misuse("read or write crosses the end of the blob"));
        }

        Ok((offset as c_int, len as c_int))
    }

    fn check(&self, status: c_int) -> Result<()> {
        if status == SQLITE_OK {
            return Ok(());
        }

        let error = match self.conn.upgrade().and_then(|conn| conn.handle().ok()) {
            Some(handle) => handle.last_error(),
            None => SqliteError::from_code(status),
        };

        Err(Error::Blob(error))
    }

    fn run_on_worker<F, R>(&self, f: F) -> Result<oneshot::Receiver<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let mut worker = self.worker.borrow_mut();

        if worker.is_none() {
            *worker = Some(Worker::new()?);
        }

        Ok(worker.as_ref().expect("just spawned").run(f))
    }

    /// Close without touching the registry; shared by `close()`, drop, and
    /// connection close.
    pub(crate) fn close_handle(&self) {
        // dropping the worker joins its thread, so no read or write is in
        // flight when the handle goes away
        self.worker.borrow_mut().take();

        if let Some(handle) = self.handle.take() {
            // https://www.sqlite.org/c3ref/blob_close.html
            let status = unsafe { sqlite3_blob_close(handle.as_ptr()) };

            if status != SQLITE_OK {
                log::warn!("sqlite3_blob_close returned {}", SqliteError::from_code(status));
            }
        }
    }
}

impl Drop for BlobInner {
    fn drop(&mut self) {
        self.close_handle();
    }
}

impl io::Read for Blob {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.inner.len.saturating_sub(self.pos);
        let n = (buf.len() as u64).min(remaining) as usize;

        if n == 0 {
            return Ok(0);
        }

        self.read_at(self.pos, &mut buf[..n])
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;

        self.pos += n as u64;

        Ok(n)
    }
}

impl io::Write for Blob {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        // an open blob cannot grow; reject rather than truncate
        if self.pos + buf.len() as u64 > self.inner.len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "write crosses the end of the blob",
            ));
        }

        self.write_at(self.pos, buf)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;

        self.pos += buf.len() as u64;

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Seek for Blob {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let target = match pos {
            io::SeekFrom::Start(offset) => Some(offset),
            io::SeekFrom::End(delta) => checked_offset(self.inner.len, delta),
            io::SeekFrom::Current(delta) => checked_offset(self.pos, delta),
        };

        match target {
            Some(target) => {
                self.pos = target;
                Ok(target)
            }

            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before the start of the blob",
            )),
        }
    }
}

fn checked_offset(base: u64, delta: i64) -> Option<u64> {
    if delta >= 0 {
        base.checked_add(delta as u64)
    } else {
        base.checked_sub(delta.unsigned_abs())
    }
}

impl Drop for Blob {
    fn drop(&mut self) {
        self.close();
    }
}

/// Synchronous 16 KiB chunk iterator over a [`Blob`].
pub struct BlobChunks<'b> {
    blob: &'b Blob,
    offset: u64,
}

impl Iterator for BlobChunks<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.blob.inner.len.saturating_sub(self.offset);

        if remaining == 0 {
            return None;
        }

        let n = remaining.min(CHUNK_SIZE as u64) as usize;
        let mut chunk = vec![0; n];

        match self.blob.read_at(self.offset, &mut chunk) {
            Ok(()) => {
                self.offset += n as u64;

                Some(Ok(chunk))
            }

            Err(err) => {
                self.offset = self.blob.inner.len;

                Some(Err(err))
            }
        }
    }
}

/// A dedicated thread running blocking FFI calls so the calling task can
/// suspend instead.
struct Worker {
    tx: Option<Sender<Box<dyn FnOnce() + Send>>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    fn new() -> Result<Self> {
        let (tx, rx) = unbounded::<Box<dyn FnOnce() + Send>>();

        let thread = thread::Builder::new()
            .name("squill-blob".into())
            .spawn(move || {
                for job in rx {
                    job();
                }
            })
            .map_err(|_| Error::Misuse("unable to spawn the blob worker thread"))?;

        Ok(Self {
            tx: Some(tx),
            thread: Some(thread),
        })
    }

    /// Queue `f` and hand back the completion channel.
    fn run<F, R>(&self, f: F) -> oneshot::Receiver<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        if let Some(sender) = &self.tx {
            let _ = sender.send(Box::new(move || {
                let _ = tx.send(f());
            }));
        }

        rx
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // closing the channel lets the thread drain and exit; the join
        // guarantees no job still touches the blob handle
        self.tx.take();

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
