//! Options and flags used to configure how a database is opened.

use libsqlite3_sys::{
    SQLITE_OPEN_CREATE, SQLITE_OPEN_MEMORY, SQLITE_OPEN_PRIVATECACHE, SQLITE_OPEN_READONLY,
    SQLITE_OPEN_READWRITE, SQLITE_OPEN_SHAREDCACHE, SQLITE_OPEN_URI,
};

bitflags::bitflags! {
    /// Raw open-v2 flags, for callers that want full control over the open
    /// call. When set on [`OpenOptions`], these override every other flag.
    ///
    /// <https://www.sqlite.org/c3ref/c_open_autoproxy.html>
    pub struct OpenFlags: i32 {
        const READONLY = SQLITE_OPEN_READONLY;
        const READWRITE = SQLITE_OPEN_READWRITE;
        const CREATE = SQLITE_OPEN_CREATE;
        const URI = SQLITE_OPEN_URI;
        const MEMORY = SQLITE_OPEN_MEMORY;
        const SHARED_CACHE = SQLITE_OPEN_SHAREDCACHE;
        const PRIVATE_CACHE = SQLITE_OPEN_PRIVATECACHE;
    }
}

/// Options which can be used to configure how a database is opened.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub(crate) readonly: bool,
    pub(crate) create: bool,
    pub(crate) memory: bool,
    pub(crate) int64: bool,
    pub(crate) unsafe_concurrency: bool,
    pub(crate) enable_load_extension: bool,
    pub(crate) flags: Option<OpenFlags>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self {
            readonly: false,
            create: true,
            memory: false,
            int64: false,
            unsafe_concurrency: false,
            enable_load_extension: false,
            flags: None,
        }
    }

    /// Open the database read-only. Forces `create` off.
    pub fn readonly(mut self, on: bool) -> Self {
        self.readonly = on;
        self
    }

    /// Create the database file when it does not exist. Defaults to on.
    pub fn create(mut self, on: bool) -> Self {
        self.create = on;
        self
    }

    /// Open a pure in-memory database.
    pub fn memory(mut self, on: bool) -> Self {
        self.memory = on;
        self
    }

    /// Decode out-of-safe-range INTEGER columns as [`crate::Value::BigInt`]
    /// instead of plain integers.
    pub fn int64(mut self, on: bool) -> Self {
        self.int64 = on;
        self
    }

    /// Promise that exactly one caller uses the connection, enabling
    /// per-statement memoization of column metadata.
    pub fn unsafe_concurrency(mut self, on: bool) -> Self {
        self.unsafe_concurrency = on;
        self
    }

    /// Allow [`Connection::load_extension`](crate::Connection::load_extension).
    pub fn enable_load_extension(mut self, on: bool) -> Self {
        self.enable_load_extension = on;
        self
    }

    /// Use exactly these open flags, overriding every other flag option.
    pub fn flags(mut self, flags: OpenFlags) -> Self {
        self.flags = Some(flags);
        self
    }

    /// Compose the effective open-v2 flags.
    pub(crate) fn open_flags(&self) -> i32 {
        if let Some(flags) = self.flags {
            return flags.bits();
        }

        let mut flags = if self.readonly {
            SQLITE_OPEN_READONLY
        } else if self.create {
            SQLITE_OPEN_READWRITE | SQLITE_OPEN_CREATE
        } else {
            SQLITE_OPEN_READWRITE
        };

        if self.memory {
            flags |= SQLITE_OPEN_MEMORY;
        }

        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readonly_wins_over_create() {
        let flags = OpenOptions::new().readonly(true).open_flags();

        assert_eq!(flags & SQLITE_OPEN_READONLY, SQLITE_OPEN_READONLY);
        assert_eq!(flags & SQLITE_OPEN_CREATE, 0);
    }

    #[test]
    fn explicit_flags_override_everything() {
        let flags = OpenOptions::new()
            .readonly(true)
            .flags(OpenFlags::READWRITE | OpenFlags::MEMORY)
            .open_flags();

        assert_eq!(flags, SQLITE_OPEN_READWRITE | SQLITE_OPEN_MEMORY);
    }
}
