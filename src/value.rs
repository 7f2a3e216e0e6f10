//! Conversion between host values and SQLite's five storage classes.

use std::os::raw::c_int;

use chrono::{DateTime, SecondsFormat, Utc};
use libsqlite3_sys::{
    sqlite3_value, sqlite3_value_blob, sqlite3_value_bytes, sqlite3_value_double,
    sqlite3_value_int64, sqlite3_value_subtype, sqlite3_value_text, sqlite3_value_type,
    SQLITE_BLOB, SQLITE_FLOAT, SQLITE_INTEGER, SQLITE_TEXT,
};

use crate::error::{Error, Result};
use crate::statement::StatementHandle;

/// Values with a subtype of `JSON_SUBTYPE` (ASCII 'J') were produced by the
/// engine's JSON functions and decode as parsed JSON.
///
/// <https://www.sqlite.org/json1.html>
pub(crate) const JSON_SUBTYPE: u32 = 74;

/// The largest integer magnitude that survives a round-trip through an IEEE
/// double. Integers beyond it decode as [`Value::BigInt`].
pub(crate) const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

/// A single host value, covering everything that can be bound into or decoded
/// out of a statement.
///
/// Binding follows SQLite's storage classes: `Integer` uses the 32-bit bind
/// primitive when the value fits in 32 signed bits and the 64-bit primitive
/// otherwise, `DateTime` binds as its ISO-8601 UTC string, and `Json` binds as
/// JSON-encoded text.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,

    /// An integral "plain number".
    Integer(i64),

    /// An explicit 64-bit integer; decoding produces this only in `int64`
    /// mode, for values a double cannot represent exactly.
    BigInt(i64),

    Real(f64),

    Text(String),

    Blob(Vec<u8>),

    /// Binds as ISO-8601 UTC text, e.g. `2022-03-01T09:30:00.000Z`.
    DateTime(DateTime<Utc>),

    /// Binds as JSON-encoded text; decoded from TEXT columns carrying the
    /// engine's JSON subtype.
    Json(serde_json::Value),
}

impl Value {
    /// The integer payload of an `Integer` or `BigInt`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) | Value::BigInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Real(v) => Some(*v),
            Value::Integer(v) | Value::BigInt(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Bind this value to the 1-based `index` of a prepared statement.
    ///
    /// Text and blob payloads are copied into `pins` and handed to the engine
    /// as borrowed memory; the caller keeps `pins` alive until the statement's
    /// bindings are next cleared.
    pub(crate) fn bind(
        &self,
        handle: &StatementHandle,
        index: c_int,
        pins: &mut PinnedBuffers,
    ) -> Result<()> {
        let status = match self {
            Value::Null => handle.bind_null(index),

            Value::Integer(v) => bind_integer(handle, index, *v),

            Value::BigInt(v) => handle.bind_int64(index, *v),

            Value::Real(v) => {
                if v.is_nan() {
                    handle.bind_null(index)
                } else if v.fract() == 0.0
                    && *v >= i64::MIN as f64
                    && *v < i64::MAX as f64
                {
                    // an integral double is indistinguishable from an integer
                    // in the host's plain-number domain
                    bind_integer(handle, index, *v as i64)
                } else {
                    handle.bind_double(index, *v)
                }
            }

            Value::Text(s) if s.is_empty() => handle.bind_empty_text(index),

            Value::Text(s) => handle.bind_text(index, pins.pin_text(s.clone())),

            Value::Blob(b) => handle.bind_blob(index, pins.pin_blob(b.clone())),

            Value::DateTime(dt) => {
                let iso = dt.to_rfc3339_opts(SecondsFormat::Millis, true);
                handle.bind_text(index, pins.pin_text(iso))
            }

            Value::Json(json) => {
                let encoded = serde_json::to_string(json)
                    .map_err(|err| Error::Bind(format!("unencodable JSON value: {}", err)))?;

                if encoded.is_empty() {
                    handle.bind_empty_text(index)
                } else {
                    handle.bind_text(index, pins.pin_text(encoded))
                }
            }
        };

        if status != libsqlite3_sys::SQLITE_OK {
            return Err(Error::Bind(format!(
                "failed to bind parameter {}: {}",
                index,
                crate::error::SqliteError::from_code(status)
            )));
        }

        Ok(())
    }
}

fn bind_integer(handle: &StatementHandle, index: c_int, v: i64) -> c_int {
    // https://sqlite.org/c3ref/bind_blob.html
    match i32::try_from(v) {
        Ok(v) => handle.bind_int(index, v),
        Err(_) => handle.bind_int64(index, v),
    }
}

/// Decode an INTEGER storage-class payload.
///
/// With `int64` mode on, the value decodes as [`Value::BigInt`], downgraded
/// to a plain [`Value::Integer`] when a double represents it exactly. With
/// the mode off every integer decodes as `Integer`; the `i64` payload already
/// carries out-of-safe-range values without loss.
pub(crate) fn decode_integer(v: i64, int64_mode: bool) -> Value {
    if int64_mode && !(-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&v) {
        Value::BigInt(v)
    } else {
        Value::Integer(v)
    }
}

/// Decode a TEXT payload, honoring the JSON value subtype.
pub(crate) fn decode_text(text: String, subtype: u32) -> Value {
    if subtype == JSON_SUBTYPE {
        match serde_json::from_str(&text) {
            Ok(json) => Value::Json(json),
            Err(_) => Value::Text(text),
        }
    } else {
        Value::Text(text)
    }
}

/// Decode a protected `sqlite3_value`, as seen by user-defined functions.
///
/// The returned value owns independent copies of any text or blob payload;
/// the engine-owned pointers are not retained.
pub(crate) unsafe fn decode_raw(value: *mut sqlite3_value, int64_mode: bool) -> Value {
    match sqlite3_value_type(value) {
        SQLITE_INTEGER => decode_integer(sqlite3_value_int64(value), int64_mode),

        SQLITE_FLOAT => Value::Real(sqlite3_value_double(value)),

        SQLITE_TEXT => {
            let len = sqlite3_value_bytes(value) as usize;
            let ptr = sqlite3_value_text(value);

            let text = if ptr.is_null() {
                String::new()
            } else {
                String::from_utf8_lossy(std::slice::from_raw_parts(ptr, len)).into_owned()
            };

            decode_text(text, sqlite3_value_subtype(value))
        }

        SQLITE_BLOB => {
            let len = sqlite3_value_bytes(value) as usize;
            let ptr = sqlite3_value_blob(value);

            if ptr.is_null() || len == 0 {
                Value::Blob(Vec::new())
            } else {
                Value::Blob(std::slice::from_raw_parts(ptr as *const u8, len).to_vec())
            }
        }

        // SQLITE_NULL, or anything unrecognized
        _ => Value::Null,
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Integer(value as i64)
    }
}

macro_rules! impl_from_integer {
    ($($ty:ty),*) => {$(
        impl From<$ty> for Value {
            fn from(value: $ty) -> Self {
                Value::Integer(value as i64)
            }
        }
    )*};
}

impl_from_integer!(i8, i16, i32, u8, u16, u32);

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::BigInt(value)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::Real(value as f64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Real(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<&[u8]> for Value {
    fn from(value: &[u8]) -> Self {
        Value::Blob(value.to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Blob(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::DateTime(value)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Value::Json(value)
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => value.into(),
            None => Value::Null,
        }
    }
}

/// Parameters for one execution of a statement: nothing, an ordered list, or
/// a name-to-value mapping.
#[derive(Debug, Clone, Default)]
pub enum Params {
    #[default]
    Empty,

    Positional(Vec<Value>),

    Named(Vec<(String, Value)>),
}

impl Params {
    pub fn is_empty(&self) -> bool {
        match self {
            Params::Empty => true,
            Params::Positional(values) => values.is_empty(),
            Params::Named(values) => values.is_empty(),
        }
    }
}

impl From<()> for Params {
    fn from(_: ()) -> Self {
        Params::Empty
    }
}

impl From<Vec<Value>> for Params {
    fn from(values: Vec<Value>) -> Self {
        Params::Positional(values)
    }
}

impl From<&[Value]> for Params {
    fn from(values: &[Value]) -> Self {
        Params::Positional(values.to_vec())
    }
}

impl<const N: usize> From<[Value; N]> for Params {
    fn from(values: [Value; N]) -> Self {
        Params::Positional(values.into())
    }
}

impl From<Vec<(String, Value)>> for Params {
    fn from(values: Vec<(String, Value)>) -> Self {
        Params::Named(values)
    }
}

/// Construct positional [`Params`] from anything convertible to [`Value`].
///
/// ```
/// # use squill::params;
/// let p = params![42, "hi", vec![1u8, 2, 3]];
/// ```
#[macro_export]
macro_rules! params {
    () => {
        $crate::Params::Empty
    };
    ($($value:expr),+ $(,)?) => {
        $crate::Params::Positional(vec![$($crate::Value::from($value)),+])
    };
}

/// Construct named [`Params`]; names may carry their `:`/`@`/`$` prefix or
/// omit it.
///
/// ```
/// # use squill::named_params;
/// let p = named_params! { "x" => 42, ":y" => "hi" };
/// ```
#[macro_export]
macro_rules! named_params {
    () => {
        $crate::Params::Empty
    };
    ($($name:expr => $value:expr),+ $(,)?) => {
        $crate::Params::Named(vec![
            $((::std::string::String::from($name), $crate::Value::from($value))),+
        ])
    };
}

/// Owned text and blob payloads currently lent to the engine as statement
/// bindings. Must outlive the bindings; dropped when bindings are cleared.
#[derive(Debug, Default)]
pub(crate) struct PinnedBuffers {
    buffers: smallvec::SmallVec<[PinnedBuffer; 4]>,
}

#[derive(Debug)]
enum PinnedBuffer {
    Text(String),
    Blob(Vec<u8>),
}

impl PinnedBuffers {
    /// Take ownership of `text` and return a slice that stays valid until
    /// [`clear`](Self::clear).
    fn pin_text(&mut self, text: String) -> &[u8] {
        self.buffers.push(PinnedBuffer::Text(text));

        match self.buffers.last() {
            // the heap allocation does not move when the container grows
            Some(PinnedBuffer::Text(text)) => unsafe {
                std::slice::from_raw_parts(text.as_ptr(), text.len())
            },
            _ => unreachable!(),
        }
    }

    fn pin_blob(&mut self, blob: Vec<u8>) -> &[u8] {
        self.buffers.push(PinnedBuffer::Blob(blob));

        match self.buffers.last() {
            Some(PinnedBuffer::Blob(blob)) => unsafe {
                std::slice::from_raw_parts(blob.as_ptr(), blob.len())
            },
            _ => unreachable!(),
        }
    }

    pub(crate) fn clear(&mut self) {
        self.buffers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_decode_prefers_plain_numbers() {
        assert_eq!(decode_integer(42, false), Value::Integer(42));
        assert_eq!(decode_integer(42, true), Value::Integer(42));
        assert_eq!(decode_integer(-MAX_SAFE_INTEGER, true), Value::Integer(-MAX_SAFE_INTEGER));
        assert_eq!(decode_integer(i64::MAX, true), Value::BigInt(i64::MAX));
        assert_eq!(decode_integer(i64::MAX, false), Value::Integer(i64::MAX));
    }

    #[test]
    fn json_subtype_falls_back_to_raw_text() {
        assert_eq!(
            decode_text("[1,2]".into(), JSON_SUBTYPE),
            Value::Json(serde_json::json!([1, 2]))
        );
        assert_eq!(
            decode_text("not json".into(), JSON_SUBTYPE),
            Value::Text("not json".into())
        );
        assert_eq!(decode_text("[1,2]".into(), 0), Value::Text("[1,2]".into()));
    }

    #[test]
    fn conversions() {
        assert_eq!(Value::from(true), Value::Integer(1));
        assert_eq!(Value::from(7_i32), Value::Integer(7));
        assert_eq!(Value::from(7_i64), Value::BigInt(7));
        assert_eq!(Value::from(0.5), Value::Real(0.5));
        assert_eq!(Value::from(None::<i32>), Value::Null);
        assert_eq!(Value::from("x"), Value::Text("x".into()));
    }
}
