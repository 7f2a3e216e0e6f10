use anyhow::Result;
use chrono::{DateTime, Utc};
use squill::{params, Connection, OpenOptions, Value};

const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

fn select_bound(db: &Connection, value: Value) -> Result<Value> {
    let stmt = db.prepare("select ?")?;
    let mut row = stmt.value(vec![value])?.expect("one row");

    Ok(row.remove(0))
}

#[test]
fn binding_table_round_trips() -> Result<()> {
    let db = Connection::open_in_memory()?;

    assert_eq!(select_bound(&db, Value::Null)?, Value::Null);

    // booleans travel as 0/1 integers
    assert_eq!(select_bound(&db, Value::from(true))?, Value::Integer(1));
    assert_eq!(select_bound(&db, Value::from(false))?, Value::Integer(0));

    assert_eq!(select_bound(&db, Value::Integer(42))?, Value::Integer(42));
    assert_eq!(
        select_bound(&db, Value::Integer(1 << 40))?,
        Value::Integer(1 << 40)
    );

    assert_eq!(select_bound(&db, Value::Real(0.25))?, Value::Real(0.25));

    assert_eq!(
        select_bound(&db, Value::Text("hello".into()))?,
        Value::Text("hello".into())
    );

    assert_eq!(
        select_bound(&db, Value::Blob(vec![0, 1, 255]))?,
        Value::Blob(vec![0, 1, 255])
    );

    Ok(())
}

#[test]
fn empty_text_and_blob_are_not_null() -> Result<()> {
    let db = Connection::open_in_memory()?;

    assert_eq!(
        select_bound(&db, Value::Text(String::new()))?,
        Value::Text(String::new())
    );

    assert_eq!(
        select_bound(&db, Value::Blob(Vec::new()))?,
        Value::Blob(Vec::new())
    );

    Ok(())
}

#[test]
fn nan_binds_as_null() -> Result<()> {
    let db = Connection::open_in_memory()?;

    assert_eq!(select_bound(&db, Value::Real(f64::NAN))?, Value::Null);

    Ok(())
}

#[test]
fn integral_doubles_travel_as_integers() -> Result<()> {
    let db = Connection::open_in_memory()?;

    assert_eq!(select_bound(&db, Value::Real(2.0))?, Value::Integer(2));
    assert_eq!(select_bound(&db, Value::Real(-0.0))?, Value::Integer(0));
    assert_eq!(select_bound(&db, Value::Real(0.5))?, Value::Real(0.5));

    Ok(())
}

#[test]
fn non_integer_numbers_round_trip_bitwise() -> Result<()> {
    let db = Connection::open_in_memory()?;

    for value in [0.1, -1.5, f64::MIN_POSITIVE, std::f64::consts::PI] {
        match select_bound(&db, Value::Real(value))? {
            Value::Real(out) => assert_eq!(out.to_bits(), value.to_bits()),
            other => panic!("expected a float back, got {:?}", other),
        }
    }

    Ok(())
}

#[test]
fn int64_mode_keeps_wide_integers() -> Result<()> {
    let db = Connection::open_with(":memory:", OpenOptions::new().memory(true).int64(true))?;

    db.exec_batch("create table t (x integer)")?;
    db.exec("insert into t values (?)", params![i64::MAX])?;

    let stmt = db.prepare("select x from t")?;

    assert_eq!(stmt.value(())?, Some(vec![Value::BigInt(i64::MAX)]));

    Ok(())
}

#[test]
fn int64_mode_downgrades_exactly_representable_values() -> Result<()> {
    let db = Connection::open_with(":memory:", OpenOptions::new().memory(true).int64(true))?;

    assert_eq!(
        select_bound(&db, Value::BigInt(MAX_SAFE_INTEGER))?,
        Value::Integer(MAX_SAFE_INTEGER)
    );

    assert_eq!(
        select_bound(&db, Value::BigInt(MAX_SAFE_INTEGER + 2))?,
        Value::BigInt(MAX_SAFE_INTEGER + 2)
    );

    Ok(())
}

#[test]
fn plain_mode_decodes_wide_integers_as_plain() -> Result<()> {
    let db = Connection::open_in_memory()?;

    assert_eq!(
        select_bound(&db, Value::BigInt(i64::MAX))?,
        Value::Integer(i64::MAX)
    );

    Ok(())
}

#[test]
fn dates_bind_as_iso8601_utc_text() -> Result<()> {
    let db = Connection::open_in_memory()?;

    let date: DateTime<Utc> = "2023-05-01T10:30:00Z".parse()?;

    assert_eq!(
        select_bound(&db, Value::DateTime(date))?,
        Value::Text("2023-05-01T10:30:00.000Z".into())
    );

    Ok(())
}

#[test]
fn json_values_bind_as_encoded_text() -> Result<()> {
    let db = Connection::open_in_memory()?;

    let json = serde_json::json!({ "a": [1, 2, 3] });

    assert_eq!(
        select_bound(&db, Value::Json(json))?,
        Value::Text(r#"{"a":[1,2,3]}"#.into())
    );

    Ok(())
}

#[test]
fn json_subtype_columns_decode_as_parsed_json() -> Result<()> {
    let db = Connection::open_in_memory()?;

    let stmt = db.prepare("select json(?)")?;
    let row = stmt.value(params![r#"{"x": 1, "y": [true, null]}"#])?;

    assert_eq!(
        row,
        Some(vec![Value::Json(
            serde_json::json!({ "x": 1, "y": [true, null] })
        )])
    );

    // plain text never parses as JSON, subtype or not
    assert_eq!(
        select_bound(&db, Value::Text("[1,2]".into()))?,
        Value::Text("[1,2]".into())
    );

    Ok(())
}

#[test]
fn null_round_trips_through_a_table() -> Result<()> {
    let db = Connection::open_in_memory()?;

    db.exec_batch("create table t (x)")?;
    db.exec("insert into t values (?)", params![None::<i64>])?;

    let stmt = db.prepare("select x from t")?;
    assert_eq!(stmt.value(())?, Some(vec![Value::Null]));

    Ok(())
}
