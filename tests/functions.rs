use anyhow::Result;
use squill::{params, Aggregate, Connection, Error, FunctionOptions, Value};

#[test]
fn scalar_function_adds() -> Result<()> {
    let db = Connection::open_in_memory()?;

    db.create_function("add", 2, FunctionOptions::new().deterministic(), |args| {
        let a = args[0].as_i64().unwrap_or(0);
        let b = args[1].as_i64().unwrap_or(0);

        Ok(Value::Integer(a + b))
    })?;

    let stmt = db.prepare("select add(1, 2)")?;
    stmt.enable_callback();

    assert_eq!(stmt.value(())?, Some(vec![Value::Integer(3)]));

    Ok(())
}

#[test]
fn scalar_function_sees_decoded_arguments() -> Result<()> {
    let db = Connection::open_in_memory()?;

    db.create_function("describe", 1, FunctionOptions::new(), |args| {
        let kind = match &args[0] {
            Value::Null => "null",
            Value::Integer(_) | Value::BigInt(_) => "integer",
            Value::Real(_) => "float",
            Value::Text(_) => "text",
            Value::Blob(_) => "blob",
            _ => "other",
        };

        Ok(Value::Text(kind.into()))
    })?;

    let stmt = db.prepare("select describe(?)")?;
    stmt.enable_callback();

    assert_eq!(
        stmt.value(params![1])?,
        Some(vec![Value::Text("integer".into())])
    );
    assert_eq!(
        stmt.value(params![0.5])?,
        Some(vec![Value::Text("float".into())])
    );
    assert_eq!(
        stmt.value(params!["x"])?,
        Some(vec![Value::Text("text".into())])
    );
    assert_eq!(
        stmt.value(params![vec![1u8]])?,
        Some(vec![Value::Text("blob".into())])
    );
    assert_eq!(
        stmt.value(params![None::<i32>])?,
        Some(vec![Value::Text("null".into())])
    );

    Ok(())
}

#[test]
fn scalar_function_errors_surface_in_the_statement() -> Result<()> {
    let db = Connection::open_in_memory()?;

    db.create_function("explode", 0, FunctionOptions::new(), |_| {
        Err(Error::Function("told to explode".into()))
    })?;

    let stmt = db.prepare("select explode()")?;
    stmt.enable_callback();

    match stmt.value(()) {
        Err(Error::Step(err)) => assert!(err.message().contains("told to explode")),
        other => panic!("expected a step error, got {:?}", other),
    }

    Ok(())
}

#[test]
fn varargs_function_accepts_any_arity() -> Result<()> {
    let db = Connection::open_in_memory()?;

    db.create_function("count_args", 0, FunctionOptions::new().varargs(), |args| {
        Ok(Value::Integer(args.len() as i64))
    })?;

    let stmt = db.prepare("select count_args(), count_args(1), count_args(1, 2, 3)")?;
    stmt.enable_callback();

    assert_eq!(
        stmt.value(())?,
        Some(vec![
            Value::Integer(0),
            Value::Integer(1),
            Value::Integer(3),
        ])
    );

    Ok(())
}

struct Sum2x;

impl Aggregate for Sum2x {
    fn start(&self) -> Value {
        Value::Integer(0)
    }

    fn step(&self, accumulator: Value, args: &[Value]) -> squill::Result<Value> {
        let sum = accumulator.as_i64().unwrap_or(0) + args[0].as_i64().unwrap_or(0);

        Ok(Value::Integer(sum))
    }

    fn finish(&self, accumulator: Value) -> squill::Result<Value> {
        Ok(Value::Integer(accumulator.as_i64().unwrap_or(0) * 2))
    }
}

#[test]
fn aggregate_folds_and_finalizes() -> Result<()> {
    let db = Connection::open_in_memory()?;

    db.exec_batch("create table t (x integer)")?;
    db.exec("insert into t values (1), (2), (3)", ())?;

    db.create_aggregate("sum2x", 1, FunctionOptions::new(), Sum2x)?;

    let stmt = db.prepare("select sum2x(x) from t")?;
    stmt.enable_callback();

    assert_eq!(stmt.value(())?, Some(vec![Value::Integer(12)]));

    Ok(())
}

#[test]
fn aggregate_over_no_rows_finalizes_the_seed() -> Result<()> {
    let db = Connection::open_in_memory()?;

    db.exec_batch("create table t (x integer)")?;
    db.create_aggregate("sum2x", 1, FunctionOptions::new(), Sum2x)?;

    let stmt = db.prepare("select sum2x(x) from t where x > 100")?;
    stmt.enable_callback();

    assert_eq!(stmt.value(())?, Some(vec![Value::Integer(0)]));

    Ok(())
}

#[test]
fn aggregate_groups_keep_separate_accumulators() -> Result<()> {
    let db = Connection::open_in_memory()?;

    db.exec_batch("create table t (k text, x integer)")?;
    db.exec(
        "insert into t values ('a', 1), ('a', 2), ('b', 10)",
        (),
    )?;

    db.create_aggregate("sum2x", 1, FunctionOptions::new(), Sum2x)?;

    let stmt = db.prepare("select k, sum2x(x) from t group by k order by k")?;
    stmt.enable_callback();

    assert_eq!(
        stmt.values(())?,
        vec![
            vec![Value::Text("a".into()), Value::Integer(6)],
            vec![Value::Text("b".into()), Value::Integer(20)],
        ]
    );

    Ok(())
}

#[test]
fn unsupported_result_values_report_an_error() -> Result<()> {
    let db = Connection::open_in_memory()?;

    db.create_function("bad_result", 0, FunctionOptions::new(), |_| {
        Ok(Value::Json(serde_json::json!({ "not": "encodable" })))
    })?;

    let stmt = db.prepare("select bad_result()")?;
    stmt.enable_callback();

    assert!(matches!(stmt.value(()), Err(Error::Step(_))));

    Ok(())
}

#[test]
fn registration_on_a_closed_connection_fails() -> Result<()> {
    let db = Connection::open_in_memory()?;

    db.close();

    assert!(matches!(
        db.create_function("late", 0, FunctionOptions::new(), |_| Ok(Value::Null)),
        Err(Error::Misuse(_))
    ));

    Ok(())
}
