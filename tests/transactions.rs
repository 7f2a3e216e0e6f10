use anyhow::Result;
use squill::{params, Connection, Error, Value};

fn counting(db: &Connection) -> Result<i64> {
    let stmt = db.prepare("select count(*) from t")?;
    let row = stmt.value(())?.expect("count row");

    Ok(row[0].as_i64().expect("count is an integer"))
}

#[test]
fn commit_on_normal_return() -> Result<()> {
    let db = Connection::open_in_memory()?;

    db.exec_batch("create table t (x)")?;

    let insert = db.transaction(|db: &Connection| {
        db.exec("insert into t values (1)", ())?;
        db.exec("insert into t values (2)", ())?;

        Ok::<_, Error>(())
    });

    insert.run()?;

    assert!(db.autocommit()?);
    assert_eq!(counting(&db)?, 2);

    Ok(())
}

#[test]
fn rollback_on_error() -> Result<()> {
    let db = Connection::open_in_memory()?;

    db.exec_batch("create table t (x)")?;

    let failing = db.transaction(|db: &Connection| {
        db.exec("insert into t values (1)", ())?;

        Err::<(), Error>(Error::Function("abort".into()))
    });

    assert!(failing.run().is_err());

    assert!(db.autocommit()?);
    assert_eq!(counting(&db)?, 0);

    Ok(())
}

#[test]
fn nested_transactions_use_savepoints() -> Result<()> {
    let db = Connection::open_in_memory()?;

    db.exec_batch("create table t (x)")?;

    let outer = db.transaction(|db: &Connection| {
        db.exec("insert into t values (1)", ())?;

        // inside a transaction now; a nested run must not tear it down
        assert!(!db.autocommit()?);

        let nested = db.transaction(|db: &Connection| {
            db.exec("insert into t values (2)", ())?;

            Err::<(), Error>(Error::Function("inner abort".into()))
        });

        assert!(nested.run().is_err());

        // the savepoint rolled back alone; the outer transaction survives
        assert!(!db.autocommit()?);

        db.exec("insert into t values (3)", ())?;

        Ok::<_, Error>(())
    });

    outer.run()?;

    assert!(db.autocommit()?);

    let stmt = db.prepare("select x from t order by x")?;
    assert_eq!(
        stmt.values(())?,
        vec![vec![Value::Integer(1)], vec![Value::Integer(3)]]
    );

    Ok(())
}

#[test]
fn nested_success_releases_the_savepoint() -> Result<()> {
    let db = Connection::open_in_memory()?;

    db.exec_batch("create table t (x)")?;

    let outer = db.transaction(|db: &Connection| {
        let nested = db.transaction(|db: &Connection| {
            db.exec("insert into t values (1)", ())?;

            Ok::<_, Error>(())
        });

        nested.run()?;
        nested.run()?;

        Ok::<_, Error>(())
    });

    outer.run()?;

    assert_eq!(counting(&db)?, 2);

    Ok(())
}

#[test]
fn sibling_behaviors_share_the_function() -> Result<()> {
    let db = Connection::open_in_memory()?;

    db.exec_batch("create table t (x)")?;

    let insert = db.transaction(|db: &Connection| db.exec("insert into t values (1)", ()));

    insert.run()?;
    insert.deferred().run()?;
    insert.immediate().run()?;
    insert.exclusive().run()?;

    assert_eq!(counting(&db)?, 4);
    assert_eq!(insert.database().path(), ":memory:");

    Ok(())
}

#[test]
fn wrapper_results_propagate() -> Result<()> {
    let db = Connection::open_in_memory()?;

    db.exec_batch("create table t (x)")?;
    db.exec("insert into t values (41)", ())?;

    let bump = db.transaction(|db: &Connection| {
        db.exec("update t set x = x + 1", ())?;

        let stmt = db.prepare("select x from t")?;
        let row = stmt.value(())?.expect("one row");

        Ok::<_, Error>(row[0].clone())
    });

    assert_eq!(bump.run()?, Value::Integer(42));

    Ok(())
}

#[test]
fn transaction_failure_keeps_parameters_usable() -> Result<()> {
    let db = Connection::open_in_memory()?;

    db.exec_batch("create table t (x unique)")?;

    let duplicate = db.transaction(|db: &Connection| {
        db.exec("insert into t values (?)", params![7])?;
        db.exec("insert into t values (?)", params![7])?;

        Ok::<_, Error>(())
    });

    assert!(matches!(duplicate.run(), Err(Error::Step(_))));
    assert!(db.autocommit()?);

    duplicate.database().exec("insert into t values (?)", params![8])?;
    assert_eq!(counting(&db)?, 1);

    Ok(())
}
