//! Savepoint-aware transaction control.

use crate::connection::Connection;
use crate::error::Error;

/// How a top-level transaction acquires its locks.
///
/// <https://www.sqlite.org/lang_transaction.html>
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransactionBehavior {
    /// Plain `BEGIN`; the engine's own default.
    #[default]
    Default,

    Deferred,

    Immediate,

    Exclusive,
}

impl TransactionBehavior {
    pub(crate) fn begin_sql(&self) -> &'static str {
        match self {
            Self::Default => "BEGIN",
            Self::Deferred => "BEGIN DEFERRED",
            Self::Immediate => "BEGIN IMMEDIATE",
            Self::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

// Fixed savepoint name reserved for nested runs of the controller.
const SAVEPOINT: &str = "SAVEPOINT _squill_sp";
const RELEASE: &str = "RELEASE _squill_sp";
const ROLLBACK_TO: &str = "ROLLBACK TO _squill_sp";

const COMMIT: &str = "COMMIT";
const ROLLBACK: &str = "ROLLBACK";

/// A reusable transaction wrapper around a function.
///
/// Each [`run`](Transaction::run) inspects the connection's autocommit state:
/// outside a transaction it brackets the function with BEGIN/COMMIT (rolling
/// back on error); inside one it nests with SAVEPOINT/RELEASE, rolling back
/// to — and popping — the savepoint on error. Errors from the wrapped
/// function propagate unchanged.
///
/// ```no_run
/// # use squill::{Connection, Error};
/// # fn main() -> Result<(), Error> {
/// let db = Connection::open_in_memory()?;
///
/// let insert = db.transaction(|db: &Connection| {
///     db.exec("insert into t values (1)", ())?;
///     db.exec("insert into t values (2)", ())?;
///     Ok::<_, Error>(())
/// });
///
/// insert.run()?;
/// insert.immediate().run()?;
/// # Ok(())
/// # }
/// ```
pub struct Transaction<F> {
    db: Connection,
    behavior: TransactionBehavior,
    f: F,
}

impl<F> Transaction<F> {
    pub(crate) fn new(db: Connection, f: F) -> Self {
        Self {
            db,
            behavior: TransactionBehavior::Default,
            f,
        }
    }

    /// The connection this wrapper runs against.
    pub fn database(&self) -> &Connection {
        &self.db
    }

    /// A sibling wrapper around the same function with another begin mode.
    pub fn with_behavior(&self, behavior: TransactionBehavior) -> Transaction<&F> {
        Transaction {
            db: self.db.clone(),
            behavior,
            f: &self.f,
        }
    }

    /// Sibling using `BEGIN DEFERRED`.
    pub fn deferred(&self) -> Transaction<&F> {
        self.with_behavior(TransactionBehavior::Deferred)
    }

    /// Sibling using `BEGIN IMMEDIATE`.
    pub fn immediate(&self) -> Transaction<&F> {
        self.with_behavior(TransactionBehavior::Immediate)
    }

    /// Sibling using `BEGIN EXCLUSIVE`.
    pub fn exclusive(&self) -> Transaction<&F> {
        self.with_behavior(TransactionBehavior::Exclusive)
    }

    /// Run the wrapped function inside a transaction or savepoint.
    pub fn run<T, E>(&self) -> Result<T, E>
    where
        F: Fn(&Connection) -> Result<T, E>,
        E: From<Error>,
    {
        let inner = &self.db.inner;

        if inner.autocommit()? {
            inner.run_tx_statement(self.behavior.begin_sql())?;

            match (self.f)(&self.db) {
                Ok(value) => {
                    inner.run_tx_statement(COMMIT)?;

                    Ok(value)
                }

                Err(error) => {
                    // surface the original error, not the rollback's
                    let _ = inner.run_tx_statement(ROLLBACK);

                    Err(error)
                }
            }
        } else {
            inner.run_tx_statement(SAVEPOINT)?;

            match (self.f)(&self.db) {
                Ok(value) => {
                    inner.run_tx_statement(RELEASE)?;

                    Ok(value)
                }

                Err(error) => {
                    let _ = inner.run_tx_statement(ROLLBACK_TO);

                    // rolling back to a savepoint does not pop it; release
                    // it while the enclosing transaction is still active
                    if !inner.autocommit().unwrap_or(true) {
                        let _ = inner.run_tx_statement(RELEASE);
                    }

                    Err(error)
                }
            }
        }
    }
}
