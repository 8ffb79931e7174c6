//! # SQLite Transport
//!
//! The reference [`Transport`]: a single `rusqlite::Connection` executing
//! round trips statement by statement.
//!
//! ## SAVEPOINT Isolation
//!
//! Every write statement runs inside its own SAVEPOINT:
//!
//! ```text
//! SAVEPOINT rt_7
//!   INSERT INTO "users" ("id", "name") VALUES (?, ?), (?, ?), (?, ?)
//! RELEASE rt_7            -- success: keep the rows
//! ROLLBACK TO rt_7        -- failure: discard the statement, keep going
//! ```
//!
//! A failed write never takes its neighbours down with it, and the round
//! trip carries on with the next statement.
//!
//! ## Locating the Failing Row
//!
//! SQLite reports a failed multi-row `INSERT` as one error with no row
//! index. When a group statement fails, its savepoint is rolled back and the
//! rows are replayed one at a time, each in its own savepoint. The rows that
//! fail again are reported precisely and the rest stay applied.
//!
//! ## Cancellation
//!
//! The connection's `InterruptHandle` is the transport's interrupt. An
//! interrupted statement surfaces as `SQLITE_INTERRUPT`, which aborts the
//! whole round trip with [`Error::Cancelled`].

use std::path::Path;
use std::sync::Arc;

use rusqlite::{params_from_iter, Connection, ErrorCode};
use tracing::debug;

use crate::error::{Error, Result};
use crate::executor::{Interrupt, ProviderDescriptor, Transport};
use crate::types::{ResultSet, Row, Value};
use crate::wire::{
    FailureExtent, ProviderFailure, RoundTrip, StatementOutcome, StatementResult, WireStatement,
};

/// Host parameter limit of the bundled SQLite (`SQLITE_MAX_VARIABLE_NUMBER`).
pub const SQLITE_MAX_PARAMETERS: usize = 32_766;

/// Prepared statements kept in rusqlite's statement cache.
const STATEMENT_CACHE_CAPACITY: usize = 128;

/// A [`Transport`] over one SQLite connection.
pub struct SqliteTransport {
    conn: Connection,
    savepoints: u64,
}

impl SqliteTransport {
    /// Opens (or creates) a database file.
    ///
    /// Sets the same pragmas for every connection: WAL journaling,
    /// `synchronous = NORMAL` and foreign key enforcement.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL")?;
        Self::configure(conn)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::configure(Connection::open_in_memory()?)
    }

    /// Wraps an already-open connection as is.
    pub fn new(conn: Connection) -> Self {
        conn.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);
        Self {
            conn,
            savepoints: 0,
        }
    }

    fn configure(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA synchronous = NORMAL")?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        Ok(Self::new(conn))
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn next_savepoint(&mut self) -> String {
        self.savepoints += 1;
        format!("rt_{}", self.savepoints)
    }

    // =========================================================================
    // Statement Execution
    // =========================================================================

    fn run_query(&mut self, stmt: &WireStatement) -> Result<StatementResult> {
        match read_result_set(&self.conn, &stmt.text, &stmt.params) {
            Ok(rows) => Ok(Ok(StatementOutcome::Rows(rows))),
            Err(err) if is_interrupt(&err) => Err(Error::Cancelled),
            Err(err) => Ok(Err(failure(&err, FailureExtent::Statement))),
        }
    }

    fn run_write(&mut self, stmt: &WireStatement) -> Result<StatementResult> {
        match self.in_savepoint(&stmt.text, &stmt.params)? {
            Ok(affected) => Ok(Ok(StatementOutcome::Affected(affected))),
            Err(err) => match stmt.row_text.as_deref() {
                Some(row_text) if stmt.rows > 1 && stmt.params_per_row() > 0 => {
                    self.replay_rows(stmt, row_text)
                }
                _ => Ok(Err(failure(&err, FailureExtent::Statement))),
            },
        }
    }

    /// Replays a failed group statement one row at a time.
    fn replay_rows(&mut self, stmt: &WireStatement, row_text: &str) -> Result<StatementResult> {
        let mut failed = Vec::new();
        let mut first_error = None;

        for (index, row) in stmt.params.chunks(stmt.params_per_row()).enumerate() {
            if let Err(err) = self.in_savepoint(row_text, row)? {
                failed.push(index);
                first_error.get_or_insert(err);
            }
        }

        debug!(
            rows = stmt.rows,
            failed = failed.len(),
            "replayed failed group statement row by row"
        );

        Ok(match first_error {
            None => Ok(StatementOutcome::Affected(stmt.rows)),
            Some(err) => Err(failure(&err, FailureExtent::Rows(failed))),
        })
    }

    /// Runs one write inside its own savepoint.
    ///
    /// The outer `Result` fails when the round trip must stop (interrupt, or
    /// the savepoint itself could not be managed). The inner one is the
    /// statement's own outcome, already rolled back on failure.
    fn in_savepoint(&mut self, sql: &str, params: &[Value]) -> Result<rusqlite::Result<usize>> {
        let name = self.next_savepoint();
        self.conn.execute_batch(&format!("SAVEPOINT {name}"))?;

        let outcome = self
            .conn
            .prepare_cached(sql)
            .and_then(|mut prepared| prepared.execute(params_from_iter(params.iter())));

        match outcome {
            Ok(affected) => {
                self.conn.execute_batch(&format!("RELEASE {name}"))?;
                Ok(Ok(affected))
            }
            Err(err) if is_interrupt(&err) => {
                let _ = self
                    .conn
                    .execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}"));
                Err(Error::Cancelled)
            }
            Err(err) => {
                self.conn
                    .execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}"))?;
                Ok(Err(err))
            }
        }
    }
}

impl Transport for SqliteTransport {
    fn descriptor(&self) -> ProviderDescriptor {
        ProviderDescriptor {
            max_parameters: SQLITE_MAX_PARAMETERS,
            // Every result set is read to completion before the next
            // statement runs, so they never contend for the connection.
            multiple_active_result_sets: true,
            supports_cancellation: true,
        }
    }

    fn execute(&mut self, round_trip: &RoundTrip) -> Result<Vec<StatementResult>> {
        let mut results = Vec::with_capacity(round_trip.statements.len());
        for stmt in &round_trip.statements {
            let result = if stmt.returns_rows {
                self.run_query(stmt)?
            } else {
                self.run_write(stmt)?
            };
            results.push(result);
        }
        Ok(results)
    }

    fn begin(&mut self) -> Result<()> {
        if !self.conn.is_autocommit() {
            return Err(Error::Transaction("a transaction is already open".to_string()));
        }
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if self.conn.is_autocommit() {
            return Err(Error::Transaction("no transaction is open".to_string()));
        }
        match self.conn.execute_batch("COMMIT") {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(err.into())
            }
        }
    }

    fn rollback(&mut self) -> Result<()> {
        if self.conn.is_autocommit() {
            return Ok(());
        }
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn interrupt_handle(&self) -> Option<Arc<dyn Interrupt>> {
        Some(Arc::new(self.conn.get_interrupt_handle()))
    }
}

/// Runs a query and reads its whole result set.
fn read_result_set(conn: &Connection, sql: &str, params: &[Value]) -> rusqlite::Result<ResultSet> {
    let mut prepared = conn.prepare_cached(sql)?;
    let columns: Vec<String> = prepared
        .column_names()
        .into_iter()
        .map(String::from)
        .collect();
    let width = columns.len();

    let rows = prepared
        .query_map(params_from_iter(params.iter()), |row| {
            (0..width)
                .map(|i| row.get::<_, Value>(i))
                .collect::<rusqlite::Result<Row>>()
        })?
        .collect::<rusqlite::Result<Vec<Row>>>()?;

    Ok(ResultSet::new(columns, rows))
}

fn is_interrupt(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::OperationInterrupted
    )
}

fn failure(err: &rusqlite::Error, extent: FailureExtent) -> ProviderFailure {
    let code = match err {
        rusqlite::Error::SqliteFailure(e, _) => Some(e.extended_code),
        _ => None,
    };
    ProviderFailure {
        message: err.to_string(),
        code,
        extent,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::BatchKind;
    use crate::types::{BatchId, RowShape};

    fn transport() -> SqliteTransport {
        let t = SqliteTransport::open_in_memory().unwrap();
        t.connection()
            .execute_batch("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")
            .unwrap();
        t
    }

    fn statement(sql: &str, params: Vec<Value>, returns_rows: bool) -> WireStatement {
        WireStatement {
            text: Arc::from(sql),
            params,
            returns_rows,
            rows: 1,
            row_text: None,
        }
    }

    fn trip(kind: BatchKind, statements: Vec<WireStatement>) -> RoundTrip {
        RoundTrip {
            batch: BatchId::FIRST,
            kind,
            statements,
        }
    }

    fn group(shape: &RowShape, ids: &[i64]) -> WireStatement {
        WireStatement {
            text: Arc::from(shape.statement_for_rows(ids.len())),
            params: ids
                .iter()
                .flat_map(|id| [Value::Integer(*id), Value::Text(format!("user-{id}"))])
                .collect(),
            returns_rows: false,
            rows: ids.len(),
            row_text: Some(Arc::from(shape.statement_for_rows(1))),
        }
    }

    fn count(t: &SqliteTransport) -> i64 {
        t.connection()
            .query_row("SELECT count(*) FROM users", [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_mixed_round_trip_in_order() {
        let mut t = transport();
        let results = t
            .execute(&trip(
                BatchKind::Single,
                vec![
                    statement(
                        "INSERT INTO users (id, name) VALUES (?, ?)",
                        vec![Value::Integer(1), Value::Text("ada".into())],
                        false,
                    ),
                    statement(
                        "SELECT name FROM users WHERE id = ?",
                        vec![Value::Integer(1)],
                        true,
                    ),
                ],
            ))
            .unwrap();

        assert_eq!(results[0], Ok(StatementOutcome::Affected(1)));
        match &results[1] {
            Ok(StatementOutcome::Rows(rs)) => {
                assert_eq!(rs.columns(), &["name".to_string()]);
                assert_eq!(rs.get::<String>(0, 0).unwrap(), "ada");
            }
            other => panic!("expected rows, got {other:?}"),
        }
    }

    #[test]
    fn test_failed_statement_does_not_stop_round_trip() {
        let mut t = transport();
        let results = t
            .execute(&trip(
                BatchKind::Single,
                vec![
                    statement("INSERT INTO nope VALUES (1)", vec![], false),
                    statement(
                        "INSERT INTO users (id, name) VALUES (?, ?)",
                        vec![Value::Integer(2), Value::Text("bob".into())],
                        false,
                    ),
                ],
            ))
            .unwrap();

        let failure = results[0].clone().unwrap_err();
        assert_eq!(failure.extent, FailureExtent::Statement);
        assert!(failure.message.contains("nope"));
        assert_eq!(results[1], Ok(StatementOutcome::Affected(1)));
        assert_eq!(count(&t), 1);
    }

    #[test]
    fn test_group_failure_is_replayed_row_by_row() {
        let mut t = transport();
        t.connection()
            .execute("INSERT INTO users (id, name) VALUES (3, 'taken')", [])
            .unwrap();

        let shape = RowShape::new("users", ["id", "name"]);
        let results = t
            .execute(&trip(BatchKind::SmallGroup, vec![group(&shape, &[1, 2, 3, 4])]))
            .unwrap();

        let failure = results[0].clone().unwrap_err();
        assert_eq!(failure.extent, FailureExtent::Rows(vec![2]));
        assert!(failure.message.contains("UNIQUE"));
        assert_eq!(failure.code, Some(rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY));
        assert_eq!(count(&t), 4);
    }

    #[test]
    fn test_transaction_control() {
        let mut t = transport();
        assert!(matches!(t.commit(), Err(Error::Transaction(_))));

        t.begin().unwrap();
        assert!(matches!(t.begin(), Err(Error::Transaction(_))));
        t.execute(&trip(
            BatchKind::Single,
            vec![statement(
                "INSERT INTO users (id, name) VALUES (1, 'x')",
                vec![],
                false,
            )],
        ))
        .unwrap();
        t.rollback().unwrap();
        assert_eq!(count(&t), 0);

        t.rollback().unwrap();
    }
}
