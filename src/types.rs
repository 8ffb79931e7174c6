//! # Domain Types for the Round-Trip Engine
//!
//! This module defines the identifiers and value types shared by the queue,
//! planner, executor and binder.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! Task, batch and scope identifiers are all integers underneath, but they
//! are never interchangeable. Wrapping each in its own struct means a
//! `BatchId` cannot be passed where a `TaskId` is expected.
//!
//! ## Invariants
//!
//! - [`TaskId`]: assigned at enqueue time, strictly increasing per session,
//!   defines submission order
//! - [`BatchId`]: assigned at planning time, strictly increasing per session
//! - [`RowShape`]: two shapes are equal iff they render the same statement
//!   skeleton, which is what makes their rows groupable

use std::fmt;
use std::sync::Arc;

use rusqlite::types::{FromSql, ValueRef};

use crate::error::{Error, Result};

/// A single SQL parameter or result value.
///
/// This is rusqlite's owned value type: `Null`, `Integer`, `Real`, `Text` or
/// `Blob`.
pub use rusqlite::types::Value;

// =============================================================================
// Identifiers
// =============================================================================

/// Submission sequence number of a task.
///
/// Assigned when the task enters the queue. Lower ids were submitted first,
/// and result binding always follows id order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    /// The first id handed out by a session.
    pub const FIRST: TaskId = TaskId(1);

    /// Creates a task id from a raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw sequence number.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Returns the id that follows this one.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a planned batch (one physical round trip).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BatchId(u64);

impl BatchId {
    /// The first id handed out by a planner.
    pub const FIRST: BatchId = BatchId(1);

    /// Creates a batch id from a raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Returns the id that follows this one.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an [`ExecutionContext`](crate::ExecutionContext) scope.
///
/// Every call to `provide_context` returns a scope with a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl ContextId {
    /// Creates a context id from a raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Whether a task reads (produces a result set) or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Deferred read with a materializer.
    Query,
    /// Pending write; resolves to success or a fault.
    Write,
}

// =============================================================================
// Row Shape
// =============================================================================

/// The statement skeleton of a multi-row-insertable write.
///
/// Writes built with [`WriteTask::insert`](crate::WriteTask::insert) carry a
/// shape. Consecutive writes with equal shapes form a run that the planner
/// may fold into a single multi-row `INSERT`.
///
/// # Rust Pattern: Cheap Clones
///
/// A shape is created once per table and cloned into every task. The inner
/// data lives behind an `Arc`, so cloning copies a pointer while equality and
/// hashing still compare the table and column names.
///
/// # Example
///
/// ```rust
/// use roundtrip::RowShape;
///
/// let shape = RowShape::new("users", ["id", "name"]);
/// assert_eq!(shape.params_per_row(), 2);
/// assert_eq!(
///     shape.statement_for_rows(2),
///     r#"INSERT INTO "users" ("id", "name") VALUES (?, ?), (?, ?)"#
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowShape(Arc<ShapeInner>);

#[derive(Debug, PartialEq, Eq, Hash)]
struct ShapeInner {
    table: String,
    columns: Vec<String>,
}

impl RowShape {
    /// Creates a shape for inserting `columns` into `table`.
    pub fn new<I, S>(table: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(Arc::new(ShapeInner {
            table: table.into(),
            columns: columns.into_iter().map(Into::into).collect(),
        }))
    }

    /// Returns the target table.
    pub fn table(&self) -> &str {
        &self.0.table
    }

    /// Returns the column list.
    pub fn columns(&self) -> &[String] {
        &self.0.columns
    }

    /// Number of parameters one row binds.
    pub fn params_per_row(&self) -> usize {
        self.0.columns.len()
    }

    /// Renders the `INSERT` statement for `rows` rows.
    pub fn statement_for_rows(&self, rows: usize) -> String {
        let columns = self
            .0
            .columns
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = vec!["?"; self.params_per_row()].join(", ");
        let row = format!("({placeholders})");
        let values = vec![row.as_str(); rows.max(1)].join(", ");

        format!(
            "INSERT INTO {} ({}) VALUES {}",
            quote_identifier(&self.0.table),
            columns,
            values
        )
    }
}

impl fmt::Display for RowShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.0.table, self.0.columns.join(", "))
    }
}

/// Quotes an SQL identifier, doubling embedded quotes.
fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

// =============================================================================
// Result Sets
// =============================================================================

/// One row of a result set.
pub type Row = Vec<Value>;

/// A fully-read result set returned for one query statement.
///
/// Materializers receive the whole result set by value and turn it into
/// whatever type the query handle promises.
///
/// # Example
///
/// ```rust
/// use roundtrip::{ResultSet, Value};
///
/// let rs = ResultSet::new(
///     vec!["n".to_string()],
///     vec![vec![Value::Integer(42)]],
/// );
/// assert_eq!(rs.scalar::<i64>().unwrap(), Some(42));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl ResultSet {
    /// Creates a result set from column names and rows.
    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    /// Column names in select order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// All rows in provider order.
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Consumes the result set, returning its rows.
    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True if the statement returned no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of a column by name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Reads and converts the value at `(row, column)`.
    pub fn get<T: FromSql>(&self, row: usize, column: usize) -> Result<T> {
        let value = self
            .rows
            .get(row)
            .and_then(|r| r.get(column))
            .ok_or_else(|| {
                Error::Materialize(format!("no value at row {row}, column {column}"))
            })?;

        convert(value)
    }

    /// Reads the first column of the first row, or `None` for an empty set.
    pub fn scalar<T: FromSql>(&self) -> Result<Option<T>> {
        if self.rows.is_empty() {
            return Ok(None);
        }
        self.get(0, 0).map(Some)
    }

    /// Converts one column across every row.
    pub fn column<T: FromSql>(&self, column: usize) -> Result<Vec<T>> {
        (0..self.rows.len()).map(|row| self.get(row, column)).collect()
    }
}

fn convert<T: FromSql>(value: &Value) -> Result<T> {
    T::column_result(ValueRef::from(value)).map_err(|e| Error::Materialize(e.to_string()))
}

// =============================================================================
// Tests
// =============================================================================
