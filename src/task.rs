//! # Tasks and Result Cells
//!
//! A task is one deferred unit of work waiting for a round trip:
//!
//! - a **query task** carries SQL, parameters and a materializer that turns
//!   the statement's result set into a typed value
//! - a **write task** carries SQL and parameters and only reports success or
//!   failure
//!
//! Callers build [`QueryTask`] and [`WriteTask`] values and hand them to a
//! [`Session`]. At enqueue time the session assigns a [`TaskId`], creates the
//! task's [`ResultCell`], and returns a [`TaskHandle`] that reads the cell.
//!
//! ## Type Erasure
//!
//! The queue holds tasks whose result types differ (`QueryTask<i64>`,
//! `QueryTask<Vec<User>>`, ...). Internally every task becomes a [`Task`]
//! whose query body is a boxed [`QuerySink`]: the sink owns the typed
//! materializer and the typed cell, so the binder only ever hands it a
//! `Result<ResultSet>`.
//!
//! ## Exactly-Once Resolution
//!
//! A cell moves `Unset -> Ready -> Taken`. Resolving a cell that is not
//! `Unset` is a programming error and panics.

use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{Error, Result, WriteFault};
use crate::session::Session;
use crate::types::{ResultSet, RowShape, TaskId, TaskKind, Value};

// =============================================================================
// Public Task Builders
// =============================================================================

/// Boxed row-to-value conversion attached to a query task.
pub type Materializer<T> = Box<dyn FnOnce(ResultSet) -> Result<T> + Send>;

/// A deferred read, produced by the query translation layer.
///
/// # Example
///
/// ```rust
/// use roundtrip::{QueryTask, Value};
///
/// let task = QueryTask::new(
///     "SELECT count(*) FROM users WHERE active = ?",
///     vec![Value::Integer(1)],
///     |rs| Ok(rs.scalar::<i64>()?.unwrap_or(0)),
/// )
/// .separable();
/// assert!(task.is_separable());
/// ```
pub struct QueryTask<T> {
    sql: Arc<str>,
    params: Vec<Value>,
    separable: bool,
    materializer: Materializer<T>,
}

impl<T: Send + 'static> QueryTask<T> {
    /// Creates a query task from statement text, parameters and a materializer.
    pub fn new<F>(sql: impl Into<String>, params: Vec<Value>, materializer: F) -> Self
    where
        F: FnOnce(ResultSet) -> Result<T> + Send + 'static,
    {
        Self {
            sql: Arc::from(sql.into()),
            params,
            separable: false,
            materializer: Box::new(materializer),
        }
    }

    /// Marks the task as separable: it may share a round trip with adjacent
    /// separable tasks when the provider supports multiple result sets.
    pub fn separable(mut self) -> Self {
        self.separable = true;
        self
    }

    /// Returns whether the task was marked separable.
    pub fn is_separable(&self) -> bool {
        self.separable
    }

    /// Statement text.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub(crate) fn into_task(self, id: TaskId) -> (Task, Arc<ResultCell<T>>) {
        let cell = Arc::new(ResultCell::new(id));
        let sink = MaterializeSink {
            materializer: self.materializer,
            cell: Arc::clone(&cell),
        };
        let task = Task {
            id,
            sql: self.sql,
            params: self.params,
            body: TaskBody::Query {
                separable: self.separable,
                sink: Box::new(sink),
            },
        };
        (task, cell)
    }
}

impl QueryTask<ResultSet> {
    /// Creates a query task whose value is the raw result set.
    pub fn result_set(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self::new(sql, params, Ok)
    }
}

impl<T> fmt::Debug for QueryTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryTask")
            .field("sql", &self.sql)
            .field("params", &self.params.len())
            .field("separable", &self.separable)
            .finish_non_exhaustive()
    }
}

/// A pending write, produced by the persistence layer.
///
/// Writes are submitted in the dependency order the change tracker already
/// computed; the engine never reorders them.
#[derive(Debug, Clone)]
pub struct WriteTask {
    sql: Arc<str>,
    params: Vec<Value>,
    shape: Option<RowShape>,
    separable: bool,
}

impl WriteTask {
    /// Creates a standalone write. It is never folded into a multi-row group.
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: Arc::from(sql.into()),
            params,
            shape: None,
            separable: false,
        }
    }

    /// Creates a single-row insert that may be grouped with its neighbours.
    ///
    /// # Errors
    ///
    /// `Error::InvalidTask` if the shape has no columns or `values` does not
    /// supply exactly one value per column.
    pub fn insert(shape: &RowShape, values: Vec<Value>) -> Result<Self> {
        if shape.params_per_row() == 0 {
            return Err(Error::InvalidTask(format!(
                "row shape {shape} has no columns"
            )));
        }
        if values.len() != shape.params_per_row() {
            return Err(Error::InvalidTask(format!(
                "row shape {shape} expects {} value(s), got {}",
                shape.params_per_row(),
                values.len()
            )));
        }

        Ok(Self {
            sql: Arc::from(shape.statement_for_rows(1)),
            params: values,
            shape: Some(shape.clone()),
            separable: false,
        })
    }

    /// Marks the task as separable (may share a round trip with neighbours).
    pub fn separable(mut self) -> Self {
        self.separable = true;
        self
    }

    /// The row shape, if this write is groupable.
    pub fn shape(&self) -> Option<&RowShape> {
        self.shape.as_ref()
    }

    /// Statement text for a single execution of this write.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub(crate) fn into_task(self, id: TaskId) -> (Task, Arc<ResultCell<()>>) {
        let cell = Arc::new(ResultCell::new(id));
        let task = Task {
            id,
            sql: self.sql,
            params: self.params,
            body: TaskBody::Write {
                shape: self.shape,
                separable: self.separable,
                cell: Arc::clone(&cell),
            },
        };
        (task, cell)
    }
}

// =============================================================================
// Result Cell
// =============================================================================

enum CellState<T> {
    Unset,
    Ready(Result<T>),
    Taken,
}

/// The single-assignment slot a task resolves into.
pub(crate) struct ResultCell<T> {
    task: TaskId,
    state: Mutex<CellState<T>>,
}

impl<T> ResultCell<T> {
    pub(crate) fn new(task: TaskId) -> Self {
        Self {
            task,
            state: Mutex::new(CellState::Unset),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CellState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores the task's outcome.
    ///
    /// # Panics
    ///
    /// If the cell was already resolved.
    pub(crate) fn resolve(&self, result: Result<T>) {
        let mut state = self.lock();
        assert!(
            matches!(*state, CellState::Unset),
            "task {} resolved more than once",
            self.task
        );
        *state = CellState::Ready(result);
    }

    pub(crate) fn is_resolved(&self) -> bool {
        !matches!(*self.lock(), CellState::Unset)
    }

    /// Moves the outcome out, leaving the cell `Taken`.
    pub(crate) fn take(&self) -> Option<Result<T>> {
        let mut state = self.lock();
        match mem::replace(&mut *state, CellState::Taken) {
            CellState::Ready(result) => Some(result),
            CellState::Unset => {
                *state = CellState::Unset;
                None
            }
            CellState::Taken => None,
        }
    }
}

// =============================================================================
// Erased Task
// =============================================================================

/// Receives a query task's result set (or fault) exactly once.
pub(crate) trait QuerySink: Send {
    fn bind(self: Box<Self>, rows: Result<ResultSet>);
}

struct MaterializeSink<T> {
    materializer: Materializer<T>,
    cell: Arc<ResultCell<T>>,
}

impl<T: Send> QuerySink for MaterializeSink<T> {
    fn bind(self: Box<Self>, rows: Result<ResultSet>) {
        let MaterializeSink { materializer, cell } = *self;
        cell.resolve(rows.and_then(materializer));
    }
}

pub(crate) enum TaskBody {
    Query {
        separable: bool,
        sink: Box<dyn QuerySink>,
    },
    Write {
        shape: Option<RowShape>,
        separable: bool,
        cell: Arc<ResultCell<()>>,
    },
}

/// A queued task with its identity assigned.
pub(crate) struct Task {
    id: TaskId,
    sql: Arc<str>,
    params: Vec<Value>,
    body: TaskBody,
}

impl Task {
    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn kind(&self) -> TaskKind {
        match self.body {
            TaskBody::Query { .. } => TaskKind::Query,
            TaskBody::Write { .. } => TaskKind::Write,
        }
    }

    pub(crate) fn is_query(&self) -> bool {
        self.kind() == TaskKind::Query
    }

    pub(crate) fn is_separable(&self) -> bool {
        match self.body {
            TaskBody::Query { separable, .. } | TaskBody::Write { separable, .. } => separable,
        }
    }

    /// The shape of a groupable write.
    pub(crate) fn row_shape(&self) -> Option<&RowShape> {
        match &self.body {
            TaskBody::Write { shape, .. } => shape.as_ref(),
            TaskBody::Query { .. } => None,
        }
    }

    pub(crate) fn sql(&self) -> &Arc<str> {
        &self.sql
    }

    pub(crate) fn param_count(&self) -> usize {
        self.params.len()
    }

    /// Moves the parameters out for wire encoding.
    pub(crate) fn take_params(&mut self) -> Vec<Value> {
        mem::take(&mut self.params)
    }

    /// Resolves a query task with its result set.
    ///
    /// Called only for query tasks; a write is resolved as successful instead.
    pub(crate) fn bind_rows(self, rows: ResultSet) -> Option<WriteFault> {
        match self.body {
            TaskBody::Query { sink, .. } => {
                sink.bind(Ok(rows));
                None
            }
            TaskBody::Write { cell, .. } => {
                cell.resolve(Ok(()));
                None
            }
        }
    }

    /// Resolves a write task as applied.
    pub(crate) fn bind_applied(self) -> Option<WriteFault> {
        match self.body {
            TaskBody::Write { cell, .. } => {
                cell.resolve(Ok(()));
                None
            }
            TaskBody::Query { sink, .. } => {
                sink.bind(Ok(ResultSet::default()));
                None
            }
        }
    }

    /// Faults the task. Write faults are returned so they can surface at the
    /// next point of truth.
    pub(crate) fn fault(self, error: Error) -> Option<WriteFault> {
        match self.body {
            TaskBody::Query { sink, .. } => {
                sink.bind(Err(error));
                None
            }
            TaskBody::Write { cell, .. } => {
                cell.resolve(Err(error.clone()));
                Some(WriteFault {
                    task: self.id,
                    error,
                })
            }
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("sql", &self.sql)
            .field("params", &self.params.len())
            .finish()
    }
}

// =============================================================================
// Handles
// =============================================================================

/// Caller-side view of an enqueued task.
///
/// Reading the value before the task is resolved forces the session to run
/// round trips until it is. With partial execution allowed this stops at the
/// task's own batch; otherwise the whole queue is drained.
pub struct TaskHandle<T> {
    id: TaskId,
    cell: Arc<ResultCell<T>>,
    session: Session,
}

/// Handle returned for a query task.
pub type QueryHandle<T> = TaskHandle<T>;

/// Handle returned for a write task.
pub type WriteHandle = TaskHandle<()>;

impl<T> TaskHandle<T> {
    pub(crate) fn new(id: TaskId, cell: Arc<ResultCell<T>>, session: Session) -> Self {
        Self { id, cell, session }
    }

    /// The task's submission id.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// True once the binder has written the task's outcome.
    pub fn is_resolved(&self) -> bool {
        self.cell.is_resolved()
    }

    /// Returns the task's value, running round trips if it is not resolved yet.
    ///
    /// A faulted task re-raises its fault here.
    pub async fn value(self) -> Result<T> {
        if let Some(result) = self.cell.take() {
            return result;
        }

        let driven = self.session.resolve_through(self.id).await;
        if let Some(result) = self.cell.take() {
            return result;
        }

        driven?;
        Err(Error::SessionClosed)
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

// =============================================================================
// Test Support
// =============================================================================


// =============================================================================
// Tests
// =============================================================================
