//! # Session: The Public Entry Point
//!
//! A [`Session`] owns one physical connection (through its executor thread)
//! and one execution context. Producers enqueue tasks; callers force
//! resolution by flushing or by reading a handle.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use roundtrip::{QueryTask, RowShape, Session, SessionConfig, Value, WriteTask};
//!
//! #[tokio::main]
//! async fn main() -> roundtrip::Result<()> {
//!     let session = Session::open_sqlite("app.db", SessionConfig::default())?;
//!     let users = RowShape::new("users", ["id", "name"]);
//!
//!     for id in 0..1000 {
//!         let row = vec![Value::Integer(id), Value::Text(format!("user-{id}"))];
//!         session.enqueue_write(WriteTask::insert(&users, row)?)?;
//!     }
//!     let total = session.enqueue_query(QueryTask::new(
//!         "SELECT count(*) FROM users",
//!         vec![],
//!         |rs| Ok(rs.scalar::<i64>()?.unwrap_or(0)),
//!     ))?;
//!
//!     // Reading the handle runs the planned round trips.
//!     println!("{} users", total.value().await?);
//!
//!     session.close().await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       Session (Clone = Arc)                       │
//! │                                                                   │
//! │  state: std Mutex<ContextState>      dispatch: tokio Mutex<()>    │
//! │  ┌──────────┐  ┌─────────┐  ┌───────┐                             │
//! │  │  queue   │─▶│ planner │─▶│planned│── one batch at a time ──┐   │
//! │  └──────────┘  └─────────┘  └───────┘                         │   │
//! │       ▲                                                       ▼   │
//! │  enqueue_*                                     executor thread    │
//! │  (sync, never waits)                           (one round trip)   │
//! │                                                       │           │
//! │  handles ◀──── binder (outside the state lock) ◀──────┘           │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Two Locks, Two Jobs
//!
//! - The **state lock** (`std::sync::Mutex`) guards the context. It is held
//!   only for short, synchronous decisions and never across an `.await`, so
//!   enqueue stays non-blocking even while a round trip is in flight.
//! - The **dispatch lock** (`tokio::sync::Mutex`) is held by whoever is
//!   running round trips. It is what guarantees that at most one batch is in
//!   flight per session. A handle read that finds a round trip in progress
//!   simply waits for it.
//!
//! ## Points of Truth
//!
//! Write failures are stored in the write's own handle and also recorded on
//! the session. [`Session::flush`] and [`Session::commit`] report everything
//! recorded since the last point of truth as [`Error::WritesFailed`].

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::binder;
use crate::context::{ContextPhase, ContextState, ExecutionContext};
use crate::error::{Error, Result};
use crate::executor::{
    Executor, ProviderDescriptor, TransactionOp, Transport, DEFAULT_EXECUTOR_CHANNEL_SIZE,
};
use crate::planner::{BatchPlanner, PlannerConfig};
use crate::sqlite::SqliteTransport;
use crate::task::{QueryHandle, QueryTask, Task, TaskHandle, WriteHandle, WriteTask};
use crate::types::{ContextId, TaskId, TaskKind};
use crate::wire::{RoundTripEncoder, DEFAULT_STATEMENT_CACHE_CAPACITY};

// =============================================================================
// Configuration
// =============================================================================

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Batch sizing thresholds.
    pub planner: PlannerConfig,

    /// Upper bound on one round trip. Expiry behaves like cancellation.
    pub round_trip_timeout: Option<Duration>,

    /// Capacity of the group statement text cache.
    pub statement_cache_capacity: usize,

    /// Bound of the executor request channel.
    pub executor_channel_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            planner: PlannerConfig::default(),
            round_trip_timeout: None,
            statement_cache_capacity: DEFAULT_STATEMENT_CACHE_CAPACITY,
            executor_channel_size: DEFAULT_EXECUTOR_CHANNEL_SIZE,
        }
    }
}

impl SessionConfig {
    /// Checks every threshold.
    pub fn validate(&self) -> Result<()> {
        self.planner.validate()?;
        if self.statement_cache_capacity == 0 {
            return Err(Error::Config(
                "statement_cache_capacity must be at least 1".to_string(),
            ));
        }
        if self.executor_channel_size == 0 {
            return Err(Error::Config(
                "executor_channel_size must be at least 1".to_string(),
            ));
        }
        if self.round_trip_timeout == Some(Duration::ZERO) {
            return Err(Error::Config(
                "round_trip_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// What a flush did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Physical round trips executed.
    pub round_trips: usize,
    /// Tasks resolved with a value.
    pub resolved: usize,
    /// Tasks resolved with a fault.
    pub faulted: usize,
}

// =============================================================================
// Session
// =============================================================================

struct SessionInner {
    state: Mutex<ContextState>,
    dispatch: tokio::sync::Mutex<()>,
    executor: Executor,
    shutdown: CancellationToken,
    closed: AtomicBool,
    next_scope: AtomicU64,
    round_trip_timeout: Option<Duration>,
}

/// Handle to a batching session. Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    // =========================================================================
    // Construction
    // =========================================================================

    /// Creates a session over any transport.
    ///
    /// The transport is moved onto the session's executor thread.
    pub fn with_transport<T: Transport>(transport: T, config: SessionConfig) -> Result<Self> {
        config.validate()?;

        let executor = Executor::spawn(transport, config.executor_channel_size)?;
        let descriptor = executor.descriptor();
        let state = ContextState::new(
            BatchPlanner::new(config.planner.clone(), &descriptor),
            RoundTripEncoder::new(config.statement_cache_capacity),
            &descriptor,
        );

        debug!(
            max_parameters = descriptor.max_parameters,
            mars = descriptor.multiple_active_result_sets,
            cancellation = descriptor.supports_cancellation,
            "session opened"
        );

        Ok(Self {
            inner: Arc::new(SessionInner {
                state: Mutex::new(state),
                dispatch: tokio::sync::Mutex::new(()),
                executor,
                shutdown: CancellationToken::new(),
                closed: AtomicBool::new(false),
                next_scope: AtomicU64::new(1),
                round_trip_timeout: config.round_trip_timeout,
            }),
        })
    }

    /// Opens a session over a SQLite database file.
    pub fn open_sqlite(path: impl AsRef<Path>, config: SessionConfig) -> Result<Self> {
        Self::with_transport(SqliteTransport::open(path)?, config)
    }

    /// Opens a session over a private in-memory SQLite database.
    pub fn open_sqlite_in_memory(config: SessionConfig) -> Result<Self> {
        Self::with_transport(SqliteTransport::open_in_memory()?, config)
    }

    fn lock_state(&self) -> MutexGuard<'_, ContextState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Enqueue
    // =========================================================================

    /// Queues a deferred read and returns its handle.
    ///
    /// Never waits. Queries are accepted even while a non-separable batch is
    /// in flight.
    ///
    /// # Errors
    ///
    /// `Error::ContextDisposed` after [`Session::close`].
    pub fn enqueue_query<T: Send + 'static>(&self, task: QueryTask<T>) -> Result<QueryHandle<T>> {
        let mut state = self.lock_state();
        let id = state.admit(TaskKind::Query)?;
        let (task, cell) = task.into_task(id);
        state.push(task)?;
        Ok(TaskHandle::new(id, cell, self.clone()))
    }

    /// Queues a write. It runs at the next flush, commit or handle read.
    ///
    /// The returned handle may be dropped; a failure still surfaces at the
    /// next point of truth.
    ///
    /// # Errors
    ///
    /// - `Error::ReentrancyViolation` while a non-separable batch is in flight
    ///   and partial execution is not allowed
    /// - `Error::ContextDisposed` after [`Session::close`]
    pub fn enqueue_write(&self, task: WriteTask) -> Result<WriteHandle> {
        let mut state = self.lock_state();
        let id = state.admit(TaskKind::Write)?;
        let (task, cell) = task.into_task(id);
        state.push(task)?;
        Ok(TaskHandle::new(id, cell, self.clone()))
    }

    /// Opens a new execution context scope.
    ///
    /// The scope's flag applies until it is dropped or a newer scope is
    /// opened. Every call returns a scope with a fresh id.
    pub fn provide_context(&self, allow_partial_execution: bool) -> ExecutionContext {
        let id = ContextId::from_raw(self.inner.next_scope.fetch_add(1, Ordering::Relaxed));
        self.lock_state().push_scope(id, allow_partial_execution);
        ExecutionContext::new(id, allow_partial_execution, self.clone())
    }

    pub(crate) fn pop_scope(&self, id: ContextId) {
        self.lock_state().pop_scope(id);
    }

    // =========================================================================
    // Flush
    // =========================================================================

    /// Executes every queued task and waits until each one is resolved.
    ///
    /// # Errors
    ///
    /// - `Error::WritesFailed` if any write failed since the last point of
    ///   truth (this flush or an earlier handle read)
    /// - `Error::Cancelled` / `Error::SessionClosed` if the run was stopped
    pub async fn flush(&self) -> Result<FlushReport> {
        self.flush_with_cancel(&CancellationToken::new()).await
    }

    /// Like [`Session::flush`], but stops when `cancel` fires.
    ///
    /// A round trip in flight is interrupted and its tasks fault with
    /// `Error::Cancelled`. Tasks not yet dispatched fault with
    /// `Error::Cancelled` without reaching the connection.
    pub async fn flush_with_cancel(&self, cancel: &CancellationToken) -> Result<FlushReport> {
        let _dispatch = self.inner.dispatch.lock().await;

        let target = self.lock_state().last_task_id();
        let report = self.run(target, cancel).await?;

        let faults = self.lock_state().take_write_faults();
        if !faults.is_empty() {
            warn!(faults = faults.len(), "writes failed since last point of truth");
            return Err(Error::WritesFailed(faults));
        }
        Ok(report)
    }

    /// Runs round trips until `id` is resolved. Used by handle reads.
    ///
    /// With partial execution allowed only the batches up to and including
    /// the task's own are run; otherwise the whole queue is drained.
    pub(crate) async fn resolve_through(&self, id: TaskId) -> Result<()> {
        let _dispatch = self.inner.dispatch.lock().await;

        let target = {
            let state = self.lock_state();
            if state.allow_partial() {
                id
            } else {
                state.last_task_id().max(id)
            }
        };
        self.run(target, &CancellationToken::new()).await.map(|_| ())
    }

    /// The dispatch loop. The caller must hold the dispatch lock.
    ///
    /// Runs batches in order until no task with an id up to `target` is
    /// pending. When a separable batch completes and work arrived while it
    /// was in flight, the target is extended to cover that work too.
    async fn run(&self, mut target: TaskId, cancel: &CancellationToken) -> Result<FlushReport> {
        let mut report = FlushReport::default();

        loop {
            let (batch, round_trip, separable) = {
                let mut state = self.lock_state();
                match state.next_pending_id() {
                    Some(next) if next <= target => {}
                    _ => break,
                }
                if cancel.is_cancelled() {
                    let pending = state.take_pending();
                    drop(state);
                    self.fault_pending(pending, Error::Cancelled, &mut report);
                    return Err(Error::Cancelled);
                }

                let Some(mut batch) = state.next_batch() else {
                    state.settle();
                    break;
                };
                let (round_trip, separable) = state.dispatch(&mut batch);
                (batch, round_trip, separable)
            };

            debug!(
                batch = %batch.id(),
                kind = %batch.kind(),
                tasks = batch.len(),
                separable,
                "dispatching batch"
            );

            let response = self
                .inner
                .executor
                .execute(
                    round_trip,
                    cancel,
                    &self.inner.shutdown,
                    self.inner.round_trip_timeout,
                )
                .await;
            let stopped = match &response {
                Err(err) if err.is_cancellation() => Some(err.clone()),
                _ => None,
            };
            let failed = match &response {
                Err(err) if !err.is_cancellation() => Some(err.clone()),
                _ => None,
            };

            let summary = binder::bind(batch, response);
            report.round_trips += 1;
            report.resolved += summary.resolved;
            report.faulted += summary.faulted;

            let arrived = self.lock_state().complete(summary.write_faults);

            if let Some(err) = stopped {
                let pending = self.lock_state().take_pending();
                self.fault_pending(pending, err.clone(), &mut report);
                return Err(err);
            }
            if let Some(err) = failed {
                warn!(error = %err, "round trip failed");
                return Err(err);
            }

            if separable && arrived {
                target = target.max(self.lock_state().last_task_id());
            }
        }

        Ok(report)
    }

    fn fault_pending(&self, pending: Vec<Task>, err: Error, report: &mut FlushReport) {
        if pending.is_empty() {
            return;
        }
        debug!(tasks = pending.len(), error = %err, "faulting undispatched tasks");
        let summary = binder::fault_all(pending, err);
        report.faulted += summary.faulted;
        self.lock_state().record_write_faults(summary.write_faults);
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Opens a transaction on the connection.
    ///
    /// Work queued before the call is executed first, outside the
    /// transaction. Write failures recorded up to this point are reported
    /// as `Error::WritesFailed` and no transaction is opened.
    pub async fn begin_transaction(&self) -> Result<()> {
        let _dispatch = self.inner.dispatch.lock().await;
        {
            let state = self.lock_state();
            if state.is_disposed() {
                return Err(Error::ContextDisposed);
            }
            if state.in_transaction() {
                return Err(Error::Transaction("a transaction is already active".to_string()));
            }
        }

        let target = self.lock_state().last_task_id();
        self.run(target, &CancellationToken::new()).await?;
        let faults = self.lock_state().take_write_faults();
        if !faults.is_empty() {
            return Err(Error::WritesFailed(faults));
        }

        self.inner.executor.transaction(TransactionOp::Begin).await?;
        self.lock_state().set_in_transaction(true);
        info!("transaction started");
        Ok(())
    }

    /// Flushes queued work and commits.
    ///
    /// If any write failed since the last point of truth, the transaction is
    /// rolled back instead and the failures are returned. If the flush itself
    /// fails, tasks it did not reach fault with `Error::Cancelled`, the
    /// transaction is rolled back and the flush error is returned. Write
    /// failures stay recorded for the next flush in that case.
    pub async fn commit(&self) -> Result<()> {
        let _dispatch = self.inner.dispatch.lock().await;
        if !self.lock_state().in_transaction() {
            return Err(Error::Transaction("no transaction is active".to_string()));
        }

        let target = self.lock_state().last_task_id();
        if let Err(err) = self.run(target, &CancellationToken::new()).await {
            let pending = self.lock_state().take_pending();
            let mut report = FlushReport::default();
            self.fault_pending(pending, Error::Cancelled, &mut report);

            if let Err(rollback) = self.finish_transaction(TransactionOp::Rollback).await {
                warn!(error = %rollback, "rollback after failed commit failed");
            }
            warn!(error = %err, discarded = report.faulted, "commit failed, transaction rolled back");
            return Err(err);
        }

        let faults = self.lock_state().take_write_faults();
        if !faults.is_empty() {
            self.finish_transaction(TransactionOp::Rollback).await?;
            warn!(faults = faults.len(), "transaction rolled back");
            return Err(Error::WritesFailed(faults));
        }

        self.finish_transaction(TransactionOp::Commit).await?;
        info!("transaction committed");
        Ok(())
    }

    /// Rolls back the open transaction.
    ///
    /// Tasks still queued are discarded and fault with `Error::Cancelled`.
    /// Write failures recorded inside the transaction are dropped with it.
    pub async fn rollback(&self) -> Result<()> {
        let _dispatch = self.inner.dispatch.lock().await;
        if !self.lock_state().in_transaction() {
            return Err(Error::Transaction("no transaction is active".to_string()));
        }

        let pending = self.lock_state().take_pending();
        let mut report = FlushReport::default();
        self.fault_pending(pending, Error::Cancelled, &mut report);
        self.lock_state().take_write_faults();

        self.finish_transaction(TransactionOp::Rollback).await?;
        info!(discarded = report.faulted, "transaction rolled back");
        Ok(())
    }

    async fn finish_transaction(&self, op: TransactionOp) -> Result<()> {
        let result = self.inner.executor.transaction(op).await;
        self.lock_state().set_in_transaction(false);
        result
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Tears the session down.
    ///
    /// Queued tasks and the batch in flight fault with
    /// `Error::SessionClosed`, an open transaction is rolled back, and the
    /// executor thread is joined before this returns. Closing twice is a
    /// no-op.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let pending = self.lock_state().dispose();
        let mut report = FlushReport::default();
        self.fault_pending(pending, Error::SessionClosed, &mut report);
        self.inner.shutdown.cancel();

        // Waits for any in-flight run to observe the shutdown.
        let _dispatch = self.inner.dispatch.lock().await;

        let mut result = Ok(());
        if self.lock_state().in_transaction() {
            result = self.finish_transaction(TransactionOp::Rollback).await;
            if let Err(err) = &result {
                warn!(error = %err, "rollback during close failed");
            }
        }
        self.lock_state().take_write_faults();

        self.inner.executor.shutdown().await;
        info!(faulted = report.faulted, "session closed");
        result
    }

    /// True once [`Session::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Current phase of the execution context.
    pub fn phase(&self) -> ContextPhase {
        self.lock_state().phase()
    }

    /// Tasks bound to the batch in flight.
    pub fn active_tasks(&self) -> usize {
        self.lock_state().active_tasks()
    }

    /// Tasks queued or planned but not yet dispatched.
    pub fn queued_tasks(&self) -> usize {
        self.lock_state().queued_tasks()
    }

    /// True while a transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.lock_state().in_transaction()
    }

    /// Capabilities reported by the transport.
    pub fn descriptor(&self) -> ProviderDescriptor {
        self.inner.executor.descriptor()
    }

    /// Number of distinct group statement texts rendered so far.
    pub fn statements_rendered(&self) -> u64 {
        self.lock_state().statements_rendered()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        f.debug_struct("Session")
            .field("phase", &state.phase())
            .field("queued", &state.queued_tasks())
            .field("active", &state.active_tasks())
            .field("in_transaction", &state.in_transaction())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
