//! # Execution Context
//!
//! The context is the state machine that decides when work may join the
//! queue, when it must wait, and which batch goes out next.
//!
//! ## States
//!
//! ```text
//!            enqueue                  flush / handle read
//!   ┌──────┐ ───────▶ ┌──────────┐ ──────────────────────▶ ┌─────────────────┐
//!   │ Idle │          │ Building │                         │ Dispatched(b,s) │
//!   └──────┘ ◀─────── └──────────┘ ◀─────────────────────── └─────────────────┘
//!       ▲    nothing     queued       results bound, work left       │
//!       └──────────────────────────────────────────────────────────┘
//!                       results bound, nothing left
//! ```
//!
//! `Dispatched` remembers the batch in flight and whether it is separable.
//!
//! ## Reentrancy Rule
//!
//! While a non-separable batch is in flight, enqueuing a write fails with
//! [`Error::ReentrancyViolation`] unless the innermost live scope allows
//! partial execution. Queries are always accepted; reading one of them waits
//! for the in-flight batch because dispatch is serialized by the session.
//!
//! | Batch in flight | Separable when |
//! |-----------------|----------------|
//! | queries only | the provider has multiple active result sets |
//! | contains writes | no transaction is open, or partial execution is allowed |
//!
//! ## Scopes
//!
//! [`ExecutionContext`] values are scopes handed out by
//! [`Session::provide_context`](crate::Session::provide_context). Each one
//! pushes its `allow_partial_execution` flag; the innermost live scope wins;
//! dropping a scope pops its flag.

use std::collections::VecDeque;
use std::fmt;

use crate::error::{Error, Result, WriteFault};
use crate::executor::ProviderDescriptor;
use crate::planner::{Batch, BatchPlanner};
use crate::queue::TaskQueue;
use crate::session::Session;
use crate::task::Task;
use crate::types::{BatchId, ContextId, TaskId, TaskKind};
use crate::wire::{RoundTrip, RoundTripEncoder};

// =============================================================================
// Phase
// =============================================================================

/// Where the context is in its dispatch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextPhase {
    /// Nothing queued, nothing in flight.
    Idle,
    /// Tasks are queued (or planned) but no round trip is in flight.
    Building,
    /// A round trip is in flight.
    Dispatched {
        /// The batch being executed.
        batch: BatchId,
        /// Whether later work may proceed before its results are read.
        separable: bool,
    },
}

impl fmt::Display for ContextPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextPhase::Idle => f.write_str("idle"),
            ContextPhase::Building => f.write_str("building"),
            ContextPhase::Dispatched { batch, separable } => {
                write!(f, "dispatched(batch {batch}, separable: {separable})")
            }
        }
    }
}

// =============================================================================
// Context State
// =============================================================================

/// Mutable state of a session, guarded by the session's state lock.
///
/// Nothing in here awaits. The session takes the lock, makes a decision,
/// and releases it before any round trip.
pub(crate) struct ContextState {
    queue: TaskQueue,
    planned: VecDeque<Batch>,
    active: Vec<TaskId>,
    phase: ContextPhase,
    scopes: Vec<(ContextId, bool)>,
    in_transaction: bool,
    enqueued_while_dispatched: bool,
    write_faults: Vec<WriteFault>,
    planner: BatchPlanner,
    encoder: RoundTripEncoder,
    next_task: TaskId,
    multiple_active_result_sets: bool,
}

impl ContextState {
    pub(crate) fn new(
        planner: BatchPlanner,
        encoder: RoundTripEncoder,
        descriptor: &ProviderDescriptor,
    ) -> Self {
        Self {
            queue: TaskQueue::new(),
            planned: VecDeque::new(),
            active: Vec::new(),
            phase: ContextPhase::Idle,
            scopes: Vec::new(),
            in_transaction: false,
            enqueued_while_dispatched: false,
            write_faults: Vec::new(),
            planner,
            encoder,
            next_task: TaskId::FIRST,
            multiple_active_result_sets: descriptor.multiple_active_result_sets,
        }
    }

    // =========================================================================
    // Enqueue
    // =========================================================================

    /// Checks whether a task of `kind` may join the queue and assigns its id.
    pub(crate) fn admit(&mut self, kind: TaskKind) -> Result<TaskId> {
        self.queue.ensure_open()?;

        if kind == TaskKind::Write {
            if let ContextPhase::Dispatched {
                batch,
                separable: false,
            } = self.phase
            {
                if !self.allow_partial() {
                    return Err(Error::ReentrancyViolation { batch });
                }
            }
        }

        let id = self.next_task;
        self.next_task = id.next();
        Ok(id)
    }

    /// Appends an admitted task.
    pub(crate) fn push(&mut self, task: Task) -> Result<()> {
        if let Err((task, err)) = self.queue.enqueue(task) {
            task.fault(err.clone());
            return Err(err);
        }

        match self.phase {
            ContextPhase::Idle => self.phase = ContextPhase::Building,
            ContextPhase::Dispatched { .. } => self.enqueued_while_dispatched = true,
            ContextPhase::Building => {}
        }
        Ok(())
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Id of the most recently admitted task, or `TaskId(0)` if none.
    pub(crate) fn last_task_id(&self) -> TaskId {
        TaskId::from_raw(self.next_task.as_raw() - 1)
    }

    /// Id of the oldest task not yet dispatched.
    pub(crate) fn next_pending_id(&self) -> Option<TaskId> {
        self.planned
            .front()
            .and_then(|batch| batch.tasks().first())
            .or_else(|| self.queue.front())
            .map(Task::id)
    }

    /// Pops the next batch, planning the queue first if nothing is planned.
    pub(crate) fn next_batch(&mut self) -> Option<Batch> {
        if self.planned.is_empty() {
            let tasks = self.queue.drain_all();
            if !tasks.is_empty() {
                self.planned.extend(self.planner.plan(tasks));
            }
        }
        self.planned.pop_front()
    }

    /// Marks `batch` as in flight and encodes it.
    pub(crate) fn dispatch(&mut self, batch: &mut Batch) -> (RoundTrip, bool) {
        let separable = self.is_separable(batch);
        let round_trip = self.encoder.encode(batch);

        self.active = batch.task_ids();
        self.enqueued_while_dispatched = false;
        self.phase = ContextPhase::Dispatched {
            batch: batch.id(),
            separable,
        };
        (round_trip, separable)
    }

    /// Leaves `Dispatched` after a batch was bound.
    ///
    /// Returns true if tasks arrived while the batch was in flight.
    pub(crate) fn complete(&mut self, write_faults: Vec<WriteFault>) -> bool {
        self.active.clear();
        self.write_faults.extend(write_faults);
        self.settle();
        std::mem::take(&mut self.enqueued_while_dispatched)
    }

    /// Recomputes the phase from what is left.
    pub(crate) fn settle(&mut self) {
        self.phase = if self.queued_tasks() == 0 {
            ContextPhase::Idle
        } else {
            ContextPhase::Building
        };
    }

    pub(crate) fn is_separable(&self, batch: &Batch) -> bool {
        if batch.has_writes() {
            !self.in_transaction || self.allow_partial()
        } else {
            self.multiple_active_result_sets
        }
    }

    /// Removes every planned and queued task, in submission order.
    pub(crate) fn take_pending(&mut self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.planned.drain(..).flat_map(Batch::into_tasks).collect();
        tasks.extend(self.queue.drain_all());
        self.settle();
        tasks
    }

    /// Refuses further work and returns everything still pending.
    pub(crate) fn dispose(&mut self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.planned.drain(..).flat_map(Batch::into_tasks).collect();
        tasks.extend(self.queue.dispose());
        tasks
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.queue.is_disposed()
    }

    // =========================================================================
    // Transactions and Faults
    // =========================================================================

    pub(crate) fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub(crate) fn set_in_transaction(&mut self, active: bool) {
        self.in_transaction = active;
    }

    pub(crate) fn take_write_faults(&mut self) -> Vec<WriteFault> {
        std::mem::take(&mut self.write_faults)
    }

    pub(crate) fn record_write_faults(&mut self, faults: Vec<WriteFault>) {
        self.write_faults.extend(faults);
    }

    // =========================================================================
    // Scopes and Diagnostics
    // =========================================================================

    /// Flag of the innermost live scope; partial execution is off without one.
    pub(crate) fn allow_partial(&self) -> bool {
        self.scopes.last().is_some_and(|(_, allow)| *allow)
    }

    pub(crate) fn push_scope(&mut self, id: ContextId, allow_partial: bool) {
        self.scopes.push((id, allow_partial));
    }

    pub(crate) fn pop_scope(&mut self, id: ContextId) {
        self.scopes.retain(|(scope, _)| *scope != id);
    }

    pub(crate) fn phase(&self) -> ContextPhase {
        self.phase
    }

    pub(crate) fn active_tasks(&self) -> usize {
        self.active.len()
    }

    pub(crate) fn queued_tasks(&self) -> usize {
        self.queue.len() + self.planned.iter().map(Batch::len).sum::<usize>()
    }

    pub(crate) fn statements_rendered(&self) -> u64 {
        self.encoder.rendered()
    }
}

// =============================================================================
// Execution Context Scope
// =============================================================================

/// A scope over a session's execution context.
///
/// Returned by [`Session::provide_context`](crate::Session::provide_context).
/// While it is alive (and no newer scope is), its
/// `allow_partial_execution` flag governs the reentrancy rule and how far a
/// handle read drains the queue. Every scope has a distinct [`ContextId`].
pub struct ExecutionContext {
    id: ContextId,
    allow_partial_execution: bool,
    session: Session,
}

impl ExecutionContext {
    pub(crate) fn new(id: ContextId, allow_partial_execution: bool, session: Session) -> Self {
        Self {
            id,
            allow_partial_execution,
            session,
        }
    }

    /// Unique id of this scope.
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// The flag this scope was created with.
    pub fn allow_partial_execution(&self) -> bool {
        self.allow_partial_execution
    }

    /// Tasks bound to the batch currently in flight.
    pub fn active_tasks(&self) -> usize {
        self.session.active_tasks()
    }

    /// Tasks enqueued but not yet dispatched.
    pub fn queued_tasks(&self) -> usize {
        self.session.queued_tasks()
    }

    /// Current phase of the session's context.
    pub fn phase(&self) -> ContextPhase {
        self.session.phase()
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.session.pop_scope(self.id);
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("allow_partial_execution", &self.allow_partial_execution)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
