//! # Batch Planner
//!
//! The planner partitions a drained task list into batches. Each batch is
//! exactly one physical round trip.
//!
//! ## Sizing Policy
//!
//! Consecutive writes built from the same [`RowShape`] form a *run*. A run of
//! `n` rows is cut like this:
//!
//! ```text
//! large = min(large_group_rows, max_parameters / params_per_row)
//!
//! n = 2 * large + small + 2
//! ┌──────────────┬──────────────┬───────┬────┐
//! │ Large (large)│ Large (large)│ Small │ 2  │
//! └──────────────┴──────────────┴───────┴────┘
//!    multi-row      multi-row     multi   one Single round trip
//!    INSERT         INSERT        INSERT  of single-row INSERTs
//! ```
//!
//! Large-Groups come first, then at most one Small-Group if at least
//! `small_group_rows` rows remain, then the leftovers concatenated into one
//! Single round trip.
//!
//! Everything else (queries, writes without a shape, runs of one) is a
//! standalone task. Adjacent standalone tasks share a Single round trip only
//! when every one of them is separable, and a query additionally needs a
//! provider with multiple active result sets.
//!
//! ## Invariants
//!
//! - Concatenating every batch's tasks gives back the input in order
//! - No batch binds more than `max_parameters` parameters, unless a single
//!   task alone already does
//! - No batch carries more than `max_statements_per_round_trip` statements
//! - Zero tasks plan to zero batches

use std::fmt;

use crate::error::{Error, Result};
use crate::executor::ProviderDescriptor;
use crate::task::Task;
use crate::types::{BatchId, RowShape, TaskId};

// =============================================================================
// Configuration
// =============================================================================

/// Default row count of a Small-Group batch.
pub const DEFAULT_SMALL_GROUP_ROWS: usize = 16;

/// Default upper bound on the row count of a Large-Group batch.
///
/// The provider's parameter limit may lower it further.
pub const DEFAULT_LARGE_GROUP_ROWS: usize = 256;

/// Default cap on statements concatenated into one Single round trip.
pub const DEFAULT_MAX_STATEMENTS_PER_ROUND_TRIP: usize = 1000;

/// Planner thresholds.
///
/// The right numbers depend on the provider and the workload, so they are
/// inputs rather than constants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannerConfig {
    /// Rows per Small-Group batch.
    pub small_group_rows: usize,

    /// Maximum rows per Large-Group batch.
    pub large_group_rows: usize,

    /// Maximum statements per Single round trip.
    pub max_statements_per_round_trip: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            small_group_rows: DEFAULT_SMALL_GROUP_ROWS,
            large_group_rows: DEFAULT_LARGE_GROUP_ROWS,
            max_statements_per_round_trip: DEFAULT_MAX_STATEMENTS_PER_ROUND_TRIP,
        }
    }
}

impl PlannerConfig {
    /// Checks that the thresholds describe a usable policy.
    pub fn validate(&self) -> Result<()> {
        if self.small_group_rows < 2 {
            return Err(Error::Config(format!(
                "small_group_rows must be at least 2, got {}",
                self.small_group_rows
            )));
        }
        if self.large_group_rows <= self.small_group_rows {
            return Err(Error::Config(format!(
                "large_group_rows ({}) must exceed small_group_rows ({})",
                self.large_group_rows, self.small_group_rows
            )));
        }
        if self.max_statements_per_round_trip == 0 {
            return Err(Error::Config(
                "max_statements_per_round_trip must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Batches
// =============================================================================

/// How a batch's tasks are rendered on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchKind {
    /// One statement per task, sent together in one round trip.
    Single,
    /// One multi-row `INSERT` of `small_group_rows` rows.
    SmallGroup,
    /// One multi-row `INSERT` sized by the provider's parameter limit.
    LargeGroup,
}

impl BatchKind {
    /// True for the multi-row kinds.
    pub fn is_group(&self) -> bool {
        matches!(self, BatchKind::SmallGroup | BatchKind::LargeGroup)
    }
}

impl fmt::Display for BatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BatchKind::Single => "single",
            BatchKind::SmallGroup => "small-group",
            BatchKind::LargeGroup => "large-group",
        };
        f.write_str(name)
    }
}

/// An ordered, non-empty list of tasks bound for one round trip.
#[derive(Debug)]
pub(crate) struct Batch {
    id: BatchId,
    kind: BatchKind,
    tasks: Vec<Task>,
}

impl Batch {
    pub(crate) fn id(&self) -> BatchId {
        self.id
    }

    pub(crate) fn kind(&self) -> BatchKind {
        self.kind
    }

    pub(crate) fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub(crate) fn tasks_mut(&mut self) -> &mut [Task] {
        &mut self.tasks
    }

    pub(crate) fn into_tasks(self) -> Vec<Task> {
        self.tasks
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn task_ids(&self) -> Vec<TaskId> {
        self.tasks.iter().map(Task::id).collect()
    }

    #[cfg(test)]
    pub(crate) fn param_count(&self) -> usize {
        self.tasks.iter().map(Task::param_count).sum()
    }

    pub(crate) fn has_writes(&self) -> bool {
        self.tasks.iter().any(|t| !t.is_query())
    }

    /// Shape shared by every row of a group batch.
    pub(crate) fn row_shape(&self) -> Option<&RowShape> {
        if self.kind.is_group() {
            self.tasks.first().and_then(Task::row_shape)
        } else {
            None
        }
    }
}

// =============================================================================
// Planner
// =============================================================================

/// Standalone tasks waiting to be closed into a Single batch.
#[derive(Default)]
struct Pending {
    tasks: Vec<Task>,
    params: usize,
}

/// Turns drained task lists into batches.
pub(crate) struct BatchPlanner {
    config: PlannerConfig,
    max_parameters: usize,
    multiple_active_result_sets: bool,
    next_id: BatchId,
}

impl BatchPlanner {
    pub(crate) fn new(config: PlannerConfig, descriptor: &ProviderDescriptor) -> Self {
        Self {
            config,
            max_parameters: descriptor.max_parameters.max(1),
            multiple_active_result_sets: descriptor.multiple_active_result_sets,
            next_id: BatchId::FIRST,
        }
    }

    /// Rows per Large-Group batch for a shape.
    pub(crate) fn large_rows(&self, shape: &RowShape) -> usize {
        let per_row = shape.params_per_row().max(1);
        self.config
            .large_group_rows
            .min(self.max_parameters / per_row)
            .max(1)
    }

    /// Partitions `tasks` into batches, preserving order.
    pub(crate) fn plan(&mut self, tasks: Vec<Task>) -> Vec<Batch> {
        let mut batches = Vec::new();
        let mut pending = Pending::default();
        let mut tasks = tasks.into_iter().peekable();

        while let Some(task) = tasks.next() {
            let Some(shape) = task.row_shape().cloned() else {
                self.push_standalone(task, &mut pending, &mut batches);
                continue;
            };

            let mut run = vec![task];
            while let Some(next) = tasks.next_if(|t| t.row_shape() == Some(&shape)) {
                run.push(next);
            }

            if run.len() == 1 {
                if let Some(task) = run.pop() {
                    self.push_standalone(task, &mut pending, &mut batches);
                }
                continue;
            }

            self.close_pending(&mut pending, &mut batches);
            self.plan_run(&shape, run, &mut batches);
        }

        self.close_pending(&mut pending, &mut batches);
        batches
    }

    fn plan_run(&mut self, shape: &RowShape, run: Vec<Task>, out: &mut Vec<Batch>) {
        let large = self.large_rows(shape);
        let small = self.config.small_group_rows;

        let large_groups = run.len() / large;
        let remainder = run.len() - large_groups * large;

        let mut rows = run.into_iter();
        for _ in 0..large_groups {
            let group: Vec<Task> = rows.by_ref().take(large).collect();
            self.emit(BatchKind::LargeGroup, group, out);
        }
        // At most one Small-Group; the rest rides in the trailing Single.
        if small < large && remainder >= small {
            let group: Vec<Task> = rows.by_ref().take(small).collect();
            self.emit(BatchKind::SmallGroup, group, out);
        }

        let mut leftovers = Pending::default();
        for task in rows {
            if !self.fits(&leftovers, &task) {
                self.close_pending(&mut leftovers, out);
            }
            leftovers.params += task.param_count();
            leftovers.tasks.push(task);
        }
        self.close_pending(&mut leftovers, out);
    }

    fn push_standalone(&mut self, task: Task, pending: &mut Pending, out: &mut Vec<Batch>) {
        if !self.concatenable(&task) {
            self.close_pending(pending, out);
            self.emit(BatchKind::Single, vec![task], out);
            return;
        }

        if !self.fits(pending, &task) {
            self.close_pending(pending, out);
        }
        pending.params += task.param_count();
        pending.tasks.push(task);
    }

    /// A standalone task may share its round trip with neighbours.
    fn concatenable(&self, task: &Task) -> bool {
        task.is_separable() && (!task.is_query() || self.multiple_active_result_sets)
    }

    fn fits(&self, pending: &Pending, task: &Task) -> bool {
        pending.tasks.is_empty()
            || (pending.tasks.len() < self.config.max_statements_per_round_trip
                && pending.params + task.param_count() <= self.max_parameters)
    }

    fn close_pending(&mut self, pending: &mut Pending, out: &mut Vec<Batch>) {
        let pending = std::mem::take(pending);
        if !pending.tasks.is_empty() {
            self.emit(BatchKind::Single, pending.tasks, out);
        }
    }

    fn emit(&mut self, kind: BatchKind, tasks: Vec<Task>, out: &mut Vec<Batch>) {
        debug_assert!(!tasks.is_empty(), "batches are never empty");
        let id = self.next_id;
        self.next_id = id.next();
        out.push(Batch { id, kind, tasks });
    }
}

// =============================================================================
// Tests
// =============================================================================
