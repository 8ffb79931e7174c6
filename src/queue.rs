//! # Task Queue
//!
//! The ordered, per-session list of tasks that have been enqueued but not yet
//! planned into a batch.
//!
//! Enqueue appends at the tail and never blocks. `drain_all` hands the whole
//! queue to the planner in submission order. Once the queue is disposed it
//! refuses new tasks, and `dispose` returns whatever was left so the caller
//! can fault it.

use std::collections::VecDeque;

use crate::error::{Error, Result};
use crate::task::Task;

/// FIFO of not-yet-dispatched tasks.
#[derive(Debug, Default)]
pub(crate) struct TaskQueue {
    tasks: VecDeque<Task>,
    disposed: bool,
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Appends a task at the tail.
    ///
    /// On failure the task is handed back so its result cell can still be
    /// resolved by the caller.
    pub(crate) fn enqueue(&mut self, task: Task) -> std::result::Result<(), (Task, Error)> {
        if self.disposed {
            return Err((task, Error::ContextDisposed));
        }
        self.tasks.push_back(task);
        Ok(())
    }

    /// Removes and returns every queued task in submission order.
    pub(crate) fn drain_all(&mut self) -> Vec<Task> {
        self.tasks.drain(..).collect()
    }

    /// The oldest queued task.
    pub(crate) fn front(&self) -> Option<&Task> {
        self.tasks.front()
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Refuses further tasks and returns the ones still queued.
    pub(crate) fn dispose(&mut self) -> Vec<Task> {
        self.disposed = true;
        self.drain_all()
    }

    /// Fails fast when the queue no longer accepts tasks.
    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.disposed {
            Err(Error::ContextDisposed)
        } else {
            Ok(())
        }
    }
}
