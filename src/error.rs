//! # Error Handling for the Round-Trip Engine
//!
//! This module defines the error type used throughout the crate. A single
//! error enum ([`Error`]) represents every failure mode, whether it is raised
//! at the call site (enqueue, flush) or stored in a task's result cell and
//! re-raised when the caller reads the task's handle.
//!
//! ## Rust Pattern: thiserror
//!
//! We use the `thiserror` crate to derive `std::error::Error` implementations.
//! The `#[error(...)]` attributes provide `Display`, and `#[source]` keeps the
//! underlying SQLite error reachable through `Error::source()`.
//!
//! ## Why is `Error` Clone?
//!
//! One provider fault can affect many tasks at once: a result-set mismatch
//! faults every task of the batch, a provider abort faults every statement
//! after the failing one, and teardown faults everything still pending. Each
//! of those tasks owns its own copy of the fault, so the error must be
//! cloneable. `rusqlite::Error` is not, which is why it is held in an `Arc`.
//!
//! ## Error Categories
//!
//! | Category | Variants | Typical Response |
//! |----------|----------|------------------|
//! | Caller misuse | `ReentrancyViolation`, `ContextDisposed`, `InvalidTask`, `Config` | Fix the calling code |
//! | Provider | `ProviderExecution`, `Sqlite` | Inspect the statement, maybe retry at session level |
//! | Protocol | `ResultSetMismatch` | Investigate; never retried |
//! | Lifecycle | `Cancelled`, `SessionClosed`, `Transaction` | Stop or restart the unit of work |
//! | Point of truth | `WritesFailed` | Roll back or compensate |

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::types::{BatchId, TaskId};

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur while batching and executing tasks.
#[derive(Error, Debug, Clone)]
pub enum Error {
    // =========================================================================
    // Caller Errors
    // =========================================================================

    /// A write was enqueued while a non-separable batch was in flight.
    ///
    /// # When This Happens
    ///
    /// A batch of writes dispatched inside a transaction must be fully read
    /// before a causally-dependent write may join the queue, unless the
    /// current scope allows partial execution. Query-only batches on a
    /// provider without multiple active result sets are non-separable too.
    ///
    /// # Recovery
    ///
    /// Await the in-flight flush (or read a handle from it), then enqueue
    /// again. The in-flight round trip is unaffected.
    #[error("reentrancy violation: write enqueued while non-separable batch {batch} is in flight")]
    ReentrancyViolation {
        /// The batch that was dispatched when the write arrived.
        batch: BatchId,
    },

    /// The session was torn down; no more tasks can be enqueued.
    #[error("execution context disposed: session has been closed")]
    ContextDisposed,

    /// A task was built with inconsistent arguments.
    #[error("invalid task: {0}")]
    InvalidTask(String),

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    Config(String),

    // =========================================================================
    // Provider Errors
    // =========================================================================

    /// The provider reported a statement failure for the task at `position`.
    ///
    /// `position` is the task's index inside its batch. When a grouped
    /// statement fails and the provider cannot say which row caused it, every
    /// task covered by the failure carries its own position and the same
    /// message.
    #[error("provider error at batch position {position}: {message}")]
    ProviderExecution {
        /// Index of the faulted task within its batch.
        position: usize,
        /// Provider-specific error code, if one was reported.
        code: Option<i32>,
        /// Provider message.
        message: String,
    },

    /// SQLite operation failed outside of statement execution.
    ///
    /// This covers opening the database, pragmas, and transaction control.
    /// Statement-level failures inside a round trip are reported as
    /// [`Error::ProviderExecution`] instead.
    #[error("sqlite error: {0}")]
    Sqlite(#[source] Arc<rusqlite::Error>),

    // =========================================================================
    // Protocol Errors
    // =========================================================================

    /// The number or kind of result sets did not match the batch.
    ///
    /// Always fatal to the whole batch: once the stream of results cannot be
    /// lined up with the tasks, no result in it can be trusted.
    #[error("result set mismatch: expected {expected} result set(s), received {received}")]
    ResultSetMismatch {
        /// Number of query tasks in the batch.
        expected: usize,
        /// Number of row-bearing results returned by the provider.
        received: usize,
    },

    /// A materializer rejected its result set.
    #[error("materializer failed: {0}")]
    Materialize(String),

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================

    /// The round trip or the pending task was cancelled.
    #[error("cancelled before the task was resolved")]
    Cancelled,

    /// The session was closed while the task was still queued or active.
    #[error("session closed before the task was resolved")]
    SessionClosed,

    /// A transaction boundary was used out of order.
    #[error("transaction error: {0}")]
    Transaction(String),

    /// The executor thread is gone or dropped a reply.
    #[error("executor error: {0}")]
    Executor(String),

    /// One or more writes failed since the last point of truth.
    #[error("{} write task(s) failed; first: {}", .0.len(), FirstFault(.0))]
    WritesFailed(Vec<WriteFault>),
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Sqlite(Arc::new(err))
    }
}

impl Error {
    /// Returns true for faults produced by cancellation or teardown.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::SessionClosed)
    }
}

// =============================================================================
// Write Faults
// =============================================================================

/// A failed write task, reported at the next flush or commit.
#[derive(Debug, Clone)]
pub struct WriteFault {
    /// The task that failed.
    pub task: TaskId,
    /// Why it failed.
    pub error: Error,
}

impl fmt::Display for WriteFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task {}: {}", self.task, self.error)
    }
}

/// Display helper for the first fault of a `WritesFailed` list.
struct FirstFault<'a>(&'a [WriteFault]);

impl fmt::Display for FirstFault<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.first() {
            Some(fault) => fault.fmt(f),
            None => f.write_str("none"),
        }
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
