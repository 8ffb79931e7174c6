//! # roundtrip - Command Batching and Round-Trip Execution
//!
//! roundtrip sits between a data-access session and its physical database
//! connection. It provides:
//!
//! - **Deferred work**: query tasks (SQL + materializer) and pending writes
//!   accumulate in a per-session queue
//! - **Round-trip minimization**: a planner folds same-shape inserts into
//!   multi-row statements sized by the provider's parameter limit and
//!   concatenates separable statements into shared round trips
//! - **Exactly-once, in-order binding**: every task's result cell is written
//!   once, in submission order, from the result sets of its own round trip
//! - **Reentrancy safety**: writes cannot slip into a non-separable batch
//!   that is already on the wire
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 Session (async) / BlockingSession               │
//! │        enqueue_query · enqueue_write · flush · transactions     │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Execution Context                          │
//! │                                                                 │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐ │
//! │  │ Task Queue  │─▶│   Batch     │─▶│  Result Binder          │ │
//! │  │             │  │   Planner   │  │  (in submission order)  │ │
//! │  └─────────────┘  └─────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ one batch = one round trip
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │             Executor thread → Transport (SQLite)                │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **One round trip in flight** per session at any instant
//! 2. **Order**: concatenating all batches gives back submission order
//! 3. **Limits**: no batch binds more parameters than the provider allows
//! 4. **Exactly once**: a task's result cell is written exactly once
//! 5. **No silent success**: a fault never resolves a sibling as successful
//!
//! ## Module Organization
//!
//! - [`error`]: Error enum and `Result` alias
//! - [`types`]: Identifiers, row shapes and result sets
//! - [`task`]: Task builders, result cells and handles
//! - [`planner`]: Batch sizing and grouping policy
//! - [`wire`]: Round-trip encoding and statement results
//! - [`executor`]: Transport trait and the executor thread
//! - [`sqlite`]: SQLite transport
//! - [`context`]: Execution context state machine and scopes
//! - [`session`]: Async entry point
//! - [`blocking`]: Synchronous facade

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for batching and execution.
///
/// A single cloneable error enum: one provider fault can be fanned out to
/// every task it affects.
pub mod error;

/// Domain types: task, batch and scope identifiers, row shapes, result sets.
pub mod types;

/// Query and write tasks, their result cells, and caller-side handles.
pub mod task;

/// Task queue (internal).
mod queue;

/// Batch planner.
///
/// Splits drained task lists into Single, Small-Group and Large-Group
/// batches under the provider's parameter limit.
pub mod planner;

/// Round-trip encoding.
///
/// Renders batches into statements and defines the per-statement results a
/// transport returns.
pub mod wire;

/// Transport abstraction and the dedicated executor thread.
pub mod executor;

/// SQLite transport with SAVEPOINT isolation and row-level failure replay.
pub mod sqlite;

/// Result binder (internal).
mod binder;

/// Execution context: dispatch state machine, reentrancy guard and scopes.
pub mod context;

/// Async session API.
///
/// The main entry point is [`Session`](session::Session).
pub mod session;

/// Synchronous facade over a session.
pub mod blocking;

// =============================================================================
// Re-exports
// =============================================================================

pub use blocking::BlockingSession;
pub use context::{ContextPhase, ExecutionContext};
pub use error::{Error, Result, WriteFault};
pub use executor::{Interrupt, ProviderDescriptor, Transport};
pub use planner::{BatchKind, PlannerConfig};
pub use session::{FlushReport, Session, SessionConfig};
pub use sqlite::SqliteTransport;
pub use task::{QueryHandle, QueryTask, TaskHandle, WriteHandle, WriteTask};
pub use types::{BatchId, ContextId, ResultSet, Row, RowShape, TaskId, TaskKind, Value};
pub use wire::{
    FailureExtent, ProviderFailure, RoundTrip, StatementOutcome, StatementResult, WireStatement,
};

// Token type taken by `Session::flush_with_cancel`.
pub use tokio_util::sync::CancellationToken;
