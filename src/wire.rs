//! # Wire Encoding
//!
//! A [`RoundTrip`] is the transport-facing form of a batch: the statements to
//! send, in order, with their parameters already moved out of the tasks.
//!
//! ## Layout
//!
//! | Batch kind | Statements | Rows per statement |
//! |------------|------------|--------------------|
//! | `Single` | one per task | 1 |
//! | `SmallGroup` / `LargeGroup` | exactly one multi-row `INSERT` | batch length |
//!
//! The transport answers with one [`StatementResult`] per statement, in
//! order. A response may stop early when the provider aborts the round trip;
//! the failure that stopped it must be the last entry.
//!
//! ## Statement Text Cache
//!
//! Group statement text depends only on `(shape, rows)`. Rendering
//! `INSERT ... VALUES (?, ?), (?, ?), ...` for 256 rows is a few kilobytes
//! of string building, and the same handful of sizes repeat for every flush,
//! so rendered texts are kept in an LRU cache and shared via `Arc<str>`.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use crate::planner::{Batch, BatchKind};
use crate::types::{BatchId, ResultSet, RowShape, Value};

/// Default capacity of the group statement text cache.
pub const DEFAULT_STATEMENT_CACHE_CAPACITY: usize = 64;

// =============================================================================
// Request
// =============================================================================

/// One physical round trip, ready for a transport.
#[derive(Debug, Clone)]
pub struct RoundTrip {
    /// Batch this round trip executes.
    pub batch: BatchId,
    /// How the batch was rendered.
    pub kind: BatchKind,
    /// Statements in submission order.
    pub statements: Vec<WireStatement>,
}

impl RoundTrip {
    /// Total parameters bound across all statements.
    pub fn param_count(&self) -> usize {
        self.statements.iter().map(|s| s.params.len()).sum()
    }

    /// Number of statements expected to return rows.
    pub fn query_count(&self) -> usize {
        self.statements.iter().filter(|s| s.returns_rows).count()
    }
}

/// One statement inside a round trip.
#[derive(Debug, Clone)]
pub struct WireStatement {
    /// SQL text.
    pub text: Arc<str>,
    /// Positional parameters.
    pub params: Vec<Value>,
    /// True for query statements.
    pub returns_rows: bool,
    /// Number of task rows this statement covers.
    pub rows: usize,
    /// Single-row text for group statements, used to replay rows one at a
    /// time when the provider cannot say which row failed.
    pub row_text: Option<Arc<str>>,
}

impl WireStatement {
    /// Parameters bound per covered row.
    pub fn params_per_row(&self) -> usize {
        if self.rows == 0 {
            0
        } else {
            self.params.len() / self.rows
        }
    }
}

// =============================================================================
// Response
// =============================================================================

/// Successful outcome of one statement.
#[derive(Debug, Clone, PartialEq)]
pub enum StatementOutcome {
    /// The statement produced a result set.
    Rows(ResultSet),
    /// The statement changed this many rows.
    Affected(usize),
}

/// Which of a statement's rows a failure applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureExtent {
    /// The whole statement failed and the provider cannot narrow it down.
    Statement,
    /// Exactly these rows (0-based within the statement) failed; the others
    /// were applied.
    Rows(Vec<usize>),
    /// The row at this index and every row after it failed.
    From(usize),
}

/// A statement-level failure reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderFailure {
    /// Provider message.
    pub message: String,
    /// Provider error code, if any.
    pub code: Option<i32>,
    /// Rows affected by the failure.
    pub extent: FailureExtent,
}

impl ProviderFailure {
    /// A failure covering the whole statement.
    pub fn statement(message: impl Into<String>, code: Option<i32>) -> Self {
        Self {
            message: message.into(),
            code,
            extent: FailureExtent::Statement,
        }
    }
}

/// Result of one statement of a round trip.
pub type StatementResult = std::result::Result<StatementOutcome, ProviderFailure>;

// =============================================================================
// Encoder
// =============================================================================

/// Renders batches into round trips.
pub(crate) struct RoundTripEncoder {
    texts: LruCache<(RowShape, usize), Arc<str>>,
    rendered: u64,
}

impl RoundTripEncoder {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            texts: LruCache::new(capacity),
            rendered: 0,
        }
    }

    /// Number of group texts rendered (cache misses) so far.
    pub(crate) fn rendered(&self) -> u64 {
        self.rendered
    }

    /// Builds the round trip for `batch`, moving parameters out of its tasks.
    pub(crate) fn encode(&mut self, batch: &mut Batch) -> RoundTrip {
        let id = batch.id();
        let kind = batch.kind();

        let statements = match batch.row_shape().cloned() {
            Some(shape) => {
                let rows = batch.len();
                let text = self.group_text(&shape, rows);
                let row_text = self.group_text(&shape, 1);
                let params = batch
                    .tasks_mut()
                    .iter_mut()
                    .flat_map(|task| task.take_params())
                    .collect();

                vec![WireStatement {
                    text,
                    params,
                    returns_rows: false,
                    rows,
                    row_text: Some(row_text),
                }]
            }
            None => batch
                .tasks_mut()
                .iter_mut()
                .map(|task| WireStatement {
                    text: Arc::clone(task.sql()),
                    params: task.take_params(),
                    returns_rows: task.is_query(),
                    rows: 1,
                    row_text: None,
                })
                .collect(),
        };

        RoundTrip {
            batch: id,
            kind,
            statements,
        }
    }

    fn group_text(&mut self, shape: &RowShape, rows: usize) -> Arc<str> {
        let key = (shape.clone(), rows);
        if let Some(text) = self.texts.get(&key) {
            return Arc::clone(text);
        }

        self.rendered += 1;
        let text: Arc<str> = Arc::from(shape.statement_for_rows(rows));
        self.texts.put(key, Arc::clone(&text));
        text
    }
}

// =============================================================================
// Tests
// =============================================================================
