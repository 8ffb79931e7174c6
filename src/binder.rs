//! # Result Binder
//!
//! After a round trip returns, the binder walks the batch's tasks in
//! submission order and resolves each one exactly once:
//!
//! | Statement result | Query task | Write task |
//! |------------------|------------|------------|
//! | `Rows(rs)` | materialize `rs` | protocol fault |
//! | `Affected(n)` | protocol fault | success |
//! | `Err(failure)` covering the task | `ProviderExecution` | `ProviderExecution` |
//! | `Err(failure)` not covering it (group rows) | n/a | success |
//! | missing (provider aborted) | the abort's failure | the abort's failure |
//!
//! ## Integrity Check First
//!
//! Before anything is bound, the response is lined up against the batch.
//! If the number or kind of results does not match, every task of the batch
//! is faulted with `ResultSetMismatch`: once the stream is misaligned no
//! result in it can be attributed to a task with confidence.
//!
//! Binding runs outside the session's state lock, so materializers may do
//! real work without blocking enqueue.

use tracing::{debug, warn};

use crate::error::{Error, Result, WriteFault};
use crate::planner::Batch;
use crate::task::Task;
use crate::types::ResultSet;
use crate::wire::{FailureExtent, ProviderFailure, StatementOutcome, StatementResult};

/// What binding one batch did.
#[derive(Debug, Default)]
pub(crate) struct BindSummary {
    pub(crate) resolved: usize,
    pub(crate) faulted: usize,
    pub(crate) write_faults: Vec<WriteFault>,
}

impl BindSummary {
    fn record(&mut self, ok: bool, fault: Option<WriteFault>) {
        if ok {
            self.resolved += 1;
        } else {
            self.faulted += 1;
        }
        self.write_faults.extend(fault);
    }
}

/// Outcome chosen for one task before it is applied.
enum Binding {
    Rows(ResultSet),
    Applied,
    Fault(Error),
}

/// Resolves every task of `batch` from the round trip's response.
pub(crate) fn bind(batch: Batch, response: Result<Vec<StatementResult>>) -> BindSummary {
    let id = batch.id();
    let group = batch.kind().is_group();

    let mut results = match response {
        Ok(results) => results,
        Err(err) => {
            debug!(batch = %id, error = %err, "round trip failed; faulting whole batch");
            return fault_all(batch.into_tasks(), err);
        }
    };

    if let Err(mismatch) = check_alignment(&batch, &results) {
        warn!(batch = %id, error = %mismatch, "result stream does not match batch");
        return fault_all(batch.into_tasks(), mismatch);
    }

    // Set only when the provider stopped early; alignment guarantees the
    // last entry is then a failure.
    let abort = if results.len() < statement_count(&batch) {
        results.last().and_then(|r| r.as_ref().err()).cloned()
    } else {
        None
    };

    let mut summary = BindSummary::default();
    for (position, task) in batch.into_tasks().into_iter().enumerate() {
        let (index, row) = if group { (0, position) } else { (position, 0) };

        let binding = match results.get_mut(index) {
            Some(Ok(StatementOutcome::Rows(rows))) => Binding::Rows(std::mem::take(rows)),
            Some(Ok(StatementOutcome::Affected(_))) => Binding::Applied,
            Some(Err(failure)) if covers(&failure.extent, row) => {
                Binding::Fault(provider_error(position, failure))
            }
            Some(Err(_)) => Binding::Applied,
            None => match &abort {
                Some(failure) => Binding::Fault(provider_error(position, failure)),
                None => Binding::Fault(Error::ResultSetMismatch {
                    expected: index + 1,
                    received: results.len(),
                }),
            },
        };

        match binding {
            Binding::Rows(rows) => summary.record(true, task.bind_rows(rows)),
            Binding::Applied => summary.record(true, task.bind_applied()),
            Binding::Fault(err) => summary.record(false, task.fault(err)),
        }
    }

    debug!(
        batch = %id,
        resolved = summary.resolved,
        faulted = summary.faulted,
        "bound batch results"
    );
    summary
}

/// Faults every task with the same error.
pub(crate) fn fault_all(tasks: Vec<Task>, err: Error) -> BindSummary {
    let mut summary = BindSummary::default();
    for task in tasks {
        summary.record(false, task.fault(err.clone()));
    }
    summary
}

fn statement_count(batch: &Batch) -> usize {
    if batch.kind().is_group() {
        1
    } else {
        batch.len()
    }
}

/// Verifies that results line up one-to-one with the batch's statements.
fn check_alignment(batch: &Batch, results: &[StatementResult]) -> Result<()> {
    let statements = statement_count(batch);
    let expected = batch.tasks().iter().filter(|t| t.is_query()).count();
    let received = results
        .iter()
        .filter(|r| matches!(r, Ok(StatementOutcome::Rows(_))))
        .count();
    let mismatch = || Error::ResultSetMismatch { expected, received };

    if results.len() > statements {
        return Err(mismatch());
    }
    if results.len() < statements && !matches!(results.last(), Some(Err(_))) {
        return Err(mismatch());
    }

    let group = batch.kind().is_group();
    for (index, result) in results.iter().enumerate() {
        let returns_rows = !group && batch.tasks()[index].is_query();
        match result {
            Ok(StatementOutcome::Rows(_)) if !returns_rows => return Err(mismatch()),
            Ok(StatementOutcome::Affected(_)) if returns_rows => return Err(mismatch()),
            _ => {}
        }
    }
    Ok(())
}

/// True if a failure with this extent applies to the statement's `row`.
fn covers(extent: &FailureExtent, row: usize) -> bool {
    match extent {
        FailureExtent::Statement => true,
        FailureExtent::Rows(rows) => rows.contains(&row),
        FailureExtent::From(first) => row >= *first,
    }
}

fn provider_error(position: usize, failure: &ProviderFailure) -> Error {
    Error::ProviderExecution {
        position,
        code: failure.code,
        message: failure.message.clone(),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ProviderDescriptor;
    use crate::planner::{BatchKind, BatchPlanner, PlannerConfig};
    use crate::task::testing;
    use crate::types::{RowShape, Value};

    fn planner_with(large_group_rows: usize) -> BatchPlanner {
        BatchPlanner::new(
            PlannerConfig {
                small_group_rows: 2,
                large_group_rows,
                max_statements_per_round_trip: 100,
            },
            &ProviderDescriptor {
                max_parameters: 1000,
                multiple_active_result_sets: true,
                supports_cancellation: false,
            },
        )
    }

    fn one_batch(tasks: Vec<Task>) -> Batch {
        let mut batches = planner_with(8).plan(tasks);
        assert_eq!(batches.len(), 1);
        batches.remove(0)
    }

    fn rows(n: usize) -> StatementResult {
        Ok(StatementOutcome::Rows(ResultSet::new(
            vec!["v".to_string()],
            vec![vec![Value::Integer(0)]; n],
        )))
    }

    fn failure(extent: FailureExtent) -> StatementResult {
        Err(ProviderFailure {
            message: "constraint failed".to_string(),
            code: Some(19),
            extent,
        })
    }

    fn group_of(n: u64) -> Batch {
        let shape = RowShape::new("t", ["a"]);
        let mut batches = planner_with(n as usize)
            .plan((1..=n).map(|id| testing::insert(id, &shape)).collect());
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].kind(), BatchKind::LargeGroup);
        batches.remove(0)
    }

    fn positions(summary: &BindSummary) -> Vec<usize> {
        summary
            .write_faults
            .iter()
            .map(|f| match f.error {
                Error::ProviderExecution { position, .. } => position,
                ref other => panic!("unexpected fault {other}"),
            })
            .collect()
    }

    #[test]
    fn test_single_batch_binds_in_order() {
        let (q1, c1) = testing::query(1, true);
        let (q2, c2) = testing::query(3, true);
        let batch = one_batch(vec![q1, testing::write(2, true), q2]);

        let summary = bind(
            batch,
            Ok(vec![rows(2), Ok(StatementOutcome::Affected(1)), rows(5)]),
        );

        assert_eq!(summary.resolved, 3);
        assert_eq!(summary.faulted, 0);
        assert_eq!(c1.take().unwrap().unwrap(), 2);
        assert_eq!(c2.take().unwrap().unwrap(), 5);
    }

    #[test]
    fn test_missing_result_set_is_fatal_to_batch() {
        let (q1, c1) = testing::query(1, true);
        let (q2, c2) = testing::query(2, true);
        let batch = one_batch(vec![q1, q2]);

        let summary = bind(batch, Ok(vec![rows(1)]));
        assert_eq!(summary.faulted, 2);
        for cell in [c1, c2] {
            assert!(matches!(
                cell.take().unwrap(),
                Err(Error::ResultSetMismatch {
                    expected: 2,
                    received: 1
                })
            ));
        }
    }

    #[test]
    fn test_wrong_result_kind_is_mismatch() {
        let (q, cell) = testing::query(1, true);
        let batch = one_batch(vec![q, testing::write(2, true)]);

        let summary = bind(
            batch,
            Ok(vec![Ok(StatementOutcome::Affected(0)), Ok(StatementOutcome::Affected(1))]),
        );
        assert_eq!(summary.faulted, 2);
        assert_eq!(summary.write_faults.len(), 1);
        assert!(matches!(
            cell.take().unwrap(),
            Err(Error::ResultSetMismatch { .. })
        ));
    }

    #[test]
    fn test_group_row_failure_faults_exactly_that_row() {
        let summary = bind(group_of(6), Ok(vec![failure(FailureExtent::Rows(vec![2]))]));
        assert_eq!(summary.resolved, 5);
        assert_eq!(positions(&summary), vec![2]);
    }

    #[test]
    fn test_group_failure_from_row_faults_the_tail() {
        let summary = bind(group_of(6), Ok(vec![failure(FailureExtent::From(4))]));
        assert_eq!(summary.resolved, 4);
        assert_eq!(positions(&summary), vec![4, 5]);
    }

    #[test]
    fn test_undisambiguated_group_failure_faults_every_row() {
        let summary = bind(group_of(3), Ok(vec![failure(FailureExtent::Statement)]));
        assert_eq!(summary.resolved, 0);
        assert_eq!(positions(&summary), vec![0, 1, 2]);
    }

    #[test]
    fn test_aborted_response_faults_remaining_tasks() {
        let batch = one_batch((1..=4).map(|id| testing::write(id, true)).collect());
        let summary = bind(
            batch,
            Ok(vec![
                Ok(StatementOutcome::Affected(1)),
                failure(FailureExtent::Statement),
            ]),
        );

        assert_eq!(summary.resolved, 1);
        assert_eq!(positions(&summary), vec![1, 2, 3]);
    }

    #[test]
    fn test_transport_error_faults_everything() {
        let (q, cell) = testing::query(1, true);
        let batch = one_batch(vec![q, testing::write(2, true)]);

        let summary = bind(batch, Err(Error::Cancelled));
        assert_eq!(summary.faulted, 2);
        assert!(matches!(cell.take().unwrap(), Err(Error::Cancelled)));
        assert!(matches!(summary.write_faults[0].error, Error::Cancelled));
    }
}
