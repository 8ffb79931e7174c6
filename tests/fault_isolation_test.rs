//! Fault Isolation Tests
//!
//! Tests that a fault never resolves a sibling as successful and never
//! spreads further than it has to:
//! - Row-level group failures fault exactly the covered rows
//! - A short response ends with the failure that stopped it
//! - A misaligned response faults the whole batch
//! - A materializer error stays with its own task
//! - A failed round trip leaves later batches queued

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::ScriptedTransport;
use roundtrip::{
    Error, FailureExtent, PlannerConfig, ProviderFailure, QueryTask, Session, SessionConfig,
    StatementOutcome, WriteHandle,
};

fn group_config() -> SessionConfig {
    SessionConfig {
        planner: PlannerConfig {
            small_group_rows: 2,
            large_group_rows: 8,
            ..PlannerConfig::default()
        },
        ..SessionConfig::default()
    }
}

fn failing_group(extent: FailureExtent) -> ScriptedTransport {
    let (transport, _recorder) = ScriptedTransport::new();
    transport.with_script(move |trip| {
        if trip.kind.is_group() {
            Ok(vec![Err(ProviderFailure {
                message: "UNIQUE constraint failed: items.id".to_string(),
                code: Some(2067),
                extent: extent.clone(),
            })])
        } else {
            Ok(common::echo(trip))
        }
    })
}

fn enqueue_group(session: &Session, rows: i64) -> Vec<WriteHandle> {
    let shape = common::items_shape();
    (0..rows)
        .map(|id| session.enqueue_write(common::item_row(&shape, id)).unwrap())
        .collect()
}

async fn outcomes(handles: Vec<WriteHandle>) -> Vec<Result<(), Error>> {
    let mut out = Vec::new();
    for handle in handles {
        out.push(handle.value().await);
    }
    out
}

/// A failure naming row k faults task k only.
#[tokio::test]
async fn fault_row_extent_faults_exactly_one_task() {
    let session = common::scripted_session_with(
        failing_group(FailureExtent::Rows(vec![3])),
        group_config(),
    );
    let handles = enqueue_group(&session, 8);
    let failed_id = handles[3].id();

    let err = session.flush().await.unwrap_err();
    match err {
        Error::WritesFailed(faults) => {
            assert_eq!(faults.len(), 1);
            assert_eq!(faults[0].task, failed_id);
        }
        other => panic!("expected WritesFailed, got {other:?}"),
    }

    for (position, outcome) in outcomes(handles).await.into_iter().enumerate() {
        if position == 3 {
            assert!(matches!(
                outcome,
                Err(Error::ProviderExecution { position: 3, code: Some(2067), .. })
            ));
        } else {
            assert!(outcome.is_ok(), "row {position} should have been applied");
        }
    }
    session.close().await.unwrap();
}

/// A failure from row k onward faults k..M-1 and keeps 0..k-1.
#[tokio::test]
async fn fault_from_extent_faults_tail() {
    let session =
        common::scripted_session_with(failing_group(FailureExtent::From(5)), group_config());
    let handles = enqueue_group(&session, 8);

    let err = session.flush().await.unwrap_err();
    assert!(matches!(&err, Error::WritesFailed(faults) if faults.len() == 3));

    for (position, outcome) in outcomes(handles).await.into_iter().enumerate() {
        if position < 5 {
            assert!(outcome.is_ok());
        } else {
            assert!(matches!(
                outcome,
                Err(Error::ProviderExecution { position: p, .. }) if p == position
            ));
        }
    }
    session.close().await.unwrap();
}

/// An undisambiguated group failure faults every row with its own position.
#[tokio::test]
async fn fault_statement_extent_faults_every_row() {
    let session =
        common::scripted_session_with(failing_group(FailureExtent::Statement), group_config());
    let handles = enqueue_group(&session, 8);

    let report = session.flush().await;
    assert!(matches!(report, Err(Error::WritesFailed(faults)) if faults.len() == 8));

    for (position, outcome) in outcomes(handles).await.into_iter().enumerate() {
        match outcome {
            Err(Error::ProviderExecution { position: p, message, .. }) => {
                assert_eq!(p, position);
                assert!(message.contains("UNIQUE"));
            }
            other => panic!("row {position}: expected provider error, got {other:?}"),
        }
    }
    session.close().await.unwrap();
}

/// The provider stopped after a failure: later statements share its fault.
#[tokio::test]
async fn fault_short_response_propagates_abort() {
    let (transport, _recorder) = ScriptedTransport::new();
    let transport = transport.with_script(|_| {
        Ok(vec![Ok(StatementOutcome::Affected(1)), common::failed("disk I/O error")])
    });
    let session = common::scripted_session(transport);

    let handles: Vec<WriteHandle> = (0..4)
        .map(|n| {
            session
                .enqueue_write(common::tagged_write(n).separable())
                .unwrap()
        })
        .collect();

    assert!(session.flush().await.is_err());
    let results = outcomes(handles).await;
    assert!(results[0].is_ok());
    for (position, outcome) in results.into_iter().enumerate().skip(1) {
        match outcome {
            Err(Error::ProviderExecution { position: p, message, .. }) => {
                assert_eq!(p, position);
                assert_eq!(message, "disk I/O error");
            }
            other => panic!("task {position}: expected provider error, got {other:?}"),
        }
    }
    session.close().await.unwrap();
}

/// A write result where a result set was expected faults the whole batch.
#[tokio::test]
async fn fault_result_kind_mismatch_faults_whole_batch() {
    let (transport, _recorder) = ScriptedTransport::new();
    let transport = transport.with_script(|trip| {
        Ok(trip
            .statements
            .iter()
            .map(|_| Ok(StatementOutcome::Affected(0)))
            .collect())
    });
    let session = common::scripted_session(transport);

    let handles: Vec<_> = (0..3)
        .map(|n| {
            session
                .enqueue_query(common::echo_query(n).separable())
                .unwrap()
        })
        .collect();

    // Query faults are reported through their handles only.
    session.flush().await.unwrap();

    for handle in handles {
        assert!(matches!(
            handle.value().await,
            Err(Error::ResultSetMismatch { expected: 3, received: 0 })
        ));
    }
    session.close().await.unwrap();
}

/// More results than statements can never be attributed.
#[tokio::test]
async fn fault_extra_results_fault_whole_batch() {
    let (transport, _recorder) = ScriptedTransport::new();
    let transport = transport.with_script(|trip| {
        let mut results = common::echo(trip);
        results.extend(common::echo(trip));
        Ok(results)
    });
    let session = common::scripted_session(transport);

    let a = session.enqueue_query(common::echo_query(1).separable()).unwrap();
    let b = session.enqueue_query(common::echo_query(2).separable()).unwrap();
    session.flush().await.unwrap();

    assert!(matches!(a.value().await, Err(Error::ResultSetMismatch { .. })));
    assert!(matches!(b.value().await, Err(Error::ResultSetMismatch { .. })));
    session.close().await.unwrap();
}

/// A materializer that rejects its rows does not disturb its neighbours.
#[tokio::test]
async fn fault_materializer_error_is_local() {
    let (transport, _recorder) = ScriptedTransport::new();
    let session = common::scripted_session(transport);

    let before = session.enqueue_query(common::echo_query(1).separable()).unwrap();
    let broken = session
        .enqueue_query(
            QueryTask::new("SELECT ?", vec![], |_rs| -> roundtrip::Result<i64> {
                Err(Error::Materialize("unexpected shape".to_string()))
            })
            .separable(),
        )
        .unwrap();
    let after = session.enqueue_query(common::echo_query(3).separable()).unwrap();

    session.flush().await.unwrap();
    assert_eq!(before.value().await.unwrap(), 1);
    assert!(matches!(broken.value().await, Err(Error::Materialize(_))));
    assert_eq!(after.value().await.unwrap(), 3);
    session.close().await.unwrap();
}

/// A round trip that fails as a whole faults its batch and stops the run.
#[tokio::test]
async fn fault_transport_error_stops_run_and_keeps_rest_queued() {
    let calls = Arc::new(AtomicUsize::new(0));
    let (transport, recorder) = ScriptedTransport::new();
    let transport = {
        let calls = Arc::clone(&calls);
        transport.with_script(move |trip| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::Executor("connection reset".to_string()))
            } else {
                Ok(common::echo(trip))
            }
        })
    };
    let session = common::scripted_session(transport);

    let first = session.enqueue_query(common::echo_query(1)).unwrap();
    let second = session.enqueue_query(common::echo_query(2)).unwrap();

    assert!(matches!(session.flush().await, Err(Error::Executor(_))));
    assert!(matches!(first.value().await, Err(Error::Executor(_))));
    assert!(!second.is_resolved());
    assert_eq!(session.queued_tasks(), 1);

    assert_eq!(second.value().await.unwrap(), 2);
    assert_eq!(recorder.count(), 2);
    session.close().await.unwrap();
}
