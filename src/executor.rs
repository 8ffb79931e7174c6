//! # Batch Executor
//!
//! The executor turns one [`RoundTrip`] into exactly one exchange with the
//! physical connection and hands back the per-statement results.
//!
//! ## Architecture
//!
//! A physical connection is rarely `Sync` (a `rusqlite::Connection` is not),
//! and a round trip blocks for as long as the database takes. The transport is
//! therefore moved onto a dedicated OS thread and driven through channels:
//!
//! ```text
//!   Session (async)                         Executor thread
//!  ┌──────────────────┐   mpsc (bounded)   ┌──────────────────────┐
//!  │ execute(trip) ───┼───────────────────▶│ blocking_recv()      │
//!  │                  │                    │   transport.execute()│
//!  │ select! {        │◀───────────────────┼── oneshot reply      │
//!  │   reply,         │                    └──────────┬───────────┘
//!  │   cancel,        │                               │
//!  │   shutdown,      │      interrupt handle         ▼
//!  │   timeout }  ────┼──────────────────────▶  physical connection
//!  └──────────────────┘
//! ```
//!
//! The round trip is the only point where a caller suspends. Waiting on the
//! reply races the caller's cancellation token, the session's shutdown token
//! and an optional timeout; whichever wins first decides the outcome. When
//! cancellation wins, the transport's interrupt handle (if it has one) is
//! fired so the connection stops working on a reply nobody will read.
//!
//! ## Provider Capabilities
//!
//! What the connection can do is reported once as a [`ProviderDescriptor`].
//! The planner and the reentrancy guard branch on its flags rather than on
//! the type of transport.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::wire::{RoundTrip, StatementResult};

/// Default bound of the executor request channel.
pub const DEFAULT_EXECUTOR_CHANNEL_SIZE: usize = 64;

// =============================================================================
// Provider Descriptor
// =============================================================================

/// Capabilities of the physical connection behind a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderDescriptor {
    /// Maximum number of parameters one round trip may bind.
    pub max_parameters: usize,

    /// The provider can keep several result sets open and read them
    /// independently. Query batches are separable only when this is set.
    pub multiple_active_result_sets: bool,

    /// The provider can abort an in-flight round trip.
    pub supports_cancellation: bool,
}

// =============================================================================
// Transport Trait
// =============================================================================

/// Cooperative abort of an in-flight round trip.
pub trait Interrupt: Send + Sync {
    /// Asks the connection to stop the statement it is running.
    fn interrupt(&self);
}

impl Interrupt for rusqlite::InterruptHandle {
    fn interrupt(&self) {
        rusqlite::InterruptHandle::interrupt(self);
    }
}

/// The "send statements, read results" primitive of a physical connection.
///
/// # Contract
///
/// - `execute` returns one [`StatementResult`] per statement, in order
/// - if the provider aborts the round trip, the response may be shorter, but
///   its last entry must be the failure that stopped it
/// - `Err` means nothing in the round trip can be trusted
///
/// Implementations run on the executor thread and are never shared, so they
/// only need to be `Send`.
pub trait Transport: Send + 'static {
    /// Capabilities of this connection.
    fn descriptor(&self) -> ProviderDescriptor;

    /// Executes one round trip.
    fn execute(&mut self, round_trip: &RoundTrip) -> Result<Vec<StatementResult>>;

    /// Opens a transaction.
    fn begin(&mut self) -> Result<()>;

    /// Commits the open transaction.
    fn commit(&mut self) -> Result<()>;

    /// Rolls back the open transaction.
    fn rollback(&mut self) -> Result<()>;

    /// Handle used to abort an in-flight round trip from another thread.
    fn interrupt_handle(&self) -> Option<Arc<dyn Interrupt>> {
        None
    }
}

// =============================================================================
// Requests
// =============================================================================

/// Transaction boundary sent to the executor thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransactionOp {
    Begin,
    Commit,
    Rollback,
}

impl fmt::Display for TransactionOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionOp::Begin => "begin",
            TransactionOp::Commit => "commit",
            TransactionOp::Rollback => "rollback",
        };
        f.write_str(name)
    }
}

enum ExecutorRequest {
    RoundTrip {
        round_trip: RoundTrip,
        reply: oneshot::Sender<Result<Vec<StatementResult>>>,
    },
    Transaction {
        op: TransactionOp,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

// =============================================================================
// Executor Handle
// =============================================================================

/// Owner of the executor thread.
///
/// Dropping the handle closes the request channel, which stops the thread
/// once it finishes the request it is working on. [`Executor::shutdown`]
/// additionally waits for it.
pub(crate) struct Executor {
    tx: mpsc::Sender<ExecutorRequest>,
    descriptor: ProviderDescriptor,
    interrupt: Option<Arc<dyn Interrupt>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Executor {
    /// Moves `transport` onto a new executor thread.
    pub(crate) fn spawn<T: Transport>(transport: T, channel_size: usize) -> Result<Self> {
        let descriptor = transport.descriptor();
        let interrupt = if descriptor.supports_cancellation {
            transport.interrupt_handle()
        } else {
            None
        };

        let (tx, rx) = mpsc::channel(channel_size.max(1));
        let thread = thread::Builder::new()
            .name("roundtrip-executor".to_string())
            .spawn(move || run_executor(transport, rx))
            .map_err(|e| Error::Executor(format!("failed to spawn executor thread: {e}")))?;

        Ok(Self {
            tx,
            descriptor,
            interrupt,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub(crate) fn descriptor(&self) -> ProviderDescriptor {
        self.descriptor
    }

    /// Sends one round trip and waits for its results.
    ///
    /// # Errors
    ///
    /// - `Error::Cancelled` if `cancel` fires or `timeout` elapses first
    /// - `Error::SessionClosed` if `shutdown` fires first
    /// - `Error::Executor` if the thread is gone
    /// - whatever the transport returned for the round trip as a whole
    pub(crate) async fn execute(
        &self,
        round_trip: RoundTrip,
        cancel: &CancellationToken,
        shutdown: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<Vec<StatementResult>> {
        if shutdown.is_cancelled() {
            return Err(Error::SessionClosed);
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let batch = round_trip.batch;
        let (reply, response) = oneshot::channel();
        self.tx
            .send(ExecutorRequest::RoundTrip { round_trip, reply })
            .await
            .map_err(|_| Error::Executor("executor thread has shut down".to_string()))?;

        let deadline = async {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;

            result = response => {
                result.map_err(|_| Error::Executor("executor dropped round-trip reply".to_string()))?
            }
            _ = shutdown.cancelled() => {
                self.interrupt();
                debug!(batch = %batch, "round trip abandoned by session shutdown");
                Err(Error::SessionClosed)
            }
            _ = cancel.cancelled() => {
                self.interrupt();
                warn!(batch = %batch, "round trip cancelled");
                Err(Error::Cancelled)
            }
            _ = deadline => {
                self.interrupt();
                warn!(batch = %batch, timeout = ?timeout, "round trip timed out");
                Err(Error::Cancelled)
            }
        }
    }

    /// Runs a transaction boundary on the connection.
    pub(crate) async fn transaction(&self, op: TransactionOp) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(ExecutorRequest::Transaction { op, reply })
            .await
            .map_err(|_| Error::Executor("executor thread has shut down".to_string()))?;

        response
            .await
            .map_err(|_| Error::Executor(format!("executor dropped {op} reply")))?
    }

    /// Stops the executor thread and waits for it to exit.
    ///
    /// Calling this more than once is harmless.
    pub(crate) async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(ExecutorRequest::Shutdown { ack }).await.is_ok() {
            let _ = done.await;
        }

        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("executor thread panicked");
            }
        }
    }

    fn interrupt(&self) {
        if let Some(interrupt) = &self.interrupt {
            interrupt.interrupt();
        }
    }
}

/// The executor thread's main loop.
fn run_executor<T: Transport>(mut transport: T, mut rx: mpsc::Receiver<ExecutorRequest>) {
    while let Some(request) = rx.blocking_recv() {
        match request {
            ExecutorRequest::RoundTrip { round_trip, reply } => {
                debug!(
                    batch = %round_trip.batch,
                    kind = %round_trip.kind,
                    statements = round_trip.statements.len(),
                    params = round_trip.param_count(),
                    "executing round trip"
                );
                let result = transport.execute(&round_trip);
                let _ = reply.send(result);
            }
            ExecutorRequest::Transaction { op, reply } => {
                let result = match op {
                    TransactionOp::Begin => transport.begin(),
                    TransactionOp::Commit => transport.commit(),
                    TransactionOp::Rollback => transport.rollback(),
                };
                let _ = reply.send(result);
            }
            ExecutorRequest::Shutdown { ack } => {
                let _ = ack.send(());
                break;
            }
        }
    }
    debug!("executor thread stopped");
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::BatchKind;
    use crate::types::BatchId;
    use crate::wire::{StatementOutcome, WireStatement};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Flags {
        calls: AtomicUsize,
        interrupted: AtomicBool,
    }

    impl Interrupt for Flags {
        fn interrupt(&self) {
            self.interrupted.store(true, Ordering::SeqCst);
        }
    }

    struct SlowTransport {
        delay: Duration,
        flags: Arc<Flags>,
    }

    impl Transport for SlowTransport {
        fn descriptor(&self) -> ProviderDescriptor {
            ProviderDescriptor {
                max_parameters: 100,
                multiple_active_result_sets: false,
                supports_cancellation: true,
            }
        }

        fn execute(&mut self, round_trip: &RoundTrip) -> Result<Vec<StatementResult>> {
            self.flags.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            Ok(round_trip
                .statements
                .iter()
                .map(|_| Ok(StatementOutcome::Affected(1)))
                .collect())
        }

        fn begin(&mut self) -> Result<()> {
            Ok(())
        }

        fn commit(&mut self) -> Result<()> {
            Err(Error::Transaction("no transaction is open".to_string()))
        }

        fn rollback(&mut self) -> Result<()> {
            Ok(())
        }

        fn interrupt_handle(&self) -> Option<Arc<dyn Interrupt>> {
            Some(Arc::clone(&self.flags) as Arc<dyn Interrupt>)
        }
    }

    fn spawn(delay: Duration) -> (Executor, Arc<Flags>) {
        let flags = Arc::new(Flags::default());
        let transport = SlowTransport {
            delay,
            flags: Arc::clone(&flags),
        };
        (Executor::spawn(transport, 4).unwrap(), flags)
    }

    fn trip() -> RoundTrip {
        RoundTrip {
            batch: BatchId::FIRST,
            kind: BatchKind::Single,
            statements: vec![WireStatement {
                text: Arc::from("UPDATE t SET x = 1"),
                params: Vec::new(),
                returns_rows: false,
                rows: 1,
                row_text: None,
            }],
        }
    }

    #[tokio::test]
    async fn test_execute_returns_results() {
        let (executor, flags) = spawn(Duration::ZERO);
        let token = CancellationToken::new();

        let results = executor.execute(trip(), &token, &token, None).await.unwrap();
        assert_eq!(results, vec![Ok(StatementOutcome::Affected(1))]);
        assert_eq!(flags.calls.load(Ordering::SeqCst), 1);

        executor.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancelled_before_dispatch_never_reaches_transport() {
        let (executor, flags) = spawn(Duration::ZERO);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = executor
            .execute(trip(), &cancel, &CancellationToken::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));

        executor.shutdown().await;
        assert_eq!(flags.calls.load(Ordering::SeqCst), 0);
        assert!(!flags.interrupted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_timeout_interrupts_round_trip() {
        let (executor, flags) = spawn(Duration::from_millis(300));
        let token = CancellationToken::new();

        let err = executor
            .execute(trip(), &token, &token, Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(flags.interrupted.load(Ordering::SeqCst));

        executor.shutdown().await;
    }

    #[tokio::test]
    async fn test_transaction_errors_propagate() {
        let (executor, _) = spawn(Duration::ZERO);
        executor.transaction(TransactionOp::Begin).await.unwrap();
        let err = executor.transaction(TransactionOp::Commit).await.unwrap_err();
        assert!(matches!(err, Error::Transaction(_)));

        executor.shutdown().await;
        executor.shutdown().await;
        assert!(matches!(
            executor.transaction(TransactionOp::Rollback).await,
            Err(Error::Executor(_))
        ));
    }
}
