//! # Blocking Facade
//!
//! [`BlockingSession`] drives a [`Session`] from synchronous code. It owns a
//! current-thread Tokio runtime and blocks on each async call.
//!
//! Round trips still run on the session's executor thread; the runtime only
//! waits for replies. Do not use it from inside an async context: blocking on
//! a runtime from within another one panics.

use std::fmt;
use std::path::Path;

use tokio::runtime::{Builder, Runtime};
use tokio_util::sync::CancellationToken;

use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::executor::Transport;
use crate::session::{FlushReport, Session, SessionConfig};
use crate::task::{QueryHandle, QueryTask, TaskHandle, WriteHandle, WriteTask};

/// Synchronous wrapper around a [`Session`].
pub struct BlockingSession {
    session: Session,
    runtime: Runtime,
}

impl BlockingSession {
    /// Wraps an existing session.
    pub fn new(session: Session) -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| Error::Executor(format!("failed to build blocking runtime: {e}")))?;
        Ok(Self { session, runtime })
    }

    /// Creates a session over `transport`.
    pub fn with_transport<T: Transport>(transport: T, config: SessionConfig) -> Result<Self> {
        Self::new(Session::with_transport(transport, config)?)
    }

    /// Opens a session over a SQLite file.
    pub fn open_sqlite(path: impl AsRef<Path>, config: SessionConfig) -> Result<Self> {
        Self::new(Session::open_sqlite(path, config)?)
    }

    /// Opens a session over an in-memory SQLite database.
    pub fn open_sqlite_in_memory(config: SessionConfig) -> Result<Self> {
        Self::new(Session::open_sqlite_in_memory(config)?)
    }

    /// The wrapped async session.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// See [`Session::enqueue_query`].
    pub fn enqueue_query<T: Send + 'static>(&self, task: QueryTask<T>) -> Result<QueryHandle<T>> {
        self.session.enqueue_query(task)
    }

    /// See [`Session::enqueue_write`].
    pub fn enqueue_write(&self, task: WriteTask) -> Result<WriteHandle> {
        self.session.enqueue_write(task)
    }

    /// See [`Session::provide_context`].
    pub fn provide_context(&self, allow_partial_execution: bool) -> ExecutionContext {
        self.session.provide_context(allow_partial_execution)
    }

    /// Reads a handle, running round trips as needed.
    pub fn value<T>(&self, handle: TaskHandle<T>) -> Result<T> {
        self.runtime.block_on(handle.value())
    }

    /// See [`Session::flush`].
    pub fn flush(&self) -> Result<FlushReport> {
        self.runtime.block_on(self.session.flush())
    }

    /// See [`Session::flush_with_cancel`].
    pub fn flush_with_cancel(&self, cancel: &CancellationToken) -> Result<FlushReport> {
        self.runtime.block_on(self.session.flush_with_cancel(cancel))
    }

    /// See [`Session::begin_transaction`].
    pub fn begin_transaction(&self) -> Result<()> {
        self.runtime.block_on(self.session.begin_transaction())
    }

    /// See [`Session::commit`].
    pub fn commit(&self) -> Result<()> {
        self.runtime.block_on(self.session.commit())
    }

    /// See [`Session::rollback`].
    pub fn rollback(&self) -> Result<()> {
        self.runtime.block_on(self.session.rollback())
    }

    /// See [`Session::close`].
    pub fn close(&self) -> Result<()> {
        self.runtime.block_on(self.session.close())
    }
}

impl fmt::Debug for BlockingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingSession")
            .field("session", &self.session)
            .finish()
    }
}
