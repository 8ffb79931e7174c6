#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use roundtrip::{
    Error, Interrupt, ProviderDescriptor, ProviderFailure, QueryTask, ResultSet, RoundTrip,
    RowShape, Session, SessionConfig, StatementOutcome, StatementResult, Transport, Value,
    WriteTask,
};

// =============================================================================
// Scripted Transport
// =============================================================================

/// Replaces the default echo behaviour for one round trip.
pub type Script = Box<dyn FnMut(&RoundTrip) -> roundtrip::Result<Vec<StatementResult>> + Send>;

/// Everything a [`ScriptedTransport`] saw, shared with the test.
#[derive(Clone, Default)]
pub struct Recorder {
    trips: Arc<Mutex<Vec<RoundTrip>>>,
    transactions: Arc<Mutex<Vec<&'static str>>>,
}

impl Recorder {
    pub fn round_trips(&self) -> Vec<RoundTrip> {
        self.trips.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.trips.lock().unwrap().len()
    }

    /// Statement texts of every round trip, in order.
    pub fn texts(&self) -> Vec<Vec<String>> {
        self.round_trips()
            .iter()
            .map(|trip| trip.statements.iter().map(|s| s.text.to_string()).collect())
            .collect()
    }

    /// First parameter of every statement, flattened across round trips.
    pub fn first_params(&self) -> Vec<Value> {
        self.round_trips()
            .iter()
            .flat_map(|trip| trip.statements.iter())
            .flat_map(|s| s.params.chunks(s.params_per_row().max(1)))
            .filter_map(|row| row.first().cloned())
            .collect()
    }

    pub fn transactions(&self) -> Vec<&'static str> {
        self.transactions.lock().unwrap().clone()
    }
}

/// Holds round trips until opened or interrupted.
#[derive(Clone, Default)]
pub struct Gate {
    inner: Arc<(Mutex<GateState>, Condvar)>,
}

#[derive(Default)]
struct GateState {
    open: bool,
    interrupted: bool,
    held: usize,
}

impl Gate {
    pub fn closed() -> Self {
        Self::default()
    }

    /// Lets every held and future round trip through.
    pub fn open(&self) {
        let (state, cvar) = &*self.inner;
        state.lock().unwrap().open = true;
        cvar.notify_all();
    }

    /// Round trips currently waiting at the gate.
    pub fn held(&self) -> usize {
        self.inner.0.lock().unwrap().held
    }

    /// Blocks while closed. Returns false if released by an interrupt.
    fn pass(&self) -> bool {
        let (state, cvar) = &*self.inner;
        let mut guard = state.lock().unwrap();
        guard.held += 1;
        while !guard.open && !guard.interrupted {
            guard = cvar.wait(guard).unwrap();
        }
        guard.held -= 1;
        !std::mem::take(&mut guard.interrupted)
    }
}

impl Interrupt for Gate {
    fn interrupt(&self) {
        let (state, cvar) = &*self.inner;
        state.lock().unwrap().interrupted = true;
        cvar.notify_all();
    }
}

/// In-process transport that records round trips and answers them by echo
/// or by script.
///
/// Echo answers a query statement with one row holding its first parameter
/// and a write statement with `Affected(rows)`.
pub struct ScriptedTransport {
    descriptor: ProviderDescriptor,
    recorder: Recorder,
    script: Option<Script>,
    gate: Option<Gate>,
}

impl ScriptedTransport {
    pub fn new() -> (Self, Recorder) {
        let recorder = Recorder::default();
        let transport = Self {
            descriptor: ProviderDescriptor {
                max_parameters: 2100,
                multiple_active_result_sets: true,
                supports_cancellation: true,
            },
            recorder: recorder.clone(),
            script: None,
            gate: None,
        };
        (transport, recorder)
    }

    pub fn with_descriptor(mut self, descriptor: ProviderDescriptor) -> Self {
        self.descriptor = descriptor;
        self
    }

    pub fn with_script(
        mut self,
        script: impl FnMut(&RoundTrip) -> roundtrip::Result<Vec<StatementResult>> + Send + 'static,
    ) -> Self {
        self.script = Some(Box::new(script));
        self
    }

    pub fn with_gate(mut self, gate: Gate) -> Self {
        self.gate = Some(gate);
        self
    }
}

impl Transport for ScriptedTransport {
    fn descriptor(&self) -> ProviderDescriptor {
        self.descriptor
    }

    fn execute(&mut self, round_trip: &RoundTrip) -> roundtrip::Result<Vec<StatementResult>> {
        self.recorder.trips.lock().unwrap().push(round_trip.clone());

        if let Some(gate) = &self.gate {
            if !gate.pass() {
                return Err(Error::Cancelled);
            }
        }

        match self.script.as_mut() {
            Some(script) => script(round_trip),
            None => Ok(echo(round_trip)),
        }
    }

    fn begin(&mut self) -> roundtrip::Result<()> {
        self.recorder.transactions.lock().unwrap().push("begin");
        Ok(())
    }

    fn commit(&mut self) -> roundtrip::Result<()> {
        self.recorder.transactions.lock().unwrap().push("commit");
        Ok(())
    }

    fn rollback(&mut self) -> roundtrip::Result<()> {
        self.recorder.transactions.lock().unwrap().push("rollback");
        Ok(())
    }

    fn interrupt_handle(&self) -> Option<Arc<dyn Interrupt>> {
        self.gate
            .as_ref()
            .map(|gate| Arc::new(gate.clone()) as Arc<dyn Interrupt>)
    }
}

/// Default answers for every statement of a round trip.
pub fn echo(round_trip: &RoundTrip) -> Vec<StatementResult> {
    round_trip
        .statements
        .iter()
        .map(|s| {
            if s.returns_rows {
                let value = s.params.first().cloned().unwrap_or(Value::Null);
                Ok(StatementOutcome::Rows(ResultSet::new(
                    vec!["v".to_string()],
                    vec![vec![value]],
                )))
            } else {
                Ok(StatementOutcome::Affected(s.rows))
            }
        })
        .collect()
}

/// A statement failure covering the whole statement.
pub fn failed(message: &str) -> StatementResult {
    Err(ProviderFailure::statement(message, Some(19)))
}

// =============================================================================
// Sessions and Tasks
// =============================================================================

pub fn scripted_session(transport: ScriptedTransport) -> Session {
    Session::with_transport(transport, SessionConfig::default()).expect("open scripted session")
}

pub fn scripted_session_with(transport: ScriptedTransport, config: SessionConfig) -> Session {
    Session::with_transport(transport, config).expect("open scripted session")
}

/// Query whose echoed value is `n`.
pub fn echo_query(n: i64) -> QueryTask<i64> {
    QueryTask::new("SELECT ?", vec![Value::Integer(n)], |rs| {
        Ok(rs.scalar::<i64>()?.unwrap_or(-1))
    })
}

/// Standalone write tagged with `n` as its first parameter.
pub fn tagged_write(n: i64) -> WriteTask {
    WriteTask::new("UPDATE t SET v = ?", vec![Value::Integer(n)])
}

pub fn items_shape() -> RowShape {
    RowShape::new("items", ["id", "label"])
}

pub fn item_row(shape: &RowShape, id: i64) -> WriteTask {
    WriteTask::insert(shape, vec![Value::Integer(id), Value::Text(format!("item-{id}"))])
        .expect("valid row")
}

// =============================================================================
// SQLite
// =============================================================================

pub fn create_temp_db_file(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    (dir, path)
}

/// In-memory SQLite session with an `items(id PRIMARY KEY, label)` table.
pub async fn sqlite_items_session(config: SessionConfig) -> Session {
    let session = Session::open_sqlite_in_memory(config).expect("open sqlite session");
    session
        .enqueue_write(WriteTask::new(
            "CREATE TABLE items (id INTEGER PRIMARY KEY, label TEXT NOT NULL)",
            vec![],
        ))
        .expect("enqueue create table");
    session.flush().await.expect("create table");
    session
}

pub fn count_items() -> QueryTask<i64> {
    QueryTask::new("SELECT count(*) FROM items", vec![], |rs| {
        Ok(rs.scalar::<i64>()?.unwrap_or(0))
    })
}

// =============================================================================
// Timing
// =============================================================================

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}

pub async fn until_held(gate: &Gate, n: usize) {
    eventually(Duration::from_secs(5), Duration::from_millis(5), || {
        (gate.held() >= n).then_some(())
    })
    .await
}
