//! Batching stress binary.
//!
//! Enqueues a burst of single-row inserts and point queries against a SQLite
//! database, flushes once, and reports how many physical round trips the
//! planner needed.
//!
//! # Examples
//!
//! ```bash
//! # 10k inserts + 100 queries against an in-memory database
//! cargo run --release --bin batch_stress
//!
//! # Larger run against a file, inside one transaction
//! cargo run --release --bin batch_stress -- --inserts 200000 --db /tmp/bench.db --transaction
//!
//! # Watch individual round trips
//! RUST_LOG=roundtrip=debug cargo run --bin batch_stress -- --inserts 100
//! ```

use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use roundtrip::{
    PlannerConfig, QueryTask, RowShape, Session, SessionConfig, Value, WriteTask,
};

/// Command-line options.
#[derive(Parser, Debug)]
#[command(name = "batch_stress")]
struct Args {
    /// Number of single-row inserts to enqueue.
    #[arg(long, default_value_t = 10_000)]
    inserts: usize,

    /// Number of point queries to enqueue after the inserts.
    #[arg(long, default_value_t = 100)]
    queries: usize,

    /// Database file. An in-memory database is used when omitted.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Rows per Small-Group batch.
    #[arg(long, default_value_t = roundtrip::planner::DEFAULT_SMALL_GROUP_ROWS)]
    small: usize,

    /// Maximum rows per Large-Group batch.
    #[arg(long, default_value_t = roundtrip::planner::DEFAULT_LARGE_GROUP_ROWS)]
    large: usize,

    /// Run the inserts inside one transaction.
    #[arg(long)]
    transaction: bool,
}

#[tokio::main]
async fn main() -> roundtrip::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();

    let args = Args::parse();
    let config = SessionConfig {
        planner: PlannerConfig {
            small_group_rows: args.small,
            large_group_rows: args.large,
            ..PlannerConfig::default()
        },
        ..SessionConfig::default()
    };

    let session = match &args.db {
        Some(path) => Session::open_sqlite(path, config)?,
        None => Session::open_sqlite_in_memory(config)?,
    };

    session.enqueue_write(WriteTask::new(
        "CREATE TABLE IF NOT EXISTS bench (id INTEGER PRIMARY KEY, payload TEXT NOT NULL)",
        vec![],
    ))?;
    session.enqueue_write(WriteTask::new("DELETE FROM bench", vec![]))?;
    session.flush().await?;

    info!(
        inserts = args.inserts,
        queries = args.queries,
        transaction = args.transaction,
        "starting run"
    );

    if args.transaction {
        session.begin_transaction().await?;
    }

    let shape = RowShape::new("bench", ["id", "payload"]);
    let start = Instant::now();

    for id in 0..args.inserts {
        let row = vec![Value::Integer(id as i64), Value::Text(format!("payload-{id}"))];
        session.enqueue_write(WriteTask::insert(&shape, row)?)?;
    }

    let mut handles = Vec::with_capacity(args.queries);
    for i in 0..args.queries {
        let bound = (i * args.inserts / args.queries.max(1)) as i64;
        let query = QueryTask::new(
            "SELECT count(*) FROM bench WHERE id < ?",
            vec![Value::Integer(bound)],
            |rs| Ok(rs.scalar::<i64>()?.unwrap_or(0)),
        )
        .separable();
        handles.push((bound, session.enqueue_query(query)?));
    }

    let report = session.flush().await?;
    if args.transaction {
        session.commit().await?;
    }
    let elapsed = start.elapsed();

    let mut mismatches = 0;
    for (bound, handle) in handles {
        if handle.value().await? != bound {
            mismatches += 1;
        }
    }

    let tasks = args.inserts + args.queries;
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);

    println!("=== batch_stress ===");
    println!("tasks:              {tasks}");
    println!("round trips:        {}", report.round_trips);
    println!("resolved / faulted: {} / {}", report.resolved, report.faulted);
    println!("group texts:        {}", session.statements_rendered());
    println!("elapsed:            {:.3}s", elapsed.as_secs_f64());
    println!("throughput:         {:.0} tasks/s", tasks as f64 / secs);
    println!("query mismatches:   {mismatches}");

    session.close().await
}
