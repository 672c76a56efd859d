//! Task execution.
//!
//! - `task` — task definitions, log entries, worker messages, outcomes
//! - `state` — task state machine (Queued → Running → Completed/Failed/Canceled)
//! - `worker` — runs one task in isolation and reports over channels
//! - `executor` — bounded pool, queue, deadlines, cancellation, stats

pub mod executor;
pub mod state;
pub mod task;
pub mod worker;

pub use executor::{CompletionListener, Executor, ExecutorStats};
pub use state::{TaskState, TaskStatus};
pub use task::{
    FailureKind, LogEntry, LogLevel, TaskDefinition, TaskKind, TaskLog, TaskOutcome, TaskReport,
};
pub use worker::{TaskWorker, WorkerDeps};
