//! Task definitions, log entries and the messages exchanged with workers.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a task came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    /// Fired by the scheduler from a schedule definition.
    Scheduled,
    /// Submitted on demand by a remote caller.
    AsyncRemote,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scheduled => write!(f, "scheduled"),
            Self::AsyncRemote => write!(f, "async-remote"),
        }
    }
}

/// One concrete unit of work handed to the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Unique per submission.
    pub id: String,
    pub kind: TaskKind,
    pub agent: String,
    pub working_dir: PathBuf,
    pub message: String,
    /// Falls back to the executor default when unset.
    pub timeout: Option<Duration>,
    pub max_turns: Option<u32>,
    pub model: Option<String>,
    /// Higher runs first when queued.
    pub priority: i32,
    /// Do not start the agent before this instant.
    pub not_before: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Originating schedule, used to route completion notifications.
    pub schedule_id: Option<String>,
}

impl TaskDefinition {
    pub fn new(
        kind: TaskKind,
        agent: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("task_{}", Uuid::new_v4().simple()),
            kind,
            agent: agent.into(),
            working_dir: working_dir.into(),
            message: message.into(),
            timeout: None,
            max_turns: None,
            model: None,
            priority: 0,
            not_before: None,
            created_at: Utc::now(),
            schedule_id: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = Some(max_turns);
        self
    }

    pub fn with_not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }

    pub fn for_schedule(mut self, schedule_id: impl Into<String>) -> Self {
        self.schedule_id = Some(schedule_id.into());
        self
    }
}

/// Severity of a task log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One structured log line produced while a task runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub category: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl LogEntry {
    pub fn new(level: LogLevel, category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            category: category.into(),
            message: message.into(),
            data: None,
        }
    }

    pub fn info(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, category, message)
    }

    pub fn warn(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warn, category, message)
    }

    pub fn error(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, category, message)
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// A log entry tagged with its task, as broadcast to live observers.
#[derive(Debug, Clone, Serialize)]
pub struct TaskLog {
    pub task_id: String,
    pub entry: LogEntry,
}

/// Control messages from the executor to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerControl {
    /// Stop as soon as possible; no completion message is expected.
    Terminate,
}

/// How a worker finished on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Completed,
    Failed,
}

/// The single terminal message a worker sends.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerCompletion {
    pub task_id: String,
    pub status: WorkerStatus,
    pub output: String,
    pub session_id: Option<String>,
    pub logs: Vec<LogEntry>,
    pub error_message: Option<String>,
    pub error_stack: Option<String>,
    pub execution_time_ms: u64,
}

/// Messages from workers to the executor.
#[derive(Debug, Clone)]
pub enum WorkerMessage {
    Log { task_id: String, entry: LogEntry },
    Completed(Box<WorkerCompletion>),
}

/// Why a task failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The deadline passed and the worker was terminated.
    Timeout,
    /// The worker reported a failure or crashed.
    Worker,
}

/// Terminal outcome of a task. Closed so every consumer handles every case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed,
    Failed { kind: FailureKind, message: String },
    Canceled { reason: String },
}

impl TaskOutcome {
    pub fn error_message(&self) -> Option<String> {
        match self {
            Self::Completed => None,
            Self::Failed { message, .. } => Some(message.clone()),
            Self::Canceled { reason } => Some(reason.clone()),
        }
    }
}

/// Everything the executor knows about a finished task, delivered to the
/// completion listener.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task_id: String,
    pub kind: TaskKind,
    pub schedule_id: Option<String>,
    pub agent: String,
    pub working_dir: PathBuf,
    pub outcome: TaskOutcome,
    pub output: Option<String>,
    pub session_id: Option<String>,
    pub logs: Vec<LogEntry>,
    pub error_stack: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
    pub execution_time_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_are_unique() {
        let a = TaskDefinition::new(TaskKind::Scheduled, "agent", "/tmp", "hi");
        let b = TaskDefinition::new(TaskKind::Scheduled, "agent", "/tmp", "hi");
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("task_"));
    }

    #[test]
    fn builder_sets_fields() {
        let task = TaskDefinition::new(TaskKind::AsyncRemote, "agent", "/work", "run")
            .with_timeout(Duration::from_millis(500))
            .with_priority(5)
            .with_model("opus")
            .with_max_turns(3)
            .for_schedule("sched-1");
        assert_eq!(task.timeout, Some(Duration::from_millis(500)));
        assert_eq!(task.priority, 5);
        assert_eq!(task.model.as_deref(), Some("opus"));
        assert_eq!(task.max_turns, Some(3));
        assert_eq!(task.schedule_id.as_deref(), Some("sched-1"));
    }

    #[test]
    fn task_kind_wire_names() {
        assert_eq!(
            serde_json::to_string(&TaskKind::AsyncRemote).unwrap(),
            "\"async-remote\""
        );
        assert_eq!(TaskKind::Scheduled.to_string(), "scheduled");
    }

    #[test]
    fn outcome_error_messages() {
        assert_eq!(TaskOutcome::Completed.error_message(), None);
        let failed = TaskOutcome::Failed {
            kind: FailureKind::Timeout,
            message: "Task timed out".into(),
        };
        assert_eq!(failed.error_message().as_deref(), Some("Task timed out"));
    }

    #[test]
    fn log_entry_skips_empty_data() {
        let entry = LogEntry::info("agent", "started");
        let json = serde_json::to_value(&entry).unwrap();
        assert!(json.get("data").is_none());
        assert_eq!(json["level"], "info");
    }
}
