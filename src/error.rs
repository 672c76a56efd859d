//! Error types for the agent scheduler.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Submission error: {0}")]
    Submission(#[from] SubmissionError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Schedule {id} not found")]
    ScheduleNotFound { id: String },

    #[error("Schedule {id} is disabled")]
    ScheduleDisabled { id: String },
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Persistence errors for the schedule and execution stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error on {path}: {reason}")]
    Serialization { path: String, reason: String },

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),
}

/// A schedule definition that cannot be turned into a trigger.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("Interval must be at least one minute, got {minutes}")]
    InvalidInterval { minutes: u32 },

    #[error("Missing required field: {0}")]
    MissingField(&'static str),
}

/// Failures to hand a task to the executor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmissionError {
    #[error("Executor is not started")]
    NotStarted,

    #[error("Executor is unhealthy: {reason}")]
    Unhealthy { reason: String },

    #[error("Task {id} was already submitted")]
    Duplicate { id: String },
}

/// Terminal failure reasons for a single task.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("Task timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Execution interrupted by server restart")]
    Orphaned,
}

/// Errors raised by the agent collaborators (resolver and runner).
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Agent {name} not found")]
    NotFound { name: String },

    #[error("Invalid agent profile {name}: {reason}")]
    InvalidProfile { name: String, reason: String },

    #[error("Failed to spawn agent process {program}: {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("Working directory {} does not exist", .0.display())]
    WorkingDirMissing(PathBuf),

    #[error("Agent exceeded its default timeout of {timeout:?}")]
    TimedOut { timeout: Duration },

    #[error("Agent stream error: {0}")]
    Stream(String),

    #[error("Agent reported an error: {0}")]
    Reported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for the scheduler.
pub type Result<T> = std::result::Result<T, Error>;
