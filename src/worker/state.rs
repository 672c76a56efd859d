//! Task state machine and executor-side status snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::worker::task::{FailureKind, TaskDefinition, TaskKind};

/// State of a task inside the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for a free slot.
    Queued,
    /// A worker owns the task.
    Running,
    /// The worker finished successfully.
    Completed,
    /// Worker failure or timeout.
    Failed,
    /// Canceled by a caller or by executor shutdown.
    Canceled,
}

impl TaskState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskState) -> bool {
        use TaskState::*;

        matches!(
            (self, target),
            (Queued, Running) | (Queued, Canceled) |
            (Running, Completed) | (Running, Failed) | (Running, Canceled)
        )
    }

    /// Terminal states never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        };
        write!(f, "{s}")
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: TaskState,
    pub to: TaskState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Read-only view of one task, as returned by `Executor::get_task_status`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub task_id: String,
    pub kind: TaskKind,
    pub schedule_id: Option<String>,
    pub state: TaskState,
    pub priority: i32,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set when `state` is `Failed`.
    pub failure: Option<FailureKind>,
    pub error: Option<String>,
    pub transitions: Vec<StateTransition>,
}

impl TaskStatus {
    /// Status of a freshly accepted task.
    pub fn queued(task: &TaskDefinition) -> Self {
        Self {
            task_id: task.id.clone(),
            kind: task.kind,
            schedule_id: task.schedule_id.clone(),
            state: TaskState::Queued,
            priority: task.priority,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            failure: None,
            error: None,
            transitions: Vec::new(),
        }
    }

    /// Transition to a new state. Fails once the task is terminal, which is
    /// what makes cancellation and timeout mutually exclusive.
    pub fn transition_to(&mut self, new_state: TaskState, reason: Option<String>) -> Result<(), String> {
        if !self.state.can_transition_to(new_state) {
            return Err(format!(
                "Cannot transition task {} from {} to {}",
                self.task_id, self.state, new_state
            ));
        }

        let now = Utc::now();
        self.transitions.push(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: now,
            reason: reason.clone(),
        });
        self.state = new_state;

        match new_state {
            TaskState::Running => self.started_at = Some(now),
            TaskState::Failed | TaskState::Canceled => {
                self.completed_at = Some(now);
                self.error = reason;
            }
            TaskState::Completed => self.completed_at = Some(now),
            TaskState::Queued => {}
        }

        Ok(())
    }

    /// Transition to `Failed` with a failure kind.
    pub fn fail(&mut self, kind: FailureKind, message: impl Into<String>) -> Result<(), String> {
        self.transition_to(TaskState::Failed, Some(message.into()))?;
        self.failure = Some(kind);
        Ok(())
    }

    /// Milliseconds between start and completion, if both happened.
    pub fn execution_time_ms(&self) -> u64 {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => end.signed_duration_since(start).num_milliseconds().max(0) as u64,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status() -> TaskStatus {
        TaskStatus::queued(&TaskDefinition::new(TaskKind::Scheduled, "a", "/tmp", "m"))
    }

    #[test]
    fn state_transitions_valid() {
        assert!(TaskState::Queued.can_transition_to(TaskState::Running));
        assert!(TaskState::Queued.can_transition_to(TaskState::Canceled));
        assert!(TaskState::Running.can_transition_to(TaskState::Completed));
        assert!(TaskState::Running.can_transition_to(TaskState::Failed));
        assert!(TaskState::Running.can_transition_to(TaskState::Canceled));
    }

    #[test]
    fn state_transitions_invalid() {
        assert!(!TaskState::Queued.can_transition_to(TaskState::Completed));
        assert!(!TaskState::Canceled.can_transition_to(TaskState::Failed));
        assert!(!TaskState::Failed.can_transition_to(TaskState::Canceled));
        assert!(!TaskState::Completed.can_transition_to(TaskState::Running));
    }

    #[test]
    fn terminal_states() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Canceled.is_terminal());
        assert!(!TaskState::Queued.is_terminal());
        assert!(!TaskState::Running.is_terminal());
    }

    #[test]
    fn first_terminal_write_wins() {
        let mut s = status();
        s.transition_to(TaskState::Running, None).unwrap();
        s.transition_to(TaskState::Canceled, Some("user".into())).unwrap();
        assert!(s.fail(FailureKind::Timeout, "late timeout").is_err());
        assert_eq!(s.state, TaskState::Canceled);
        assert_eq!(s.failure, None);
        assert_eq!(s.error.as_deref(), Some("user"));
    }

    #[test]
    fn timestamps_follow_transitions() {
        let mut s = status();
        assert!(s.started_at.is_none());
        s.transition_to(TaskState::Running, None).unwrap();
        assert!(s.started_at.is_some());
        s.fail(FailureKind::Worker, "boom").unwrap();
        assert!(s.completed_at.is_some());
        assert_eq!(s.failure, Some(FailureKind::Worker));
        assert_eq!(s.transitions.len(), 2);
    }

    #[test]
    fn task_state_display() {
        assert_eq!(TaskState::Canceled.to_string(), "canceled");
        assert_eq!(
            serde_json::to_string(&TaskState::Running).unwrap(),
            "\"running\""
        );
    }
}
