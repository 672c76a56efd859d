//! Schedule definitions and execution records.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{TaskError, ValidationError};
use crate::schedule::cron;
use crate::worker::task::{LogEntry, TaskDefinition, TaskKind, TaskOutcome, TaskReport};

/// When a schedule fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Every N minutes, expressed as a cron step.
    Interval { interval_minutes: u32 },
    /// A 5-field cron expression.
    Cron { cron_expression: String },
    /// A single fire at a fixed instant.
    Once { fire_at: DateTime<Utc> },
}

impl Schedule {
    /// Cron expression driving a recurring schedule. `None` for one-shots.
    pub fn cron_expression(&self) -> Result<Option<String>, ValidationError> {
        match self {
            Schedule::Interval { interval_minutes } => {
                cron::interval_to_cron(*interval_minutes).map(Some)
            }
            Schedule::Cron { cron_expression } => Ok(Some(cron_expression.clone())),
            Schedule::Once { .. } => Ok(None),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self.cron_expression()? {
            Some(expr) => cron::validate(&expr),
            None => Ok(()),
        }
    }

    /// Next fire time strictly after `after`.
    pub fn next_fire_after(
        &self,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ValidationError> {
        match self {
            Schedule::Once { fire_at } => Ok((*fire_at > after).then_some(*fire_at)),
            _ => match self.cron_expression()? {
                Some(expr) => cron::next_fire_after(&expr, after),
                None => Ok(None),
            },
        }
    }

    pub fn is_once(&self) -> bool {
        matches!(self, Schedule::Once { .. })
    }
}

/// Status of the most recent run of a schedule, and of an execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Error,
    Stopped,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl From<&TaskOutcome> for RunStatus {
    fn from(outcome: &TaskOutcome) -> Self {
        match outcome {
            TaskOutcome::Completed => RunStatus::Success,
            TaskOutcome::Failed { .. } => RunStatus::Error,
            TaskOutcome::Canceled { .. } => RunStatus::Stopped,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Success => write!(f, "success"),
            RunStatus::Error => write!(f, "error"),
            RunStatus::Stopped => write!(f, "stopped"),
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "error" => Ok(RunStatus::Error),
            "stopped" => Ok(RunStatus::Stopped),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// A user-authored schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    pub id: String,
    pub name: String,
    pub agent: String,
    pub working_dir: PathBuf,
    pub schedule: Schedule,
    /// Prompt sent to the agent on each fire.
    pub message: String,
    pub enabled: bool,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_run_status: Option<RunStatus>,
    #[serde(default)]
    pub last_run_error: Option<String>,
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduleDefinition {
    pub fn new(
        name: impl Into<String>,
        agent: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        schedule: Schedule,
        message: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            agent: agent.into(),
            working_dir: working_dir.into(),
            schedule,
            message: message.into(),
            enabled: true,
            model: None,
            timeout_ms: None,
            max_turns: None,
            last_run_at: None,
            last_run_status: None,
            last_run_error: None,
            next_run_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::MissingField("id"));
        }
        if self.name.trim().is_empty() {
            return Err(ValidationError::MissingField("name"));
        }
        if self.agent.trim().is_empty() {
            return Err(ValidationError::MissingField("agent"));
        }
        if self.message.trim().is_empty() {
            return Err(ValidationError::MissingField("message"));
        }
        if self.working_dir.as_os_str().is_empty() {
            return Err(ValidationError::MissingField("working_dir"));
        }
        self.schedule.validate()
    }

    pub fn is_running(&self) -> bool {
        self.last_run_status == Some(RunStatus::Running)
    }

    /// Build a fresh task for one firing.
    pub fn to_task(&self) -> TaskDefinition {
        let mut task = TaskDefinition::new(
            TaskKind::Scheduled,
            self.agent.clone(),
            self.working_dir.clone(),
            self.message.clone(),
        )
        .for_schedule(self.id.clone());
        task.timeout = self.timeout_ms.map(Duration::from_millis);
        task.model = self.model.clone();
        task.max_turns = self.max_turns;
        task
    }
}

/// Durable history entry for one attempt at running a schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Same as the task id.
    pub id: String,
    pub schedule_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_stack: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    pub agent: String,
    pub working_dir: PathBuf,
}

impl ExecutionRecord {
    /// Record for a task that is about to be submitted.
    pub fn started(task: &TaskDefinition, schedule_id: impl Into<String>) -> Self {
        Self {
            id: task.id.clone(),
            schedule_id: schedule_id.into(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            error_stack: None,
            output: None,
            session_id: None,
            logs: Vec::new(),
            agent: task.agent.clone(),
            working_dir: task.working_dir.clone(),
        }
    }

    /// Apply a terminal report. Returns `false` if the record was already
    /// terminal.
    pub fn finish(&mut self, report: &TaskReport) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = RunStatus::from(&report.outcome);
        self.completed_at = Some(report.completed_at);
        self.error = report.outcome.error_message();
        self.error_stack = report.error_stack.clone();
        self.output = report.output.clone().filter(|o| !o.is_empty());
        self.session_id = report.session_id.clone();
        self.logs.extend(report.logs.iter().cloned());
        true
    }

    /// Mark as failed before it ever reached the executor.
    pub fn fail(&mut self, message: impl Into<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        let message = message.into();
        self.logs.push(LogEntry::error("system", message.clone()));
        self.status = RunStatus::Error;
        self.completed_at = Some(Utc::now());
        self.error = Some(message);
        true
    }

    /// Finalize a record left running by a previous process.
    pub fn mark_orphaned(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        let reason = TaskError::Orphaned.to_string();
        self.logs.push(LogEntry::warn("system", reason.clone()));
        self.status = RunStatus::Error;
        self.completed_at = Some(Utc::now());
        self.error = Some(reason);
        true
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::worker::task::FailureKind;

    fn definition(schedule: Schedule) -> ScheduleDefinition {
        ScheduleDefinition::new("nightly", "reviewer", "/srv/repo", schedule, "review")
    }

    fn report(task: &TaskDefinition, outcome: TaskOutcome) -> TaskReport {
        TaskReport {
            task_id: task.id.clone(),
            kind: task.kind,
            schedule_id: task.schedule_id.clone(),
            agent: task.agent.clone(),
            working_dir: task.working_dir.clone(),
            outcome,
            output: Some("done".into()),
            session_id: Some("sess".into()),
            logs: vec![LogEntry::info("agent", "hi")],
            error_stack: None,
            started_at: Some(Utc::now()),
            completed_at: Utc::now(),
            execution_time_ms: 10,
        }
    }

    #[test]
    fn schedule_wire_format() {
        let json = serde_json::to_value(Schedule::Interval {
            interval_minutes: 30,
        })
        .unwrap();
        assert_eq!(json["type"], "interval");
        assert_eq!(json["interval_minutes"], 30);

        let parsed: Schedule =
            serde_json::from_str(r#"{"type":"cron","cron_expression":"0 9 * * 1-5"}"#).unwrap();
        assert_eq!(
            parsed,
            Schedule::Cron {
                cron_expression: "0 9 * * 1-5".into()
            }
        );
    }

    #[test]
    fn run_status_display_roundtrip() {
        for status in [
            RunStatus::Running,
            RunStatus::Success,
            RunStatus::Error,
            RunStatus::Stopped,
        ] {
            let parsed: RunStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<RunStatus>().is_err());
    }

    #[test]
    fn validation_catches_missing_fields_and_bad_cron() {
        let mut def = definition(Schedule::Cron {
            cron_expression: "nope".into(),
        });
        assert!(matches!(
            def.validate(),
            Err(ValidationError::InvalidCron { .. })
        ));

        def.schedule = Schedule::Interval {
            interval_minutes: 15,
        };
        assert!(def.validate().is_ok());

        def.message = "  ".into();
        assert_eq!(def.validate(), Err(ValidationError::MissingField("message")));
    }

    #[test]
    fn once_next_fire() {
        let at = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let schedule = Schedule::Once { fire_at: at };
        let before = Utc.with_ymd_and_hms(2029, 12, 31, 0, 0, 0).unwrap();
        assert_eq!(schedule.next_fire_after(before).unwrap(), Some(at));
        assert_eq!(schedule.next_fire_after(at).unwrap(), None);
        assert!(schedule.cron_expression().unwrap().is_none());
    }

    #[test]
    fn to_task_carries_overrides() {
        let mut def = definition(Schedule::Interval {
            interval_minutes: 30,
        });
        def.timeout_ms = Some(1_000);
        def.model = Some("haiku".into());
        def.max_turns = Some(4);

        let a = def.to_task();
        let b = def.to_task();
        assert_ne!(a.id, b.id);
        assert_ne!(a.id, def.id);
        assert_eq!(a.kind, TaskKind::Scheduled);
        assert_eq!(a.schedule_id.as_deref(), Some(def.id.as_str()));
        assert_eq!(a.timeout, Some(Duration::from_millis(1_000)));
        assert_eq!(a.model.as_deref(), Some("haiku"));
        assert_eq!(a.max_turns, Some(4));
    }

    #[test]
    fn record_transitions_are_one_way() {
        let def = definition(Schedule::Interval {
            interval_minutes: 30,
        });
        let task = def.to_task();
        let mut record = ExecutionRecord::started(&task, &def.id);
        assert_eq!(record.status, RunStatus::Running);

        assert!(record.finish(&report(&task, TaskOutcome::Completed)));
        assert_eq!(record.status, RunStatus::Success);
        assert_eq!(record.output.as_deref(), Some("done"));
        assert_eq!(record.logs.len(), 1);

        let failed = TaskOutcome::Failed {
            kind: FailureKind::Timeout,
            message: "late".into(),
        };
        assert!(!record.finish(&report(&task, failed)));
        assert!(!record.mark_orphaned());
        assert_eq!(record.status, RunStatus::Success);
    }

    #[test]
    fn canceled_maps_to_stopped() {
        let task = definition(Schedule::Interval {
            interval_minutes: 5,
        })
        .to_task();
        let mut record = ExecutionRecord::started(&task, "s");
        record.finish(&report(
            &task,
            TaskOutcome::Canceled {
                reason: "user".into(),
            },
        ));
        assert_eq!(record.status, RunStatus::Stopped);
        assert_eq!(record.error.as_deref(), Some("user"));
    }

    #[test]
    fn orphaned_record_mentions_restart() {
        let task = definition(Schedule::Interval {
            interval_minutes: 5,
        })
        .to_task();
        let mut record = ExecutionRecord::started(&task, "s");
        assert!(record.mark_orphaned());
        assert_eq!(record.status, RunStatus::Error);
        assert!(record.error.as_deref().unwrap().contains("restart"));
        assert_eq!(record.logs.last().unwrap().category, "system");
    }
}
