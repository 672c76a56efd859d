//! Task worker. Runs exactly one task and reports back over channels.
//!
//! A worker owns a frozen copy of its `TaskDefinition` and talks to the
//! executor only through two channels: a control receiver (terminate) and the
//! shared message sender (log entries and one completion). Every failure,
//! including a panic, becomes a `Failed` completion.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::{FutureExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::agent::{AgentEvent, AgentResolver, AgentRunParams, AgentRunner};
use crate::error::AgentError;
use crate::worker::task::{
    LogEntry, TaskDefinition, WorkerCompletion, WorkerControl, WorkerMessage, WorkerStatus,
};

/// Longest assistant text chunk copied into a log entry.
const MAX_LOGGED_TEXT: usize = 500;

/// Collaborators a worker may call. None of them is orchestrator state.
#[derive(Clone)]
pub struct WorkerDeps {
    pub resolver: Arc<dyn AgentResolver>,
    pub runner: Arc<dyn AgentRunner>,
    pub max_memory_mb: Option<u64>,
}

/// Why `execute` stopped without a result.
enum Stop {
    Terminated,
    Failed(AgentError),
}

impl From<AgentError> for Stop {
    fn from(e: AgentError) -> Self {
        Stop::Failed(e)
    }
}

/// Output collected while the agent runs.
#[derive(Default)]
struct Progress {
    output: String,
    session_id: Option<String>,
    logs: Vec<LogEntry>,
}

/// Executes one task definition.
pub struct TaskWorker {
    task: TaskDefinition,
    deps: WorkerDeps,
    events: mpsc::Sender<WorkerMessage>,
}

impl TaskWorker {
    pub fn new(task: TaskDefinition, deps: WorkerDeps, events: mpsc::Sender<WorkerMessage>) -> Self {
        Self { task, deps, events }
    }

    /// Run the worker on its own task.
    pub fn spawn(self, control: mpsc::Receiver<WorkerControl>) -> JoinHandle<()> {
        tokio::spawn(self.run(control))
    }

    /// Run to completion, then send exactly one completion message unless
    /// terminated.
    pub async fn run(self, mut control: mpsc::Receiver<WorkerControl>) {
        let started = Instant::now();
        let task_id = self.task.id.clone();
        tracing::debug!(task_id = %task_id, agent = %self.task.agent, "Worker starting");

        let mut progress = Progress::default();
        let outcome = AssertUnwindSafe(self.execute(&mut control, &mut progress))
            .catch_unwind()
            .await;

        let (status, error_message, error_stack) = match outcome {
            Ok(Ok(())) => (WorkerStatus::Completed, None, None),
            Ok(Err(Stop::Terminated)) => {
                tracing::debug!(task_id = %task_id, "Worker terminated");
                return;
            }
            Ok(Err(Stop::Failed(e))) => {
                tracing::warn!(task_id = %task_id, error = %e, "Worker failed");
                (WorkerStatus::Failed, Some(e.to_string()), error_chain(&e))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(task_id = %task_id, "Worker panicked: {}", message);
                (
                    WorkerStatus::Failed,
                    Some(format!("Worker panicked: {message}")),
                    None,
                )
            }
        };

        if let Some(ref message) = error_message {
            progress
                .logs
                .push(LogEntry::error("worker", message.clone()));
        }

        let completion = WorkerCompletion {
            task_id: task_id.clone(),
            status,
            output: progress.output,
            session_id: progress.session_id,
            logs: progress.logs,
            error_message,
            error_stack,
            execution_time_ms: started.elapsed().as_millis() as u64,
        };

        if self
            .events
            .send(WorkerMessage::Completed(Box::new(completion)))
            .await
            .is_err()
        {
            tracing::debug!(task_id = %task_id, "Executor gone, dropping completion");
        }
    }

    async fn execute(
        &self,
        control: &mut mpsc::Receiver<WorkerControl>,
        progress: &mut Progress,
    ) -> Result<(), Stop> {
        if let Some(not_before) = self.task.not_before {
            if let Ok(wait) = (not_before - Utc::now()).to_std() {
                tokio::select! {
                    _ = control.recv() => return Err(Stop::Terminated),
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }

        let profile = self.deps.resolver.resolve(&self.task.agent).await?;

        if !tokio::fs::try_exists(&self.task.working_dir)
            .await
            .unwrap_or(false)
        {
            return Err(AgentError::WorkingDirMissing(self.task.working_dir.clone()).into());
        }

        let params = AgentRunParams {
            prompt: self.task.message.clone(),
            model: self.task.model.clone().or(profile.model.clone()),
            permission_mode: profile.permission_mode,
            allowed_tools: profile.allowed_tools.clone(),
            max_turns: self.task.max_turns.or(profile.default_max_turns),
            working_dir: self.task.working_dir.clone(),
            system_prompt: profile.system_prompt.clone(),
            max_memory_mb: self.deps.max_memory_mb,
        };

        self.log(
            progress,
            LogEntry::info("agent", format!("Starting agent {}", profile.name)).with_data(
                serde_json::json!({
                    "model": params.model,
                    "permission_mode": params.permission_mode.as_str(),
                    "max_turns": params.max_turns,
                    "working_dir": params.working_dir.display().to_string(),
                }),
            ),
        )
        .await;

        // The executor enforces explicit task timeouts; a profile default only
        // applies when the task carries none.
        let profile_timeout = self
            .task
            .timeout
            .is_none()
            .then(|| profile.default_timeout())
            .flatten();
        let deadline = tokio::time::sleep(profile_timeout.unwrap_or(Duration::MAX));
        tokio::pin!(deadline);

        let mut stream = self.deps.runner.run(params).await?;

        loop {
            tokio::select! {
                biased;
                msg = control.recv() => match msg {
                    Some(WorkerControl::Terminate) | None => return Err(Stop::Terminated),
                },
                _ = &mut deadline, if profile_timeout.is_some() => {
                    let timeout = profile_timeout.unwrap_or_default();
                    return Err(AgentError::TimedOut { timeout }.into());
                }
                event = stream.next() => match event {
                    None => {
                        self.log(progress, LogEntry::info("agent", "Agent stream ended")).await;
                        return Ok(());
                    }
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(event)) => {
                        if self.apply(progress, event).await? {
                            return Ok(());
                        }
                    }
                },
            }
        }
    }

    /// Fold one event into the progress. Returns `true` on the final event.
    async fn apply(&self, progress: &mut Progress, event: AgentEvent) -> Result<bool, Stop> {
        match event {
            AgentEvent::SessionStarted { session_id } => {
                let entry = LogEntry::info("session", format!("Session {session_id} started"));
                progress.session_id = Some(session_id);
                self.log(progress, entry).await;
                Ok(false)
            }
            AgentEvent::Text { text } => {
                let entry = LogEntry::info("assistant", truncate(&text, MAX_LOGGED_TEXT));
                if !progress.output.is_empty() {
                    progress.output.push('\n');
                }
                progress.output.push_str(&text);
                self.log(progress, entry).await;
                Ok(false)
            }
            AgentEvent::ToolUse { name, input } => {
                self.log(
                    progress,
                    LogEntry::info("tool", format!("Using tool {name}")).with_data(input),
                )
                .await;
                Ok(false)
            }
            AgentEvent::Result(result) => {
                if let Some(id) = result.session_id.clone() {
                    progress.session_id = Some(id);
                }
                let summary = serde_json::json!({
                    "num_turns": result.num_turns,
                    "duration_ms": result.duration_ms,
                    "total_cost_usd": result.total_cost_usd,
                });
                if result.is_error {
                    let message = result
                        .result
                        .unwrap_or_else(|| "agent finished with an error".to_string());
                    self.log(
                        progress,
                        LogEntry::error("result", message.clone()).with_data(summary),
                    )
                    .await;
                    return Err(AgentError::Reported(message).into());
                }
                if let Some(text) = result.result {
                    progress.output = text;
                }
                self.log(
                    progress,
                    LogEntry::info("result", "Agent finished").with_data(summary),
                )
                .await;
                Ok(true)
            }
        }
    }

    /// Buffer a log entry and stream it to the executor.
    async fn log(&self, progress: &mut Progress, entry: LogEntry) {
        progress.logs.push(entry.clone());
        let _ = self
            .events
            .send(WorkerMessage::Log {
                task_id: self.task.id.clone(),
                entry,
            })
            .await;
    }
}

/// Render the source chain of an error, when there is more than one level.
fn error_chain(error: &dyn std::error::Error) -> Option<String> {
    let mut lines = vec![error.to_string()];
    let mut source = error.source();
    while let Some(e) = source {
        lines.push(format!("caused by: {e}"));
        source = e.source();
    }
    (lines.len() > 1).then(|| lines.join("\n"))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::stream;

    use super::*;
    use crate::agent::{AgentEventStream, AgentProfile, AgentResult, StaticAgentResolver};
    use crate::worker::task::TaskKind;

    struct ScriptedRunner {
        events: Vec<Result<AgentEvent, String>>,
    }

    #[async_trait]
    impl AgentRunner for ScriptedRunner {
        async fn run(&self, _params: AgentRunParams) -> Result<AgentEventStream, AgentError> {
            let events: Vec<_> = self
                .events
                .iter()
                .cloned()
                .map(|e| e.map_err(AgentError::Stream))
                .collect();
            Ok(stream::iter(events).boxed())
        }
    }

    struct HangingRunner;

    #[async_trait]
    impl AgentRunner for HangingRunner {
        async fn run(&self, _params: AgentRunParams) -> Result<AgentEventStream, AgentError> {
            Ok(stream::pending().boxed())
        }
    }

    struct PanickingRunner;

    #[async_trait]
    impl AgentRunner for PanickingRunner {
        async fn run(&self, _params: AgentRunParams) -> Result<AgentEventStream, AgentError> {
            panic!("runner exploded");
        }
    }

    fn deps(runner: Arc<dyn AgentRunner>) -> WorkerDeps {
        WorkerDeps {
            resolver: Arc::new(StaticAgentResolver::new().with_default(AgentProfile::default())),
            runner,
            max_memory_mb: None,
        }
    }

    fn task() -> TaskDefinition {
        TaskDefinition::new(TaskKind::Scheduled, "tester", std::env::temp_dir(), "do it")
    }

    async fn run_to_completion(worker_deps: WorkerDeps, task: TaskDefinition) -> (Vec<LogEntry>, WorkerCompletion) {
        let (tx, mut rx) = mpsc::channel(64);
        let (_control_tx, control_rx) = mpsc::channel(1);
        TaskWorker::new(task, worker_deps, tx).spawn(control_rx);

        let mut streamed = Vec::new();
        loop {
            match rx.recv().await.unwrap() {
                WorkerMessage::Log { entry, .. } => streamed.push(entry),
                WorkerMessage::Completed(c) => return (streamed, *c),
            }
        }
    }

    #[tokio::test]
    async fn completes_with_result_text() {
        let runner = ScriptedRunner {
            events: vec![
                Ok(AgentEvent::SessionStarted {
                    session_id: "s-1".into(),
                }),
                Ok(AgentEvent::Text {
                    text: "working".into(),
                }),
                Ok(AgentEvent::Result(AgentResult {
                    result: Some("all good".into()),
                    num_turns: Some(2),
                    ..Default::default()
                })),
            ],
        };
        let (streamed, completion) = run_to_completion(deps(Arc::new(runner)), task()).await;

        assert_eq!(completion.status, WorkerStatus::Completed);
        assert_eq!(completion.output, "all good");
        assert_eq!(completion.session_id.as_deref(), Some("s-1"));
        assert!(completion.error_message.is_none());
        // Every buffered entry was also streamed live.
        assert_eq!(streamed, completion.logs);
    }

    #[tokio::test]
    async fn accumulates_text_without_result() {
        let runner = ScriptedRunner {
            events: vec![
                Ok(AgentEvent::Text { text: "one".into() }),
                Ok(AgentEvent::Text { text: "two".into() }),
            ],
        };
        let (_, completion) = run_to_completion(deps(Arc::new(runner)), task()).await;
        assert_eq!(completion.status, WorkerStatus::Completed);
        assert_eq!(completion.output, "one\ntwo");
    }

    #[tokio::test]
    async fn stream_error_becomes_failed_completion() {
        let runner = ScriptedRunner {
            events: vec![Err("connection reset".into())],
        };
        let (_, completion) = run_to_completion(deps(Arc::new(runner)), task()).await;
        assert_eq!(completion.status, WorkerStatus::Failed);
        assert!(completion.error_message.unwrap().contains("connection reset"));
    }

    #[tokio::test]
    async fn error_result_fails() {
        let runner = ScriptedRunner {
            events: vec![Ok(AgentEvent::Result(AgentResult {
                is_error: true,
                result: Some("max turns reached".into()),
                ..Default::default()
            }))],
        };
        let (_, completion) = run_to_completion(deps(Arc::new(runner)), task()).await;
        assert_eq!(completion.status, WorkerStatus::Failed);
        assert_eq!(
            completion.error_message.as_deref(),
            Some("Agent reported an error: max turns reached")
        );
    }

    #[tokio::test]
    async fn panic_is_contained() {
        let (_, completion) = run_to_completion(deps(Arc::new(PanickingRunner)), task()).await;
        assert_eq!(completion.status, WorkerStatus::Failed);
        assert!(completion.error_message.unwrap().contains("runner exploded"));
    }

    #[tokio::test]
    async fn unknown_agent_fails() {
        let worker_deps = WorkerDeps {
            resolver: Arc::new(StaticAgentResolver::new()),
            runner: Arc::new(HangingRunner),
            max_memory_mb: None,
        };
        let (_, completion) = run_to_completion(worker_deps, task()).await;
        assert_eq!(completion.status, WorkerStatus::Failed);
        assert!(completion.error_message.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn profile_timeout_applies_without_task_timeout() {
        let profile = AgentProfile {
            default_timeout_ms: Some(50),
            ..AgentProfile::default()
        };
        let worker_deps = WorkerDeps {
            resolver: Arc::new(StaticAgentResolver::new().with_default(profile)),
            runner: Arc::new(HangingRunner),
            max_memory_mb: None,
        };
        let (_, completion) = tokio::time::timeout(
            Duration::from_secs(2),
            run_to_completion(worker_deps, task()),
        )
        .await
        .unwrap();
        assert_eq!(completion.status, WorkerStatus::Failed);
        assert!(completion.error_message.unwrap().contains("default timeout"));
    }

    #[tokio::test]
    async fn missing_working_dir_fails() {
        let mut t = task();
        t.working_dir = "/definitely/not/here".into();
        let (_, completion) = run_to_completion(deps(Arc::new(HangingRunner)), t).await;
        assert_eq!(completion.status, WorkerStatus::Failed);
        assert!(completion.error_message.unwrap().contains("does not exist"));
    }

    #[tokio::test]
    async fn terminate_sends_no_completion() {
        let (tx, mut rx) = mpsc::channel(64);
        let (control_tx, control_rx) = mpsc::channel(1);
        let handle = TaskWorker::new(task(), deps(Arc::new(HangingRunner)), tx).spawn(control_rx);

        // Wait for the agent to start, then terminate.
        match rx.recv().await.unwrap() {
            WorkerMessage::Log { entry, .. } => assert_eq!(entry.category, "agent"),
            other => panic!("Expected log, got {other:?}"),
        }
        control_tx.send(WorkerControl::Terminate).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("hello", 10), "hello");
        let out = truncate("héllo wörld", 2);
        assert!(out.ends_with("..."));
    }
}
