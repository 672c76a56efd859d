//! Executor: a bounded worker pool with a priority/FIFO queue, per-task
//! deadlines, cancellation and statistics.
//!
//! All bookkeeping (queue, running set, statuses, counters) lives behind one
//! mutex. Workers never touch it: they report through a single results
//! channel that a pump task drains. Slots are released and the queue promoted
//! while that lock is held, so promotion is synchronous with slot release.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::{AbortHandle, JoinHandle};

use crate::agent::{AgentResolver, AgentRunner};
use crate::config::ExecutorConfig;
use crate::error::{SubmissionError, TaskError};
use crate::worker::state::{TaskState, TaskStatus};
use crate::worker::task::{
    FailureKind, LogEntry, TaskDefinition, TaskLog, TaskOutcome, TaskReport, WorkerCompletion,
    WorkerControl, WorkerMessage, WorkerStatus,
};
use crate::worker::worker::{TaskWorker, WorkerDeps};

/// Capacity of the shared worker → executor channel.
const RESULTS_CHANNEL_CAPACITY: usize = 1024;

/// Receives a report for every task that reaches a terminal state.
///
/// Delivery is at-least-once; implementations must treat a report for an
/// already-finalized task as a no-op.
#[async_trait]
pub trait CompletionListener: Send + Sync {
    async fn on_task_complete(&self, report: TaskReport);
}

/// Aggregate counters. `completed`, `failed` and `canceled` are cumulative
/// for the life of the executor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    pub running: usize,
    pub queued: usize,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub canceled: u64,
    pub max_concurrent: usize,
    pub uptime_ms: u64,
    pub healthy: bool,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: u64,
    completed: u64,
    failed: u64,
    canceled: u64,
}

struct QueuedTask {
    task: TaskDefinition,
}

struct RunningTask {
    task: TaskDefinition,
    control: mpsc::Sender<WorkerControl>,
    worker: JoinHandle<()>,
    timer: Option<JoinHandle<()>>,
    logs: Vec<LogEntry>,
}

#[derive(Default)]
struct ExecutorState {
    started: bool,
    started_at: Option<Instant>,
    health_issue: Option<String>,
    queue: VecDeque<QueuedTask>,
    running: HashMap<String, RunningTask>,
    statuses: HashMap<String, TaskStatus>,
    /// Terminal task ids, oldest first, for status eviction.
    finished: VecDeque<String>,
    counters: Counters,
    events_tx: Option<mpsc::Sender<WorkerMessage>>,
    pump: Option<JoinHandle<()>>,
}

impl ExecutorState {
    /// Insert behind every queued task of equal or higher priority.
    fn enqueue(&mut self, task: TaskDefinition) {
        let pos = self
            .queue
            .iter()
            .position(|q| q.task.priority < task.priority)
            .unwrap_or(self.queue.len());
        self.queue.insert(pos, QueuedTask { task });
    }

    fn remember_finished(&mut self, task_id: &str, cap: usize) {
        self.finished.push_back(task_id.to_string());
        while self.finished.len() > cap {
            if let Some(old) = self.finished.pop_front() {
                self.statuses.remove(&old);
            }
        }
    }
}

struct Inner {
    config: ExecutorConfig,
    deps: WorkerDeps,
    state: Mutex<ExecutorState>,
    logs_tx: broadcast::Sender<TaskLog>,
    listener: OnceLock<Weak<dyn CompletionListener>>,
}

/// Bounded-concurrency task executor. Cheap to clone.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

impl Executor {
    pub fn new(
        config: ExecutorConfig,
        resolver: Arc<dyn AgentResolver>,
        runner: Arc<dyn AgentRunner>,
    ) -> Self {
        let (logs_tx, _) = broadcast::channel(config.log_buffer.max(1));
        let deps = WorkerDeps {
            resolver,
            runner,
            max_memory_mb: Some(config.max_memory_mb),
        };
        Self {
            inner: Arc::new(Inner {
                config,
                deps,
                state: Mutex::new(ExecutorState::default()),
                logs_tx,
                listener: OnceLock::new(),
            }),
        }
    }

    /// Register the completion listener. Only the first registration sticks.
    pub fn set_listener(&self, listener: Weak<dyn CompletionListener>) {
        if self.inner.listener.set(listener).is_err() {
            tracing::warn!("Completion listener already registered, ignoring");
        }
    }

    /// Live stream of task log entries.
    pub fn subscribe_logs(&self) -> broadcast::Receiver<TaskLog> {
        self.inner.logs_tx.subscribe()
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.inner.config
    }

    /// Open the executor for submissions. Idempotent.
    pub async fn start(&self) {
        let mut st = self.inner.state.lock().await;
        if st.started {
            return;
        }

        let (tx, rx) = mpsc::channel(RESULTS_CHANNEL_CAPACITY);
        let weak = Arc::downgrade(&self.inner);
        st.pump = Some(tokio::spawn(pump(weak, rx)));
        st.events_tx = Some(tx);
        st.started = true;
        st.started_at = Some(Instant::now());
        st.health_issue = None;

        tracing::info!(
            max_concurrent = self.inner.config.max_concurrent,
            "Executor started"
        );
    }

    /// Terminate every worker, cancel every queued task and close the
    /// executor. Workers that ignore termination are aborted after the grace
    /// period. Idempotent.
    pub async fn stop(&self) {
        let mut reports = Vec::new();
        let mut workers = Vec::new();
        let pump;
        {
            let mut st = self.inner.state.lock().await;
            if !st.started {
                return;
            }
            st.started = false;
            st.events_tx = None;
            pump = st.pump.take();

            let queued: Vec<_> = st.queue.drain(..).collect();
            for q in queued {
                if let Some(report) =
                    self.inner
                        .finish_canceled(&mut st, &q.task, Vec::new(), "Executor stopped")
                {
                    reports.push(report);
                }
            }

            let running: Vec<_> = st.running.drain().map(|(_, r)| r).collect();
            for mut r in running {
                if let Some(timer) = r.timer.take() {
                    timer.abort();
                }
                let _ = r.control.try_send(WorkerControl::Terminate);
                let logs = std::mem::take(&mut r.logs);
                if let Some(report) =
                    self.inner
                        .finish_canceled(&mut st, &r.task, logs, "Executor stopped")
                {
                    reports.push(report);
                }
                workers.push(r.worker);
            }
        }

        if !workers.is_empty() {
            let aborts: Vec<AbortHandle> = workers.iter().map(|w| w.abort_handle()).collect();
            let grace = self.inner.config.termination_grace;
            if tokio::time::timeout(grace, futures::future::join_all(workers))
                .await
                .is_err()
            {
                tracing::warn!(
                    "Workers did not terminate within {:?}, aborting",
                    grace
                );
                for abort in aborts {
                    abort.abort();
                }
            }
        }

        if let Some(pump) = pump {
            pump.abort();
        }

        for report in reports {
            self.inner.deliver(report).await;
        }

        tracing::info!("Executor stopped");
    }

    /// Accept a task. Starts it immediately when a slot is free, otherwise
    /// queues it. Never waits on execution.
    pub async fn submit(&self, task: TaskDefinition) -> Result<(), SubmissionError> {
        let mut st = self.inner.state.lock().await;
        if !st.started {
            return Err(SubmissionError::NotStarted);
        }
        if let Some(ref reason) = st.health_issue {
            return Err(SubmissionError::Unhealthy {
                reason: reason.clone(),
            });
        }
        if st.statuses.contains_key(&task.id) {
            return Err(SubmissionError::Duplicate {
                id: task.id.clone(),
            });
        }

        tracing::info!(
            task_id = %task.id,
            kind = %task.kind,
            agent = %task.agent,
            priority = task.priority,
            "Task submitted"
        );

        st.statuses.insert(task.id.clone(), TaskStatus::queued(&task));
        st.counters.submitted += 1;
        st.enqueue(task);
        self.inner.promote(&mut st);
        Ok(())
    }

    /// Cancel a queued or running task. Returns `false` when the task is
    /// unknown or already terminal.
    pub async fn cancel_task(&self, task_id: &str) -> bool {
        let report = {
            let mut st = self.inner.state.lock().await;

            if let Some(pos) = st.queue.iter().position(|q| q.task.id == task_id) {
                let queued = st.queue.remove(pos);
                queued.and_then(|q| {
                    self.inner
                        .finish_canceled(&mut st, &q.task, Vec::new(), "Canceled before start")
                })
            } else if let Some(mut running) = st.running.remove(task_id) {
                let logs = std::mem::take(&mut running.logs);
                let task = running.task.clone();
                self.inner.retire(running);
                let report = self
                    .inner
                    .finish_canceled(&mut st, &task, logs, "Canceled while running");
                self.inner.promote(&mut st);
                report
            } else {
                return false;
            }
        };

        tracing::info!(task_id = %task_id, "Task canceled");
        if let Some(report) = report {
            self.inner.notify(report);
        }
        true
    }

    /// Snapshot of one task, while it is known to the executor.
    pub async fn get_task_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.inner.state.lock().await.statuses.get(task_id).cloned()
    }

    pub async fn get_stats(&self) -> ExecutorStats {
        let st = self.inner.state.lock().await;
        ExecutorStats {
            running: st.running.len(),
            queued: st.queue.len(),
            submitted: st.counters.submitted,
            completed: st.counters.completed,
            failed: st.counters.failed,
            canceled: st.counters.canceled,
            max_concurrent: self.inner.config.max_concurrent,
            uptime_ms: st
                .started_at
                .map(|t| t.elapsed().as_millis() as u64)
                .unwrap_or(0),
            healthy: st.started && st.health_issue.is_none(),
        }
    }

    /// True while started and able to accept work.
    pub async fn is_healthy(&self) -> bool {
        let st = self.inner.state.lock().await;
        st.started && st.health_issue.is_none()
    }
}

impl Inner {
    /// Fill free slots from the head of the queue.
    fn promote(self: &Arc<Self>, st: &mut ExecutorState) {
        while st.running.len() < self.config.max_concurrent {
            let Some(next) = st.queue.pop_front() else {
                break;
            };
            self.launch(st, next.task);
        }
    }

    fn launch(self: &Arc<Self>, st: &mut ExecutorState, task: TaskDefinition) {
        let Some(events_tx) = st.events_tx.clone() else {
            st.health_issue = Some("results channel closed".to_string());
            tracing::error!(task_id = %task.id, "Cannot launch worker: results channel closed");
            return;
        };

        if let Some(status) = st.statuses.get_mut(&task.id) {
            if let Err(e) = status.transition_to(TaskState::Running, None) {
                tracing::error!(task_id = %task.id, "{}", e);
                return;
            }
        }

        let (control_tx, control_rx) = mpsc::channel(1);
        let worker = TaskWorker::new(task.clone(), self.deps.clone(), events_tx).spawn(control_rx);

        let timeout = task.timeout.unwrap_or(self.config.default_timeout);
        let wait = task
            .not_before
            .and_then(|at| (at - Utc::now()).to_std().ok())
            .unwrap_or_default()
            + timeout;
        let timer = {
            let weak = Arc::downgrade(self);
            let task_id = task.id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(wait).await;
                if let Some(inner) = weak.upgrade() {
                    inner.expire(&task_id, timeout).await;
                }
            })
        };

        tracing::debug!(task_id = %task.id, ?timeout, "Worker launched");
        st.running.insert(
            task.id.clone(),
            RunningTask {
                task,
                control: control_tx,
                worker,
                timer: Some(timer),
                logs: Vec::new(),
            },
        );
    }

    /// Deadline fired. No-op when the task already reached a terminal state.
    async fn expire(self: &Arc<Self>, task_id: &str, timeout: Duration) {
        let report = {
            let mut st = self.state.lock().await;
            let Some(mut running) = st.running.remove(task_id) else {
                return;
            };
            // This is the timer's own task; dropping the handle detaches it.
            running.timer = None;
            let logs = std::mem::take(&mut running.logs);
            let task = running.task.clone();
            self.retire(running);

            let message = TaskError::Timeout { timeout }.to_string();
            let failed = st
                .statuses
                .get_mut(task_id)
                .is_some_and(|s| s.fail(FailureKind::Timeout, message.clone()).is_ok());
            let report = if failed {
                st.counters.failed += 1;
                let status = st.statuses.get(task_id).cloned();
                st.remember_finished(task_id, self.config.max_finished_statuses);
                status.map(|status| {
                    build_report(
                        &task,
                        &status,
                        TaskOutcome::Failed {
                            kind: FailureKind::Timeout,
                            message,
                        },
                        None,
                        None,
                        logs,
                        None,
                    )
                })
            } else {
                None
            };
            self.promote(&mut st);
            report
        };

        tracing::warn!(task_id = %task_id, "Task timed out after {:?}", timeout);
        if let Some(report) = report {
            self.notify(report);
        }
    }

    /// Ask a worker to stop and abort it if it has not after the grace period.
    fn retire(&self, mut running: RunningTask) {
        if let Some(timer) = running.timer.take() {
            timer.abort();
        }
        let _ = running.control.try_send(WorkerControl::Terminate);
        let abort = running.worker.abort_handle();
        let grace = self.config.termination_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            abort.abort();
        });
    }

    /// Mark a task canceled. Returns `None` if it was already terminal.
    fn finish_canceled(
        &self,
        st: &mut ExecutorState,
        task: &TaskDefinition,
        logs: Vec<LogEntry>,
        reason: &str,
    ) -> Option<TaskReport> {
        let status = st.statuses.get_mut(&task.id)?;
        status
            .transition_to(TaskState::Canceled, Some(reason.to_string()))
            .ok()?;
        let status = status.clone();
        st.counters.canceled += 1;
        st.remember_finished(&task.id, self.config.max_finished_statuses);
        Some(build_report(
            task,
            &status,
            TaskOutcome::Canceled {
                reason: reason.to_string(),
            },
            None,
            None,
            logs,
            None,
        ))
    }

    async fn handle_message(self: &Arc<Self>, msg: WorkerMessage) {
        match msg {
            WorkerMessage::Log { task_id, entry } => {
                {
                    let mut st = self.state.lock().await;
                    match st.running.get_mut(&task_id) {
                        Some(running) => running.logs.push(entry.clone()),
                        None => return,
                    }
                }
                // No subscribers is fine.
                let _ = self.logs_tx.send(TaskLog { task_id, entry });
            }
            WorkerMessage::Completed(completion) => self.complete(*completion).await,
        }
    }

    async fn complete(self: &Arc<Self>, completion: WorkerCompletion) {
        let report = {
            let mut st = self.state.lock().await;
            let Some(mut running) = st.running.remove(&completion.task_id) else {
                tracing::debug!(
                    task_id = %completion.task_id,
                    "Ignoring completion for task that is no longer running"
                );
                return;
            };
            if let Some(timer) = running.timer.take() {
                timer.abort();
            }

            let task_id = completion.task_id.clone();
            let (transition, outcome) = match completion.status {
                WorkerStatus::Completed => (
                    st.statuses
                        .get_mut(&task_id)
                        .map(|s| s.transition_to(TaskState::Completed, None)),
                    TaskOutcome::Completed,
                ),
                WorkerStatus::Failed => {
                    let message = completion
                        .error_message
                        .clone()
                        .unwrap_or_else(|| "worker failed".to_string());
                    (
                        st.statuses
                            .get_mut(&task_id)
                            .map(|s| s.fail(FailureKind::Worker, message.clone())),
                        TaskOutcome::Failed {
                            kind: FailureKind::Worker,
                            message,
                        },
                    )
                }
            };

            let report = match (transition, st.statuses.get(&task_id).cloned()) {
                (Some(Ok(())), Some(status)) => {
                    match outcome {
                        TaskOutcome::Completed => st.counters.completed += 1,
                        _ => st.counters.failed += 1,
                    }
                    st.remember_finished(&task_id, self.config.max_finished_statuses);
                    let mut report = build_report(
                        &running.task,
                        &status,
                        outcome,
                        Some(completion.output),
                        completion.session_id,
                        completion.logs,
                        completion.error_stack,
                    );
                    report.execution_time_ms = completion.execution_time_ms;
                    Some(report)
                }
                _ => None,
            };

            self.promote(&mut st);
            report
        };

        if let Some(report) = report {
            tracing::info!(
                task_id = %report.task_id,
                outcome = ?report.outcome,
                execution_time_ms = report.execution_time_ms,
                "Task finished"
            );
            self.notify(report);
        }
    }

    /// Deliver a report without holding up the caller.
    fn notify(self: &Arc<Self>, report: TaskReport) {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.deliver(report).await });
    }

    async fn deliver(&self, report: TaskReport) {
        if let Some(listener) = self.listener.get().and_then(Weak::upgrade) {
            listener.on_task_complete(report).await;
        }
    }
}

/// Drain the results channel until the executor goes away.
async fn pump(inner: Weak<Inner>, mut rx: mpsc::Receiver<WorkerMessage>) {
    while let Some(msg) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_message(msg).await;
    }
    tracing::debug!("Executor results channel closed");
}

fn build_report(
    task: &TaskDefinition,
    status: &TaskStatus,
    outcome: TaskOutcome,
    output: Option<String>,
    session_id: Option<String>,
    logs: Vec<LogEntry>,
    error_stack: Option<String>,
) -> TaskReport {
    TaskReport {
        task_id: task.id.clone(),
        kind: task.kind,
        schedule_id: task.schedule_id.clone(),
        agent: task.agent.clone(),
        working_dir: task.working_dir.clone(),
        outcome,
        output,
        session_id,
        logs,
        error_stack,
        started_at: status.started_at,
        completed_at: status.completed_at.unwrap_or_else(Utc::now),
        execution_time_ms: status.execution_time_ms(),
    }
}
