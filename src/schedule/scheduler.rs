//! Scheduler. Turns schedule definitions into live triggers and submits a
//! task to the executor on every fire.
//!
//! Trigger state, the in-flight map (schedule → task) and every store write
//! go through one mutex, so `on_fire` and `on_task_complete` never interleave
//! for the same schedule. The in-flight map is the overlap guard; the
//! persisted `last_run_status` is checked alongside it.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::SchedulerConfig;
use crate::error::{Error, Result, StoreError};
use crate::schedule::model::{ExecutionRecord, RunStatus, Schedule, ScheduleDefinition};
use crate::schedule::recovery::{RecoveryReport, sweep_orphans};
use crate::store::{ExecutionStore, ScheduleStore};
use crate::worker::executor::{CompletionListener, Executor};
use crate::worker::task::TaskReport;

#[derive(Default)]
struct SchedulerState {
    started: bool,
    triggers: HashMap<String, JoinHandle<()>>,
    /// Schedule id → task id of the firing still in flight.
    in_flight: HashMap<String, String>,
}

/// Owns the active triggers for all enabled schedules.
pub struct Scheduler {
    config: SchedulerConfig,
    executor: Executor,
    schedules: Arc<dyn ScheduleStore>,
    executions: Arc<dyn ExecutionStore>,
    state: Mutex<SchedulerState>,
    me: Weak<Scheduler>,
}

impl Scheduler {
    /// Create a scheduler and register it as the executor's completion
    /// listener.
    pub fn new(
        config: SchedulerConfig,
        executor: Executor,
        schedules: Arc<dyn ScheduleStore>,
        executions: Arc<dyn ExecutionStore>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Scheduler>| {
            let listener: Weak<dyn CompletionListener> = me.clone();
            executor.set_listener(listener);
            Self {
                config,
                executor,
                schedules,
                executions,
                state: Mutex::new(SchedulerState::default()),
                me: me.clone(),
            }
        })
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Load every schedule and arm the enabled ones. Invalid schedules are
    /// logged and skipped. Idempotent.
    pub async fn start(&self) -> Result<()> {
        let mut st = self.state.lock().await;
        if st.started {
            return Ok(());
        }

        let defs = self.schedules.list_schedules().await?;
        let mut armed = 0;
        for def in &defs {
            match self.arm(&mut st, def).await {
                Ok(true) => armed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(schedule_id = %def.id, name = %def.name, "Failed to schedule: {}", e)
                }
            }
        }
        st.started = true;

        tracing::info!(total = defs.len(), armed, "Scheduler started");
        Ok(())
    }

    /// Cancel every trigger, then stop the executor.
    pub async fn stop(&self) {
        {
            let mut st = self.state.lock().await;
            for (_, handle) in st.triggers.drain() {
                handle.abort();
            }
            st.started = false;
        }
        // Lock released: the executor reports canceled tasks back to us.
        self.executor.stop().await;
        tracing::info!("Scheduler stopped");
    }

    /// Finalize anything a previous process left running.
    pub async fn recover_orphans(&self, server_start: DateTime<Utc>) -> Result<RecoveryReport> {
        let _st = self.state.lock().await;
        Ok(sweep_orphans(
            self.schedules.as_ref(),
            self.executions.as_ref(),
            server_start,
        )
        .await?)
    }

    // ── Triggers ────────────────────────────────────────────────────

    /// Register (or replace) the trigger for a schedule. Returns `false` when
    /// no trigger was armed: disabled, or a one-shot already in the past.
    pub async fn schedule(&self, def: &ScheduleDefinition) -> Result<bool> {
        let mut st = self.state.lock().await;
        self.arm(&mut st, def).await
    }

    /// Cancel the trigger for a schedule and clear its next run. Idempotent.
    pub async fn unschedule(&self, schedule_id: &str) -> Result<bool> {
        let mut st = self.state.lock().await;
        self.disarm(&mut st, schedule_id).await
    }

    /// Whether a live trigger exists for the schedule.
    pub async fn is_scheduled(&self, schedule_id: &str) -> bool {
        let st = self.state.lock().await;
        st.triggers
            .get(schedule_id)
            .is_some_and(|h| !h.is_finished())
    }

    /// Number of scheduled tasks currently in flight.
    pub async fn running_count(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    async fn arm(
        &self,
        st: &mut SchedulerState,
        def: &ScheduleDefinition,
    ) -> Result<bool> {
        if let Some(handle) = st.triggers.remove(&def.id) {
            handle.abort();
        }
        if !def.enabled {
            tracing::debug!(schedule_id = %def.id, "Schedule disabled, not arming");
            return Ok(false);
        }
        if let Err(e) = def.schedule.validate() {
            tracing::error!(schedule_id = %def.id, name = %def.name, "Invalid schedule: {}", e);
            return Err(e.into());
        }

        let now = Utc::now();
        if let Schedule::Once { fire_at } = def.schedule {
            if fire_at <= now {
                tracing::info!(
                    schedule_id = %def.id,
                    %fire_at,
                    "One-shot schedule is in the past, disabling"
                );
                self.persist_with(def, |d| {
                    d.enabled = false;
                    d.next_run_at = None;
                })
                .await?;
                return Ok(false);
            }
        }

        let next = def.schedule.next_fire_after(now)?;
        let handle = self.spawn_trigger(def.id.clone(), def.schedule.clone());
        st.triggers.insert(def.id.clone(), handle);
        self.persist_with(def, |d| d.next_run_at = next).await?;

        tracing::info!(schedule_id = %def.id, name = %def.name, next_run_at = ?next, "Schedule armed");
        Ok(true)
    }

    async fn disarm(
        &self,
        st: &mut SchedulerState,
        schedule_id: &str,
    ) -> Result<bool> {
        let had_trigger = match st.triggers.remove(schedule_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        };
        if let Some(mut def) = self.schedules.get_schedule(schedule_id).await? {
            if def.next_run_at.is_some() {
                def.next_run_at = None;
                def.updated_at = Utc::now();
                self.schedules.put_schedule(&def).await?;
            }
        }
        if had_trigger {
            tracing::info!(schedule_id = %schedule_id, "Schedule unarmed");
        }
        Ok(had_trigger)
    }

    /// Sleep until each fire time (in chunks no longer than the timer cap)
    /// and fire on a separate task.
    fn spawn_trigger(&self, schedule_id: String, schedule: Schedule) -> JoinHandle<()> {
        let me = self.me.clone();
        let cap = self.config.max_timer_delay;
        tokio::spawn(async move {
            let mut after = Utc::now();
            loop {
                let next = match schedule.next_fire_after(after) {
                    Ok(Some(next)) => next,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!(schedule_id = %schedule_id, "Cannot compute next fire: {}", e);
                        break;
                    }
                };

                loop {
                    let remaining = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    if remaining.is_zero() {
                        break;
                    }
                    tokio::time::sleep(remaining.min(cap)).await;
                }

                let Some(scheduler) = me.upgrade() else {
                    break;
                };
                let id = schedule_id.clone();
                tokio::spawn(async move {
                    if let Err(e) = scheduler.on_fire(&id).await {
                        tracing::warn!(schedule_id = %id, "Scheduled fire failed: {}", e);
                    }
                });

                if schedule.is_once() {
                    break;
                }
                after = next;
            }
        })
    }

    // ── Firing ──────────────────────────────────────────────────────

    /// Handle a trigger firing. Returns the submitted task id, or `None` when
    /// the firing was skipped.
    pub async fn on_fire(&self, schedule_id: &str) -> Result<Option<String>> {
        self.fire(schedule_id, false).await
    }

    /// Fire a schedule on demand. The overlap guard and ceiling still apply;
    /// the schedule's own timing is untouched.
    pub async fn run_now(&self, schedule_id: &str) -> Result<Option<String>> {
        let def = self
            .schedules
            .get_schedule(schedule_id)
            .await?
            .ok_or_else(|| Error::ScheduleNotFound {
                id: schedule_id.to_string(),
            })?;
        if !def.enabled {
            return Err(Error::ScheduleDisabled { id: def.id });
        }
        self.fire(schedule_id, true).await
    }

    async fn fire(&self, schedule_id: &str, manual: bool) -> Result<Option<String>> {
        let mut st = self.state.lock().await;

        let Some(mut def) = self.schedules.get_schedule(schedule_id).await? else {
            tracing::warn!(schedule_id = %schedule_id, "Fired schedule no longer exists");
            if let Some(handle) = st.triggers.remove(schedule_id) {
                handle.abort();
            }
            return Err(Error::ScheduleNotFound {
                id: schedule_id.to_string(),
            });
        };

        if !def.enabled {
            tracing::debug!(schedule_id = %def.id, "Schedule disabled, skipping fire");
            return Ok(None);
        }
        let skipped = if st.in_flight.len() >= self.config.max_concurrent {
            tracing::info!(
                schedule_id = %def.id,
                running = st.in_flight.len(),
                max = self.config.max_concurrent,
                "Concurrency ceiling reached, skipping fire"
            );
            true
        } else if st.in_flight.contains_key(&def.id) || def.is_running() {
            tracing::info!(schedule_id = %def.id, name = %def.name, "Previous run still in flight, skipping fire");
            true
        } else {
            false
        };
        if skipped {
            // A one-shot has no later fire to fall back on.
            if !manual && def.schedule.is_once() {
                tracing::warn!(schedule_id = %def.id, "One-shot fire skipped, disabling schedule");
                st.triggers.remove(&def.id);
                def.enabled = false;
                def.next_run_at = None;
                def.updated_at = Utc::now();
                self.schedules.put_schedule(&def).await?;
            }
            return Ok(None);
        }

        let task = def.to_task();
        let now = Utc::now();
        def.last_run_at = Some(now);
        def.last_run_status = Some(RunStatus::Running);
        def.last_run_error = None;
        if !manual {
            if def.schedule.is_once() {
                def.enabled = false;
                def.next_run_at = None;
                st.triggers.remove(&def.id);
            } else {
                def.next_run_at = def.schedule.next_fire_after(now)?;
            }
        }
        def.updated_at = now;
        self.schedules.put_schedule(&def).await?;

        let mut record = ExecutionRecord::started(&task, &def.id);
        if let Err(e) = self.executions.put_execution(&record).await {
            tracing::error!(schedule_id = %def.id, task_id = %task.id, "Failed to record execution: {}", e);
            self.mark_failed(&mut def, format!("Failed to record execution: {e}"))
                .await;
            return Err(e.into());
        }
        st.in_flight.insert(def.id.clone(), task.id.clone());

        let task_id = task.id.clone();
        match self.executor.submit(task).await {
            Ok(()) => {
                tracing::info!(schedule_id = %def.id, task_id = %task_id, manual, "Schedule fired");
                Ok(Some(task_id))
            }
            Err(e) => {
                tracing::error!(schedule_id = %def.id, task_id = %task_id, "Submission failed: {}", e);
                st.in_flight.remove(&def.id);

                record.fail(e.to_string());
                if let Err(store_err) = self.executions.put_execution(&record).await {
                    tracing::error!(task_id = %task_id, "Failed to record submission failure: {}", store_err);
                }
                self.mark_failed(&mut def, e.to_string()).await;
                Err(e.into())
            }
        }
    }

    /// Apply a finished task to its record and schedule. Duplicate reports
    /// are no-ops.
    async fn finalize(&self, report: &TaskReport) -> Result<()> {
        let Some(ref schedule_id) = report.schedule_id else {
            return Ok(());
        };
        let mut st = self.state.lock().await;

        let was_in_flight = st
            .in_flight
            .get(schedule_id)
            .is_some_and(|t| *t == report.task_id);
        if was_in_flight {
            st.in_flight.remove(schedule_id);
        }

        let (record_updated, record_error) = match self.finish_record(schedule_id, report).await {
            Ok(changed) => (changed, None),
            Err(e) => {
                tracing::error!(task_id = %report.task_id, "Failed to record task completion: {}", e);
                (false, Some(e))
            }
        };

        if !was_in_flight && !record_updated {
            tracing::debug!(task_id = %report.task_id, "Duplicate completion ignored");
            return match record_error {
                Some(e) => Err(e.into()),
                None => Ok(()),
            };
        }

        if let Some(mut def) = self.schedules.get_schedule(schedule_id).await? {
            let now = Utc::now();
            match record_error {
                Some(ref e) => {
                    def.last_run_status = Some(RunStatus::Error);
                    def.last_run_error = Some(format!("Failed to record execution: {e}"));
                }
                None => {
                    def.last_run_status = Some(RunStatus::from(&report.outcome));
                    def.last_run_error = report.outcome.error_message();
                }
            }
            def.next_run_at = if def.enabled && !def.schedule.is_once() {
                def.schedule.next_fire_after(now).unwrap_or(None)
            } else {
                None
            };
            def.updated_at = now;
            self.schedules.put_schedule(&def).await?;
        }

        if let Some(e) = record_error {
            return Err(e.into());
        }
        tracing::info!(
            schedule_id = %schedule_id,
            task_id = %report.task_id,
            status = %RunStatus::from(&report.outcome),
            "Scheduled run finished"
        );
        Ok(())
    }

    /// Apply a report to its execution record. `false` when there is no
    /// record or it was already terminal.
    async fn finish_record(
        &self,
        schedule_id: &str,
        report: &TaskReport,
    ) -> std::result::Result<bool, StoreError> {
        let Some(mut record) = self
            .executions
            .get_execution(schedule_id, &report.task_id)
            .await?
        else {
            return Ok(false);
        };
        if !record.finish(report) {
            return Ok(false);
        }
        self.executions.put_execution(&record).await?;
        Ok(true)
    }

    /// Put a schedule back to `error` after a failed firing. Best effort: a
    /// schedule store failure here is only logged.
    async fn mark_failed(&self, def: &mut ScheduleDefinition, message: String) {
        def.last_run_status = Some(RunStatus::Error);
        def.last_run_error = Some(message);
        def.updated_at = Utc::now();
        if let Err(e) = self.schedules.put_schedule(def).await {
            tracing::error!(schedule_id = %def.id, "Failed to reset schedule after failed fire: {}", e);
        }
    }

    // ── Schedule management ─────────────────────────────────────────

    pub async fn list_schedules(&self) -> Result<Vec<ScheduleDefinition>> {
        Ok(self.schedules.list_schedules().await?)
    }

    pub async fn get_schedule(&self, schedule_id: &str) -> Result<Option<ScheduleDefinition>> {
        Ok(self.schedules.get_schedule(schedule_id).await?)
    }

    /// Validate, persist and arm a new schedule.
    pub async fn create_schedule(&self, def: ScheduleDefinition) -> Result<ScheduleDefinition> {
        def.validate()?;
        let mut st = self.state.lock().await;
        self.schedules.put_schedule(&def).await?;
        self.arm(&mut st, &def).await?;
        tracing::info!(schedule_id = %def.id, name = %def.name, "Schedule created");
        self.load(&def.id).await
    }

    /// Replace the user-authored fields of a schedule and re-arm it. Run
    /// bookkeeping is kept from the stored copy.
    pub async fn update_schedule(&self, def: ScheduleDefinition) -> Result<ScheduleDefinition> {
        def.validate()?;
        let mut st = self.state.lock().await;
        let existing = self.load(&def.id).await?;

        let updated = ScheduleDefinition {
            created_at: existing.created_at,
            last_run_at: existing.last_run_at,
            last_run_status: existing.last_run_status,
            last_run_error: existing.last_run_error,
            next_run_at: existing.next_run_at,
            updated_at: Utc::now(),
            ..def
        };
        self.schedules.put_schedule(&updated).await?;
        if updated.enabled {
            self.arm(&mut st, &updated).await?;
        } else {
            self.disarm(&mut st, &updated.id).await?;
        }
        tracing::info!(schedule_id = %updated.id, "Schedule updated");
        self.load(&updated.id).await
    }

    /// Remove a schedule, its trigger and its history.
    pub async fn delete_schedule(&self, schedule_id: &str) -> Result<bool> {
        let mut st = self.state.lock().await;
        if let Some(handle) = st.triggers.remove(schedule_id) {
            handle.abort();
        }
        let deleted = self.schedules.delete_schedule(schedule_id).await?;
        if deleted {
            self.executions.delete_history(schedule_id).await?;
            tracing::info!(schedule_id = %schedule_id, "Schedule deleted");
        }
        Ok(deleted)
    }

    /// Enable or disable a schedule.
    pub async fn toggle_schedule(
        &self,
        schedule_id: &str,
        enabled: bool,
    ) -> Result<ScheduleDefinition> {
        let mut st = self.state.lock().await;
        let mut def = self.load(schedule_id).await?;
        def.enabled = enabled;
        def.updated_at = Utc::now();
        self.schedules.put_schedule(&def).await?;
        if enabled {
            self.arm(&mut st, &def).await?;
        } else {
            self.disarm(&mut st, schedule_id).await?;
        }
        self.load(schedule_id).await
    }

    /// Execution records for a schedule, newest first.
    pub async fn history(&self, schedule_id: &str, limit: usize) -> Result<Vec<ExecutionRecord>> {
        Ok(self.executions.list_executions(schedule_id, limit).await?)
    }

    async fn load(&self, schedule_id: &str) -> Result<ScheduleDefinition> {
        self.schedules
            .get_schedule(schedule_id)
            .await?
            .ok_or_else(|| Error::ScheduleNotFound {
                id: schedule_id.to_string(),
            })
    }

    /// Apply `f` to the stored copy of `def` and write it back. Schedules that
    /// are not stored are left alone.
    async fn persist_with(
        &self,
        def: &ScheduleDefinition,
        f: impl FnOnce(&mut ScheduleDefinition),
    ) -> Result<()> {
        let Some(mut stored) = self.schedules.get_schedule(&def.id).await? else {
            tracing::debug!(schedule_id = %def.id, "Schedule not stored, skipping write");
            return Ok(());
        };
        f(&mut stored);
        stored.updated_at = Utc::now();
        self.schedules.put_schedule(&stored).await?;
        Ok(())
    }
}

#[async_trait]
impl CompletionListener for Scheduler {
    async fn on_task_complete(&self, report: TaskReport) {
        if let Err(e) = self.finalize(&report).await {
            tracing::error!(task_id = %report.task_id, "Failed to record task completion: {}", e);
        }
    }
}
