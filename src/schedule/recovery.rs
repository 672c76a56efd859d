//! Startup orphan sweep.
//!
//! "Running" state from a previous process cannot be resumed. Anything the
//! stores still mark as running is finalized as an error, otherwise the
//! overlap guard would block those schedules forever.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{StoreError, TaskError};
use crate::schedule::model::RunStatus;
use crate::store::{ExecutionStore, ScheduleStore};

/// What the sweep changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Schedules whose `last_run_status` was reset from running.
    pub schedules_reset: Vec<String>,
    /// Execution records finalized as interrupted.
    pub executions_finalized: usize,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.schedules_reset.is_empty() && self.executions_finalized == 0
    }
}

/// Finalize every schedule and execution record left running by a previous
/// process. Records that started at or after `server_start` belong to this
/// process and are left alone.
pub async fn sweep_orphans(
    schedules: &dyn ScheduleStore,
    executions: &dyn ExecutionStore,
    server_start: DateTime<Utc>,
) -> Result<RecoveryReport, StoreError> {
    let mut report = RecoveryReport::default();
    let reason = TaskError::Orphaned.to_string();

    let defs = schedules.list_schedules().await?;
    for mut def in defs.iter().cloned() {
        if def.last_run_status != Some(RunStatus::Running) {
            continue;
        }
        def.last_run_status = Some(RunStatus::Error);
        def.last_run_error = Some(reason.clone());
        def.updated_at = Utc::now();
        schedules.put_schedule(&def).await?;
        tracing::warn!(schedule_id = %def.id, name = %def.name, "Reset schedule left running by previous process");
        report.schedules_reset.push(def.id);
    }

    let mut ids: BTreeSet<String> = executions.list_history_ids().await?.into_iter().collect();
    ids.extend(defs.into_iter().map(|d| d.id));

    for schedule_id in ids {
        let records = match executions.list_executions(&schedule_id, usize::MAX).await {
            Ok(records) => records,
            Err(StoreError::InvalidKey(key)) => {
                tracing::debug!("Skipping history for unusable key {}", key);
                continue;
            }
            Err(e) => return Err(e),
        };
        for mut record in records {
            if record.status != RunStatus::Running || record.started_at >= server_start {
                continue;
            }
            if record.mark_orphaned() {
                executions.put_execution(&record).await?;
                report.executions_finalized += 1;
                tracing::warn!(
                    schedule_id = %schedule_id,
                    execution_id = %record.id,
                    "Finalized execution interrupted by restart"
                );
            }
        }
    }

    if !report.is_empty() {
        tracing::info!(
            schedules = report.schedules_reset.len(),
            executions = report.executions_finalized,
            "Orphan sweep complete"
        );
    }
    Ok(report)
}
