//! Storage traits for schedules and execution history.
//!
//! Only the scheduler writes through these; workers never touch storage.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::schedule::model::{ExecutionRecord, ScheduleDefinition};

/// Durable list of schedule definitions.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// All schedules, in insertion order.
    async fn list_schedules(&self) -> Result<Vec<ScheduleDefinition>, StoreError>;

    async fn get_schedule(&self, id: &str) -> Result<Option<ScheduleDefinition>, StoreError>;

    /// Insert or replace by id.
    async fn put_schedule(&self, schedule: &ScheduleDefinition) -> Result<(), StoreError>;

    /// Returns `false` when nothing was deleted.
    async fn delete_schedule(&self, id: &str) -> Result<bool, StoreError>;
}

/// Per-schedule execution history, capped to the most recent records.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    // ── Records ─────────────────────────────────────────────────────

    /// Records for one schedule, newest `started_at` first.
    async fn list_executions(
        &self,
        schedule_id: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, StoreError>;

    async fn get_execution(
        &self,
        schedule_id: &str,
        execution_id: &str,
    ) -> Result<Option<ExecutionRecord>, StoreError>;

    /// Insert or replace by id, evicting the oldest beyond the cap.
    async fn put_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError>;

    // ── History files ───────────────────────────────────────────────

    /// Schedule ids that have any history.
    async fn list_history_ids(&self) -> Result<Vec<String>, StoreError>;

    /// Drop all history for a schedule.
    async fn delete_history(&self, schedule_id: &str) -> Result<(), StoreError>;
}
