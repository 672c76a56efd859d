//! JSON-file stores.
//!
//! Schedules live in one `schedules.json` array. History is one
//! `history/<schedule_id>.json` array per schedule. Every write goes to a
//! temp file first and is renamed into place, so a crash never leaves a
//! half-written file behind.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;
use tokio::sync::Mutex;

use crate::agent::profile::SAFE_NAME;
use crate::config::{DEFAULT_HISTORY_LIMIT, StoreConfig};
use crate::error::StoreError;
use crate::schedule::model::{ExecutionRecord, ScheduleDefinition};
use crate::store::traits::{ExecutionStore, ScheduleStore};

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Read a JSON file, treating a missing file as the default value.
async fn read_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StoreError> {
    match fs::read_to_string(path).await {
        Ok(contents) if contents.trim().is_empty() => Ok(T::default()),
        Ok(contents) => serde_json::from_str(&contents).map_err(|e| StoreError::Serialization {
            path: path.display().to_string(),
            reason: e.to_string(),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(io_error(path, e)),
    }
}

async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| io_error(parent, e))?;
    }
    let payload =
        serde_json::to_string_pretty(value).map_err(|e| StoreError::Serialization {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
    let tmp_name = format!(
        ".{}.tmp",
        path.file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("store")
    );
    let tmp_path = path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(tmp_name);
    fs::write(&tmp_path, payload)
        .await
        .map_err(|e| io_error(&tmp_path, e))?;
    fs::rename(&tmp_path, path)
        .await
        .map_err(|e| io_error(path, e))
}

// ── Schedules ───────────────────────────────────────────────────────

/// All schedule definitions in a single JSON file.
pub struct JsonScheduleStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonScheduleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.schedules_path())
    }
}

#[async_trait]
impl ScheduleStore for JsonScheduleStore {
    async fn list_schedules(&self) -> Result<Vec<ScheduleDefinition>, StoreError> {
        let _guard = self.lock.lock().await;
        read_json(&self.path).await
    }

    async fn get_schedule(&self, id: &str) -> Result<Option<ScheduleDefinition>, StoreError> {
        let _guard = self.lock.lock().await;
        let all: Vec<ScheduleDefinition> = read_json(&self.path).await?;
        Ok(all.into_iter().find(|s| s.id == id))
    }

    async fn put_schedule(&self, schedule: &ScheduleDefinition) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut all: Vec<ScheduleDefinition> = read_json(&self.path).await?;
        match all.iter_mut().find(|s| s.id == schedule.id) {
            Some(existing) => *existing = schedule.clone(),
            None => all.push(schedule.clone()),
        }
        write_json_atomic(&self.path, &all).await
    }

    async fn delete_schedule(&self, id: &str) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().await;
        let mut all: Vec<ScheduleDefinition> = read_json(&self.path).await?;
        let before = all.len();
        all.retain(|s| s.id != id);
        if all.len() == before {
            return Ok(false);
        }
        write_json_atomic(&self.path, &all).await?;
        Ok(true)
    }
}

// ── Execution history ───────────────────────────────────────────────

/// One JSON file of execution records per schedule.
pub struct JsonExecutionStore {
    dir: PathBuf,
    limit: usize,
    lock: Mutex<()>,
}

impl JsonExecutionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            limit: DEFAULT_HISTORY_LIMIT,
            lock: Mutex::new(()),
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.history_dir())
    }

    /// Records kept per schedule.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    fn history_path(&self, schedule_id: &str) -> Result<PathBuf, StoreError> {
        if !SAFE_NAME.is_match(schedule_id) {
            return Err(StoreError::InvalidKey(schedule_id.to_string()));
        }
        Ok(self.dir.join(format!("{schedule_id}.json")))
    }

    async fn load(&self, schedule_id: &str) -> Result<Vec<ExecutionRecord>, StoreError> {
        read_json(&self.history_path(schedule_id)?).await
    }
}

fn newest_first(records: &mut [ExecutionRecord]) {
    records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
}

#[async_trait]
impl ExecutionStore for JsonExecutionStore {
    async fn list_executions(
        &self,
        schedule_id: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let _guard = self.lock.lock().await;
        let mut records = self.load(schedule_id).await?;
        newest_first(&mut records);
        records.truncate(limit);
        Ok(records)
    }

    async fn get_execution(
        &self,
        schedule_id: &str,
        execution_id: &str,
    ) -> Result<Option<ExecutionRecord>, StoreError> {
        let _guard = self.lock.lock().await;
        let records = self.load(schedule_id).await?;
        Ok(records.into_iter().find(|r| r.id == execution_id))
    }

    async fn put_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let path = self.history_path(&record.schedule_id)?;
        let mut records: Vec<ExecutionRecord> = read_json(&path).await?;
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record.clone(),
            None => records.push(record.clone()),
        }
        newest_first(&mut records);
        records.truncate(self.limit);
        write_json_atomic(&path, &records).await
    }

    async fn list_history_ids(&self) -> Result<Vec<String>, StoreError> {
        let _guard = self.lock.lock().await;
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&self.dir, e)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error(&self.dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if SAFE_NAME.is_match(stem) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn delete_history(&self, schedule_id: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let path = self.history_path(schedule_id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, Utc};
    use tempfile::TempDir;

    use super::*;
    use crate::schedule::model::{RunStatus, Schedule};

    fn definition(name: &str) -> ScheduleDefinition {
        ScheduleDefinition::new(
            name,
            "reviewer",
            "/srv/repo",
            Schedule::Interval {
                interval_minutes: 30,
            },
            "review",
        )
    }

    fn record(schedule_id: &str, minutes_ago: i64) -> ExecutionRecord {
        let task = definition("x").to_task();
        let mut record = ExecutionRecord::started(&task, schedule_id);
        record.started_at = Utc::now() - ChronoDuration::minutes(minutes_ago);
        record
    }

    #[tokio::test]
    async fn missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonScheduleStore::new(dir.path().join("schedules.json"));
        assert!(store.list_schedules().await.unwrap().is_empty());
        assert!(store.get_schedule("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn schedule_put_replaces_by_id() {
        let dir = TempDir::new().unwrap();
        let store = JsonScheduleStore::new(dir.path().join("schedules.json"));

        let mut a = definition("a");
        let b = definition("b");
        store.put_schedule(&a).await.unwrap();
        store.put_schedule(&b).await.unwrap();

        a.enabled = false;
        store.put_schedule(&a).await.unwrap();

        let all = store.list_schedules().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, a.id);
        assert!(!all[0].enabled);

        assert!(store.delete_schedule(&a.id).await.unwrap());
        assert!(!store.delete_schedule(&a.id).await.unwrap());
        assert_eq!(store.list_schedules().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn no_temp_file_left_behind() {
        let dir = TempDir::new().unwrap();
        let store = JsonScheduleStore::new(dir.path().join("schedules.json"));
        store.put_schedule(&definition("a")).await.unwrap();
        assert!(dir.path().join("schedules.json").exists());
        assert!(!dir.path().join(".schedules.json.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_file_is_a_serialization_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("schedules.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = JsonScheduleStore::new(path);
        assert!(matches!(
            store.list_schedules().await,
            Err(StoreError::Serialization { .. })
        ));
    }

    #[tokio::test]
    async fn history_sorted_newest_first_and_capped() {
        let dir = TempDir::new().unwrap();
        let store = JsonExecutionStore::new(dir.path()).with_limit(3);

        for minutes_ago in [30, 10, 50, 20, 40] {
            store.put_execution(&record("sched-1", minutes_ago)).await.unwrap();
        }

        let records = store.list_executions("sched-1", 10).await.unwrap();
        assert_eq!(records.len(), 3);
        assert!(records[0].started_at > records[1].started_at);
        assert!(records[1].started_at > records[2].started_at);

        // The 50 and 40 minute old records were evicted.
        let oldest_kept = Utc::now() - ChronoDuration::minutes(31);
        assert!(records.iter().all(|r| r.started_at > oldest_kept));

        assert_eq!(store.list_executions("sched-1", 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn history_update_in_place() {
        let dir = TempDir::new().unwrap();
        let store = JsonExecutionStore::new(dir.path());

        let mut r = record("sched-1", 1);
        store.put_execution(&r).await.unwrap();
        r.status = RunStatus::Success;
        store.put_execution(&r).await.unwrap();

        let records = store.list_executions("sched-1", 10).await.unwrap();
        assert_eq!(records.len(), 1);
        let fetched = store.get_execution("sched-1", &r.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, RunStatus::Success);
    }

    #[tokio::test]
    async fn history_ids_and_delete() {
        let dir = TempDir::new().unwrap();
        let store = JsonExecutionStore::new(dir.path());
        store.put_execution(&record("alpha", 1)).await.unwrap();
        store.put_execution(&record("beta", 1)).await.unwrap();

        assert_eq!(store.list_history_ids().await.unwrap(), vec!["alpha", "beta"]);
        store.delete_history("alpha").await.unwrap();
        store.delete_history("alpha").await.unwrap();
        assert_eq!(store.list_history_ids().await.unwrap(), vec!["beta"]);
    }

    #[tokio::test]
    async fn rejects_path_traversal() {
        let dir = TempDir::new().unwrap();
        let store = JsonExecutionStore::new(dir.path());
        assert!(matches!(
            store.list_executions("../etc", 10).await,
            Err(StoreError::InvalidKey(_))
        ));
    }
}
