//! Persistence layer: JSON-file storage for schedules and execution history.

pub mod json;
pub mod traits;

pub use json::{JsonExecutionStore, JsonScheduleStore};
pub use traits::{ExecutionStore, ScheduleStore};
