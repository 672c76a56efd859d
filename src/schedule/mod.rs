//! Schedules: definitions, cron handling, the trigger scheduler and the
//! startup orphan sweep.

pub mod cron;
pub mod model;
pub mod recovery;
pub mod scheduler;

pub use model::{ExecutionRecord, RunStatus, Schedule, ScheduleDefinition};
pub use recovery::{RecoveryReport, sweep_orphans};
pub use scheduler::Scheduler;
