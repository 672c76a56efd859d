//! Agent scheduler: cron/interval/one-shot schedules feeding a bounded
//! executor of isolated agent task workers.

pub mod agent;
pub mod config;
pub mod error;
pub mod schedule;
pub mod store;
pub mod worker;
