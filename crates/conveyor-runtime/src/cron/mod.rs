//! Cron scheduling: expression parsing and the tick loop that starts
//! workflows on schedule (spec §4.9).

pub mod expr;
pub mod scheduler;

pub use expr::{CronError, CronExpr};
pub use scheduler::{CronScheduler, Schedule, SchedulerError};
