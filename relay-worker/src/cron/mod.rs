//! Scheduled mailbox scans.
//!
//! Each enabled webhook may carry a `cron` block. At startup one job is
//! registered per valid pattern; every firing scans the account's INBOX in
//! detached mode with deletion enabled.

pub mod pattern;
pub mod scheduler;

pub use pattern::{is_valid_pattern, job_key, parse_schedule, CronSchedule, PatternError};
pub use scheduler::CronScheduler;
