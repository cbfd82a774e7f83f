//! Background job machinery: cron triggers, the single-flight guard, the
//! incremental poller and the connector init backoff.

pub mod backoff;
pub mod cron_expr;
pub mod exclusive;
pub mod poller;
pub mod service;

pub use backoff::{BackoffConfig, InitBackoff};
pub use cron_expr::CronSchedule;
pub use exclusive::{ExclusiveTask, GuardedTask};
pub use poller::IncrementalPoller;
pub use service::{Clock, CronScheduler, JobId, ScheduledJob};
