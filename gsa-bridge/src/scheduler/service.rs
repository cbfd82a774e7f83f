//! Cron scheduler with live rescheduling.
//!
//! Every scheduled job gets a trigger loop that sleeps until the next fire
//! time of its [`CronSchedule`]. Each firing runs the job on its own task.
//! Trigger loops and invocations are tracked so [`CronScheduler::stop`] can
//! wait for them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::cron_expr::CronSchedule;
use crate::{Error, Result};

/// Longest single sleep of a trigger loop. Bounds the effect of wall clock
/// jumps on the next firing.
const MAX_TRIGGER_SLEEP: Duration = Duration::from_secs(60);

/// A job the scheduler can fire.
#[async_trait]
pub trait ScheduledJob: Send + Sync {
    async fn run(&self);
}

/// Identity of a scheduled job; stable across reschedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Source of the current wall clock time.
pub type Clock = Arc<dyn Fn() -> DateTime<Local> + Send + Sync>;

struct JobEntry {
    schedule: watch::Sender<Arc<CronSchedule>>,
    cancel: CancellationToken,
}

/// Cron scheduler.
pub struct CronScheduler {
    jobs: Mutex<HashMap<JobId, JobEntry>>,
    tracker: TaskTracker,
    cancel: Mutex<CancellationToken>,
    started: AtomicBool,
    next_id: AtomicU64,
    clock: Clock,
}

impl CronScheduler {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(Local::now))
    }

    /// Create a scheduler reading time from `clock`.
    pub fn with_clock(clock: Clock) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            tracker: TaskTracker::new(),
            cancel: Mutex::new(CancellationToken::new()),
            started: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            clock,
        }
    }

    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.cancel.lock() = CancellationToken::new();
        self.tracker.reopen();
        debug!("Scheduler started");
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Register `job` to run whenever `expression` fires.
    pub fn schedule(&self, expression: &str, job: Arc<dyn ScheduledJob>) -> Result<JobId> {
        let schedule = Arc::new(CronSchedule::parse(expression)?);
        if !self.is_started() {
            return Err(Error::Other("Scheduler is not started".to_string()));
        }

        let id = JobId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let cancel = self.cancel.lock().child_token();
        let (tx, rx) = watch::channel(schedule);

        self.tracker.spawn(trigger_loop(
            id,
            rx,
            job,
            cancel.clone(),
            self.tracker.clone(),
            self.clock.clone(),
        ));

        self.jobs.lock().insert(
            id,
            JobEntry {
                schedule: tx,
                cancel,
            },
        );
        info!(job = %id, expression = %expression, "Job scheduled");
        Ok(id)
    }

    /// Replace the trigger of `id`. On error the previous trigger stays.
    pub fn reschedule(&self, id: JobId, expression: &str) -> Result<()> {
        let schedule = CronSchedule::parse(expression)?;

        let jobs = self.jobs.lock();
        let entry = jobs
            .get(&id)
            .ok_or_else(|| Error::Other(format!("Unknown scheduled job: {id}")))?;
        entry.schedule.send_replace(Arc::new(schedule));

        info!(job = %id, expression = %expression, "Job rescheduled");
        Ok(())
    }

    /// Remove a job. Returns whether it was scheduled.
    pub fn deschedule(&self, id: JobId) -> bool {
        match self.jobs.lock().remove(&id) {
            Some(entry) => {
                entry.cancel.cancel();
                debug!(job = %id, "Job descheduled");
                true
            }
            None => false,
        }
    }

    /// The expression currently driving `id`.
    pub fn expression(&self, id: JobId) -> Option<String> {
        self.jobs
            .lock()
            .get(&id)
            .map(|entry| entry.schedule.borrow().expression().to_string())
    }

    /// Stop all trigger loops and wait for running invocations to finish.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }

        self.cancel.lock().cancel();
        self.jobs.lock().clear();
        self.tracker.close();
        self.tracker.wait().await;
        debug!("Scheduler stopped");
    }
}

impl Default for CronScheduler {
    fn default() -> Self {
        Self::new()
    }
}

async fn trigger_loop(
    id: JobId,
    mut schedule_rx: watch::Receiver<Arc<CronSchedule>>,
    job: Arc<dyn ScheduledJob>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    clock: Clock,
) {
    let mut last_fired: Option<DateTime<Local>> = None;

    loop {
        let schedule = schedule_rx.borrow_and_update().clone();
        let now = clock();
        let from = match last_fired {
            Some(fired) if fired > now => fired,
            _ => now,
        };

        let Some(next) = schedule.next_after(&from) else {
            warn!(job = %id, expression = %schedule.expression(), "Schedule never fires again");
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = schedule_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            continue;
        };

        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = schedule_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(wait.min(MAX_TRIGGER_SLEEP)) => {
                if clock() >= next {
                    last_fired = Some(next);
                    debug!(job = %id, at = %next, "Firing scheduled job");
                    let job = job.clone();
                    tracker.spawn(async move { job.run().await });
                }
            }
        }
    }

    debug!(job = %id, "Trigger loop finished");
}
