//! In-memory record of push and request activity.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Final state of a full push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FullPushStatus {
    Success,
    Failure,
    Interrupted,
}

/// Outcome of the most recent full push.
#[derive(Debug, Clone, Serialize)]
pub struct FullPushOutcome {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: FullPushStatus,
    pub pushed_ids: u64,
}

/// How a document request was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Served,
    NotFound,
    Rejected,
    TimedOut,
    Failed,
}

#[derive(Debug, Default)]
struct FullPushState {
    current_start: Option<DateTime<Utc>>,
    current_base: u64,
    last: Option<FullPushOutcome>,
}

/// Point-in-time copy of the journal counters.
#[derive(Debug, Clone, Serialize)]
pub struct JournalSnapshot {
    pub started_at: DateTime<Utc>,
    pub pushed_ids: u64,
    pub pushed_batches: u64,
    pub failed_batches: u64,
    pub requests_served: u64,
    pub requests_not_found: u64,
    pub requests_rejected: u64,
    pub requests_timed_out: u64,
    pub requests_failed: u64,
    pub full_push_in_progress: bool,
    pub last_full_push: Option<FullPushOutcome>,
}

/// Counters of pushed ids and served requests.
#[derive(Debug)]
pub struct Journal {
    started_at: DateTime<Utc>,
    pushed_ids: AtomicU64,
    pushed_batches: AtomicU64,
    failed_batches: AtomicU64,
    requests_served: AtomicU64,
    requests_not_found: AtomicU64,
    requests_rejected: AtomicU64,
    requests_timed_out: AtomicU64,
    requests_failed: AtomicU64,
    full_push: Mutex<FullPushState>,
}

impl Journal {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            pushed_ids: AtomicU64::new(0),
            pushed_batches: AtomicU64::new(0),
            failed_batches: AtomicU64::new(0),
            requests_served: AtomicU64::new(0),
            requests_not_found: AtomicU64::new(0),
            requests_rejected: AtomicU64::new(0),
            requests_timed_out: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            full_push: Mutex::new(FullPushState::default()),
        }
    }

    pub fn record_batch_pushed(&self, ids: usize) {
        self.pushed_ids.fetch_add(ids as u64, Ordering::Relaxed);
        self.pushed_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_failed(&self) {
        self.failed_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request(&self, outcome: RequestOutcome) {
        let counter = match outcome {
            RequestOutcome::Served => &self.requests_served,
            RequestOutcome::NotFound => &self.requests_not_found,
            RequestOutcome::Rejected => &self.requests_rejected,
            RequestOutcome::TimedOut => &self.requests_timed_out,
            RequestOutcome::Failed => &self.requests_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_full_push_started(&self) {
        let mut state = self.full_push.lock();
        state.current_start = Some(Utc::now());
        state.current_base = self.pushed_ids.load(Ordering::Relaxed);
    }

    /// Close the running full push. Ids pushed since it started are
    /// attributed to it, including ids from concurrent incremental polls.
    pub fn record_full_push_finished(&self, status: FullPushStatus) {
        let mut state = self.full_push.lock();
        let started_at = state.current_start.take().unwrap_or_else(Utc::now);
        let pushed_ids = self
            .pushed_ids
            .load(Ordering::Relaxed)
            .saturating_sub(state.current_base);

        state.last = Some(FullPushOutcome {
            started_at,
            finished_at: Utc::now(),
            status,
            pushed_ids,
        });
    }

    pub fn last_full_push(&self) -> Option<FullPushOutcome> {
        self.full_push.lock().last.clone()
    }

    pub fn is_full_push_in_progress(&self) -> bool {
        self.full_push.lock().current_start.is_some()
    }

    pub fn snapshot(&self) -> JournalSnapshot {
        let full_push = self.full_push.lock();
        JournalSnapshot {
            started_at: self.started_at,
            pushed_ids: self.pushed_ids.load(Ordering::Relaxed),
            pushed_batches: self.pushed_batches.load(Ordering::Relaxed),
            failed_batches: self.failed_batches.load(Ordering::Relaxed),
            requests_served: self.requests_served.load(Ordering::Relaxed),
            requests_not_found: self.requests_not_found.load(Ordering::Relaxed),
            requests_rejected: self.requests_rejected.load(Ordering::Relaxed),
            requests_timed_out: self.requests_timed_out.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            full_push_in_progress: full_push.current_start.is_some(),
            last_full_push: full_push.last.clone(),
        }
    }
}

impl Default for Journal {
    fn default() -> Self {
        Self::new()
    }
}
