//! Single-flight guard for long running jobs.
//!
//! [`ExclusiveTask`] wraps a job so that at most one run is in flight at any
//! time. Runs triggered while another is active do not queue: the scheduled
//! path calls a busy callback, the ad hoc path reports `None`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::service::ScheduledJob;

/// Interval at which [`ExclusiveTask::stop`] re-checks and re-cancels.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Work guarded by an [`ExclusiveTask`].
///
/// Implementations should return promptly once `cancel` fires.
#[async_trait]
pub trait GuardedTask: Send + Sync {
    async fn run(&self, cancel: CancellationToken);
}

#[derive(Default)]
struct GuardState {
    running: AtomicBool,
    current: Mutex<Option<CancellationToken>>,
    idle: Notify,
}

/// Marks the guard as running; releases it on drop.
struct RunningGuard {
    state: Arc<GuardState>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.state.current.lock().take();
        self.state.running.store(false, Ordering::Release);
        self.state.idle.notify_waiters();
    }
}

/// Runs a [`GuardedTask`] with at most one invocation in flight.
pub struct ExclusiveTask {
    name: String,
    task: Arc<dyn GuardedTask>,
    on_busy: Box<dyn Fn() + Send + Sync>,
    state: Arc<GuardState>,
}

impl ExclusiveTask {
    pub fn new(
        name: impl Into<String>,
        task: Arc<dyn GuardedTask>,
        on_busy: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            task,
            on_busy: Box::new(on_busy),
            state: Arc::new(GuardState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }

    fn try_acquire(&self) -> Option<(RunningGuard, CancellationToken)> {
        self.state
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;

        let guard = RunningGuard {
            state: self.state.clone(),
        };
        let token = CancellationToken::new();
        *self.state.current.lock() = Some(token.clone());
        Some((guard, token))
    }

    /// Run the task on the calling task if idle; otherwise invoke the busy
    /// callback and return immediately.
    pub async fn scheduled_run(&self) {
        let Some((_guard, token)) = self.try_acquire() else {
            (self.on_busy)();
            return;
        };

        debug!(task = %self.name, "Exclusive task started");
        self.task.run(token).await;
        debug!(task = %self.name, "Exclusive task finished");
    }

    /// Start the task on a new tokio task if idle.
    ///
    /// Returns `None` when a run is already in progress.
    pub fn run_in_new_task(&self) -> Option<JoinHandle<()>> {
        let (guard, token) = self.try_acquire()?;
        let task = self.task.clone();
        let name = self.name.clone();

        Some(tokio::spawn(async move {
            let _guard = guard;
            debug!(task = %name, "Exclusive task started");
            task.run(token).await;
            debug!(task = %name, "Exclusive task finished");
        }))
    }

    /// Cancel the in-flight run and wait up to `max_wait` for it to finish.
    ///
    /// Returns whether the guard is idle.
    pub async fn stop(&self, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;

        loop {
            let idle = self.state.idle.notified();
            if !self.is_running() {
                return true;
            }

            if let Some(token) = self.state.current.lock().as_ref() {
                token.cancel();
            }

            let now = Instant::now();
            if now >= deadline {
                return !self.is_running();
            }

            let wait = (deadline - now).min(STOP_POLL_INTERVAL);
            tokio::select! {
                _ = idle => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

#[async_trait]
impl ScheduledJob for ExclusiveTask {
    async fn run(&self) {
        self.scheduled_run().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Blocks until released or cancelled.
    struct Gate {
        runs: AtomicUsize,
        release: Notify,
        started: Notify,
    }

    impl Gate {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicUsize::new(0),
                release: Notify::new(),
                started: Notify::new(),
            })
        }
    }

    #[async_trait]
    impl GuardedTask for Gate {
        async fn run(&self, cancel: CancellationToken) {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            tokio::select! {
                _ = self.release.notified() => {}
                _ = cancel.cancelled() => {}
            }
        }
    }

    struct Panics;

    #[async_trait]
    impl GuardedTask for Panics {
        async fn run(&self, _cancel: CancellationToken) {
            panic!("task failure");
        }
    }

    /// Ignores cancellation for a fixed time.
    struct Stubborn(Duration);

    #[async_trait]
    impl GuardedTask for Stubborn {
        async fn run(&self, _cancel: CancellationToken) {
            tokio::time::sleep(self.0).await;
        }
    }

    fn exclusive(task: Arc<dyn GuardedTask>, busy: Arc<AtomicUsize>) -> Arc<ExclusiveTask> {
        Arc::new(ExclusiveTask::new("test", task, move || {
            busy.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[tokio::test]
    async fn test_concurrent_triggers_run_once() {
        let gate = Gate::new();
        let busy = Arc::new(AtomicUsize::new(0));
        let task = exclusive(gate.clone(), busy.clone());

        let first = task.run_in_new_task().unwrap();
        gate.started.notified().await;

        let mut triggers = Vec::new();
        for _ in 0..8 {
            let task = task.clone();
            triggers.push(tokio::spawn(async move { task.scheduled_run().await }));
        }
        for result in futures::future::join_all(triggers).await {
            result.unwrap();
        }

        assert!(task.run_in_new_task().is_none());
        assert_eq!(busy.load(Ordering::SeqCst), 8);
        assert!(task.is_running());

        gate.release.notify_one();
        first.await.unwrap();

        assert!(!task.is_running());
        assert_eq!(gate.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_guard_released_after_panic() {
        let busy = Arc::new(AtomicUsize::new(0));
        let task = exclusive(Arc::new(Panics), busy);

        let handle = task.run_in_new_task().unwrap();
        assert!(handle.await.is_err());
        assert!(!task.is_running());
        assert!(task.run_in_new_task().is_some());
    }

    #[tokio::test]
    async fn test_guard_released_when_future_dropped() {
        let gate = Gate::new();
        let task = exclusive(gate.clone(), Arc::new(AtomicUsize::new(0)));

        let run = task.clone();
        let _ = tokio::time::timeout(Duration::from_millis(20), async move {
            run.scheduled_run().await
        })
        .await;

        assert!(!task.is_running());
    }

    #[tokio::test]
    async fn test_stop_cancels_in_flight_run() {
        let gate = Gate::new();
        let task = exclusive(gate.clone(), Arc::new(AtomicUsize::new(0)));

        let handle = task.run_in_new_task().unwrap();
        gate.started.notified().await;

        assert!(task.stop(Duration::from_secs(1)).await);
        assert!(!task.is_running());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_times_out_when_task_ignores_cancellation() {
        let task = exclusive(
            Arc::new(Stubborn(Duration::from_millis(400))),
            Arc::new(AtomicUsize::new(0)),
        );

        let handle = task.run_in_new_task().unwrap();
        assert!(!task.stop(Duration::from_millis(60)).await);
        assert!(task.is_running());

        handle.await.unwrap();
        assert!(task.stop(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_stop_when_idle_returns_immediately() {
        let task = exclusive(Gate::new(), Arc::new(AtomicUsize::new(0)));
        assert!(task.stop(Duration::ZERO).await);
    }
}
