//! Admission control for request handling.
//!
//! At most `max_workers` requests run at once and at most `queue_capacity`
//! wait for a worker. A request arriving when both are full is not dropped:
//! it runs right away with its [`AbortSignal`] raised so the handler can
//! answer `503` without doing real work.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::warn;

/// Tells a handler that its request was rejected by admission control.
///
/// Handlers receive it through request extensions.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    fn lower(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Lowers the signal when the rejected request finishes, including on panic
/// and cancellation.
struct Lowered(AbortSignal);

impl Drop for Lowered {
    fn drop(&mut self) {
        self.0.lower();
    }
}

/// Decrements a gauge on drop.
struct Gauge<'a>(&'a AtomicUsize);

impl<'a> Gauge<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for Gauge<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Counters exposed on the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AdmissionStats {
    pub max_workers: usize,
    pub queue_capacity: usize,
    pub running: usize,
    pub queued: usize,
    pub rejected: u64,
}

/// Bounded worker pool with a bounded waiting queue.
#[derive(Debug)]
pub struct AdmissionPool {
    max_workers: usize,
    queue_capacity: usize,
    /// Running plus queued requests.
    slots: Arc<Semaphore>,
    workers: Arc<Semaphore>,
    running: AtomicUsize,
    queued: AtomicUsize,
    rejected: AtomicU64,
}

impl AdmissionPool {
    pub fn new(max_workers: usize, queue_capacity: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            max_workers,
            queue_capacity,
            slots: Arc::new(Semaphore::new(max_workers + queue_capacity)),
            workers: Arc::new(Semaphore::new(max_workers)),
            running: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Run `task` under admission control and return its output.
    ///
    /// The task receives the request's [`AbortSignal`]; it is raised only when
    /// the request was rejected.
    pub async fn execute<F, Fut, T>(&self, task: F) -> T
    where
        F: FnOnce(AbortSignal) -> Fut,
        Fut: Future<Output = T>,
    {
        let signal = AbortSignal::new();

        let Ok(_slot) = self.slots.clone().try_acquire_owned() else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(
                max_workers = self.max_workers,
                queue_capacity = self.queue_capacity,
                "Request rejected, worker pool and queue are full"
            );
            signal.raise();
            let _lowered = Lowered(signal.clone());
            return task(signal).await;
        };

        let worker = {
            let _waiting = Gauge::enter(&self.queued);
            self.workers.clone().acquire_owned().await
        };
        // The worker semaphore is never closed.
        let _worker = worker.ok();
        let _running = Gauge::enter(&self.running);
        task(signal).await
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            max_workers: self.max_workers,
            queue_capacity: self.queue_capacity,
            running: self.running(),
            queued: self.queued(),
            rejected: self.rejected(),
        }
    }
}

/// Middleware running each request through the pool, with the request's
/// [`AbortSignal`] inserted into its extensions.
pub async fn admission_middleware(
    State(pool): State<Arc<AdmissionPool>>,
    mut request: Request,
    next: Next,
) -> Response {
    pool.execute(move |signal| {
        request.extensions_mut().insert(signal);
        next.run(request)
    })
    .await
}
