//! Fixed-period polling for recently modified documents.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connector::Connector;
use crate::push::DocIdPusher;

/// Clears the busy flag when an iteration ends, however it ends.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Periodically asks a connector for modified ids.
///
/// The first poll happens immediately. A tick that arrives while the previous
/// iteration is still running is skipped rather than queued.
pub struct IncrementalPoller {
    cancel: CancellationToken,
    busy: Arc<AtomicBool>,
    skipped: Arc<AtomicU64>,
    timer: JoinHandle<()>,
}

impl IncrementalPoller {
    pub fn start(
        connector: Arc<dyn Connector>,
        pusher: Arc<dyn DocIdPusher>,
        period: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let busy = Arc::new(AtomicBool::new(false));
        let skipped = Arc::new(AtomicU64::new(0));

        let timer = tokio::spawn(Self::timer_loop(
            connector,
            pusher,
            period,
            cancel.clone(),
            busy.clone(),
            skipped.clone(),
        ));

        info!(period_ms = period.as_millis() as u64, "Incremental poller started");
        Self {
            cancel,
            busy,
            skipped,
            timer,
        }
    }

    async fn timer_loop(
        connector: Arc<dyn Connector>,
        pusher: Arc<dyn DocIdPusher>,
        period: Duration,
        cancel: CancellationToken,
        busy: Arc<AtomicBool>,
        skipped: Arc<AtomicU64>,
    ) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if busy
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                skipped.fetch_add(1, Ordering::Relaxed);
                warn!("Previous incremental poll still running, skipping this one");
                continue;
            }

            let guard = BusyGuard(busy.clone());
            let connector = connector.clone();
            let pusher = pusher.clone();
            tokio::spawn(async move {
                let _guard = guard;
                debug!("Polling for modified documents");
                if let Err(e) = connector.get_modified_doc_ids(pusher.as_ref()).await {
                    warn!(error = %e, "Incremental poll failed");
                }
            });
        }

        debug!("Incremental poller timer stopped");
    }

    /// Stop the timer. An iteration already running completes on its own.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether an iteration is running right now.
    pub fn is_polling(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Number of ticks dropped because an iteration was still running.
    pub fn skipped_ticks(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

impl Drop for IncrementalPoller {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.timer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Result;
    use crate::connector::{ConnectorContext, DocContent, DocRequest};
    use crate::push::DocId;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct NoopPusher;

    #[async_trait]
    impl DocIdPusher for NoopPusher {
        async fn push_doc_ids(&self, _ids: &[DocId]) -> Result<Option<DocId>> {
            Ok(None)
        }
    }

    /// Counts polls; each poll takes `work` to finish.
    struct SlowPolls {
        polls: AtomicU32,
        finished: AtomicU32,
        work: Duration,
    }

    #[async_trait]
    impl Connector for SlowPolls {
        async fn init(&self, _context: Arc<dyn ConnectorContext>) -> Result<()> {
            Ok(())
        }

        async fn destroy(&self) {}

        async fn get_doc_ids(&self, _pusher: &dyn DocIdPusher) -> Result<()> {
            Ok(())
        }

        async fn get_doc_content(&self, _request: &DocRequest) -> Result<Option<DocContent>> {
            Ok(None)
        }

        async fn get_modified_doc_ids(&self, _pusher: &dyn DocIdPusher) -> Result<()> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.work).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn supports_incremental(&self) -> bool {
            true
        }
    }

    fn connector(work: Duration) -> Arc<SlowPolls> {
        Arc::new(SlowPolls {
            polls: AtomicU32::new(0),
            finished: AtomicU32::new(0),
            work,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_poll_is_immediate_and_periodic() {
        let connector = connector(Duration::ZERO);
        let poller = IncrementalPoller::start(
            connector.clone(),
            Arc::new(NoopPusher),
            Duration::from_secs(10),
        );

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(connector.polls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(connector.polls.load(Ordering::SeqCst), 3);
        assert_eq!(poller.skipped_ticks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_ticks_are_skipped() {
        let connector = connector(Duration::from_secs(25));
        let poller = IncrementalPoller::start(
            connector.clone(),
            Arc::new(NoopPusher),
            Duration::from_secs(10),
        );

        // Ticks at 0, 10, 20 and 30: the poll started at 0 runs until 25.
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(connector.polls.load(Ordering::SeqCst), 2);
        assert_eq!(poller.skipped_ticks(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_lets_running_poll_finish() {
        let connector = connector(Duration::from_secs(5));
        let poller = IncrementalPoller::start(
            connector.clone(),
            Arc::new(NoopPusher),
            Duration::from_secs(10),
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(poller.is_polling());
        poller.cancel();
        assert!(poller.is_cancelled());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.polls.load(Ordering::SeqCst), 1);
        assert_eq!(connector.finished.load(Ordering::SeqCst), 1);
        assert!(!poller.is_polling());
    }
}
