//! Batched delivery of document ids to the feed sink.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::codec::DocIdCodec;
use super::journal::{FullPushStatus, Journal};
use super::{DocId, DocIdPusher};
use crate::config::ConfigStore;
use crate::connector::Connector;
use crate::{Error, Result};

/// Default number of attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 12;

/// Default cap on the delay between attempts (5 minutes).
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(5 * 60);

/// One entry of a feed batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedRecord {
    pub doc_id: DocId,
    pub url: Url,
}

/// Destination of feed batches. The wire format belongs to the sink.
#[async_trait]
pub trait FeedSink: Send + Sync {
    async fn send_batch(&self, feed_name: &str, records: &[FeedRecord]) -> Result<()>;
}

/// Sink that only logs each batch.
#[derive(Debug, Default)]
pub struct LoggingFeedSink;

#[async_trait]
impl FeedSink for LoggingFeedSink {
    async fn send_batch(&self, feed_name: &str, records: &[FeedRecord]) -> Result<()> {
        info!(
            feed = %feed_name,
            count = records.len(),
            first = records.first().map(|r| r.url.as_str()).unwrap_or(""),
            last = records.last().map(|r| r.url.as_str()).unwrap_or(""),
            "Feed batch"
        );
        Ok(())
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    GiveUp,
}

/// Decides whether failed listings and pushes are retried.
///
/// `attempt` counts from 1 for the attempt that just failed.
pub trait PushErrorHandler: Send + Sync {
    fn on_get_doc_ids_failure(&self, error: &Error, attempt: u32) -> RetryDecision;
    fn on_push_failure(&self, error: &Error, attempt: u32) -> RetryDecision;
}

/// Retries up to a fixed number of attempts, doubling the delay from one
/// second up to a cap.
#[derive(Debug, Clone)]
pub struct DefaultPushErrorHandler {
    pub max_attempts: u32,
    pub max_delay: Duration,
}

impl DefaultPushErrorHandler {
    fn decide(&self, attempt: u32) -> RetryDecision {
        if attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        let exponent = attempt.saturating_sub(1).min(30);
        let delay = Duration::from_secs(1u64 << exponent).min(self.max_delay);
        RetryDecision::Retry(delay)
    }
}

impl Default for DefaultPushErrorHandler {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_delay: DEFAULT_MAX_RETRY_DELAY,
        }
    }
}

impl PushErrorHandler for DefaultPushErrorHandler {
    fn on_get_doc_ids_failure(&self, error: &Error, attempt: u32) -> RetryDecision {
        let decision = self.decide(attempt);
        warn!(error = %error, attempt, ?decision, "Failed to list document ids");
        decision
    }

    fn on_push_failure(&self, error: &Error, attempt: u32) -> RetryDecision {
        let decision = self.decide(attempt);
        warn!(error = %error, attempt, ?decision, "Failed to push document ids");
        decision
    }
}

/// Splits document ids into feed batches and delivers them.
pub struct DocIdSender {
    config: Arc<ConfigStore>,
    codec: Arc<dyn DocIdCodec>,
    sink: Arc<dyn FeedSink>,
    journal: Arc<Journal>,
    error_handler: RwLock<Arc<dyn PushErrorHandler>>,
}

impl DocIdSender {
    pub fn new(
        config: Arc<ConfigStore>,
        codec: Arc<dyn DocIdCodec>,
        sink: Arc<dyn FeedSink>,
        journal: Arc<Journal>,
    ) -> Self {
        Self {
            config,
            codec,
            sink,
            journal,
            error_handler: RwLock::new(Arc::new(DefaultPushErrorHandler::default())),
        }
    }

    pub fn error_handler(&self) -> Arc<dyn PushErrorHandler> {
        self.error_handler.read().clone()
    }

    pub fn set_error_handler(&self, handler: Arc<dyn PushErrorHandler>) {
        *self.error_handler.write() = handler;
    }

    /// Run a full listing of `connector`, retrying listing failures as the
    /// error handler decides. Returns early when `cancel` fires.
    pub async fn push_doc_ids_from_connector(
        &self,
        connector: &dyn Connector,
        cancel: &CancellationToken,
    ) -> FullPushStatus {
        info!("Beginning full push of document ids");
        self.journal.record_full_push_started();

        let mut attempt = 0u32;
        let status = loop {
            attempt += 1;
            let result = tokio::select! {
                _ = cancel.cancelled() => break FullPushStatus::Interrupted,
                result = connector.get_doc_ids(self) => result,
            };

            let error = match result {
                Ok(()) => break FullPushStatus::Success,
                Err(e) => e,
            };

            match self.error_handler().on_get_doc_ids_failure(&error, attempt) {
                RetryDecision::GiveUp => break FullPushStatus::Failure,
                RetryDecision::Retry(delay) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break FullPushStatus::Interrupted,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };

        self.journal.record_full_push_finished(status);
        match status {
            FullPushStatus::Success => info!("Completed full push of document ids"),
            FullPushStatus::Failure => warn!("Full push of document ids failed"),
            FullPushStatus::Interrupted => info!("Full push of document ids interrupted"),
        }
        status
    }

    async fn send_with_retry(&self, feed_name: &str, records: &[FeedRecord]) -> bool {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.sink.send_batch(feed_name, records).await {
                Ok(()) => {
                    self.journal.record_batch_pushed(records.len());
                    return true;
                }
                Err(e) => {
                    self.journal.record_batch_failed();
                    match self.error_handler().on_push_failure(&e, attempt) {
                        RetryDecision::Retry(delay) => tokio::time::sleep(delay).await,
                        RetryDecision::GiveUp => return false,
                    }
                }
            }
        }
    }
}

#[async_trait]
impl DocIdPusher for DocIdSender {
    async fn push_doc_ids(&self, ids: &[DocId]) -> Result<Option<DocId>> {
        if ids.is_empty() {
            return Ok(None);
        }

        let config = self.config.snapshot();
        let max_urls = config.feed_max_urls()?;
        let feed_name = config.feed_name()?;

        for batch in ids.chunks(max_urls) {
            let records = batch
                .iter()
                .map(|id| {
                    Ok(FeedRecord {
                        doc_id: id.clone(),
                        url: self.codec.encode(id)?,
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            debug!(feed = %feed_name, count = records.len(), "Pushing document id batch");
            if !self.send_with_retry(&feed_name, &records).await {
                return Ok(Some(batch[0].clone()));
            }
        }

        Ok(None)
    }
}
