//! Document id push pipeline.
//!
//! Connectors hand document ids to a [`DocIdPusher`]. The [`DocIdSender`]
//! turns them into feed records, delivers them in batches to a [`FeedSink`]
//! and records the outcome in the [`Journal`].

pub mod codec;
pub mod journal;
pub mod sender;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use codec::{DocIdCodec, PercentDocIdCodec};
pub use journal::{FullPushOutcome, FullPushStatus, Journal, JournalSnapshot, RequestOutcome};
pub use sender::{
    DefaultPushErrorHandler, DocIdSender, FeedRecord, FeedSink, LoggingFeedSink,
    PushErrorHandler, RetryDecision,
};

/// Opaque identifier of a document in the repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocId(String);

impl DocId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DocId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Sink for document ids discovered by a connector.
#[async_trait]
pub trait DocIdPusher: Send + Sync {
    /// Push `ids` to the crawler.
    ///
    /// Returns the first id that could not be delivered, or `None` when all
    /// were delivered.
    async fn push_doc_ids(&self, ids: &[DocId]) -> crate::Result<Option<DocId>>;
}
