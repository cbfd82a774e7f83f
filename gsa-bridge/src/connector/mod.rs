//! Contract between the service and a repository connector.
//!
//! A connector lists document ids and serves document content. The service
//! owns everything else: scheduling, HTTP, configuration and feed delivery.

mod directory;

pub use directory::DirectoryConnector;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::Result;
use crate::config::ConfigStore;
use crate::push::{DocId, DocIdCodec, DocIdPusher, PushErrorHandler};
use crate::status::StatusSource;

/// A request for one document's content.
#[derive(Debug, Clone)]
pub struct DocRequest {
    pub doc_id: DocId,
    /// Value of the crawler's `If-Modified-Since` header, if any.
    pub if_modified_since: Option<DateTime<Utc>>,
}

impl DocRequest {
    pub fn new(doc_id: DocId) -> Self {
        Self {
            doc_id,
            if_modified_since: None,
        }
    }
}

/// Content and metadata of one document.
#[derive(Debug, Clone, Default)]
pub struct DocContent {
    pub content: Bytes,
    pub content_type: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl DocContent {
    pub fn new(content: impl Into<Bytes>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Services a connector may use after initialization.
pub trait ConnectorContext: Send + Sync {
    fn config(&self) -> Arc<ConfigStore>;
    fn doc_id_pusher(&self) -> Arc<dyn DocIdPusher>;
    fn doc_id_codec(&self) -> Arc<dyn DocIdCodec>;
    fn add_status_source(&self, source: Arc<dyn StatusSource>);
    fn remove_status_source(&self, name: &str);
    fn set_push_error_handler(&self, handler: Arc<dyn PushErrorHandler>);
    fn push_error_handler(&self) -> Arc<dyn PushErrorHandler>;
}

/// A repository connector.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Prepare the connector. Failures are retried with backoff.
    async fn init(&self, context: Arc<dyn ConnectorContext>) -> Result<()>;

    /// Release resources. Called on every stop after a successful init.
    async fn destroy(&self);

    /// Push every document id in the repository.
    async fn get_doc_ids(&self, pusher: &dyn DocIdPusher) -> Result<()>;

    /// Fetch the content of one document; `None` when it does not exist.
    async fn get_doc_content(&self, request: &DocRequest) -> Result<Option<DocContent>>;

    /// Push ids modified since the previous call.
    async fn get_modified_doc_ids(&self, _pusher: &dyn DocIdPusher) -> Result<()> {
        Ok(())
    }

    /// Whether [`get_modified_doc_ids`](Self::get_modified_doc_ids) should be polled.
    fn supports_incremental(&self) -> bool {
        false
    }
}
