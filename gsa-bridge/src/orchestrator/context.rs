//! Services handed to the connector during initialization.

use std::sync::Arc;

use tracing::debug;

use crate::config::ConfigStore;
use crate::connector::ConnectorContext;
use crate::push::{DocIdCodec, DocIdPusher, DocIdSender, PushErrorHandler};
use crate::status::{StatusRegistry, StatusSource};

pub struct BridgeContext {
    config: Arc<ConfigStore>,
    sender: Arc<DocIdSender>,
    codec: Arc<dyn DocIdCodec>,
    status: Arc<StatusRegistry>,
}

impl BridgeContext {
    pub fn new(
        config: Arc<ConfigStore>,
        sender: Arc<DocIdSender>,
        codec: Arc<dyn DocIdCodec>,
        status: Arc<StatusRegistry>,
    ) -> Self {
        Self {
            config,
            sender,
            codec,
            status,
        }
    }
}

impl ConnectorContext for BridgeContext {
    fn config(&self) -> Arc<ConfigStore> {
        self.config.clone()
    }

    fn doc_id_pusher(&self) -> Arc<dyn DocIdPusher> {
        self.sender.clone()
    }

    fn doc_id_codec(&self) -> Arc<dyn DocIdCodec> {
        self.codec.clone()
    }

    fn add_status_source(&self, source: Arc<dyn StatusSource>) {
        debug!(source = source.name(), "Status source registered");
        self.status.add(source);
    }

    fn remove_status_source(&self, name: &str) {
        self.status.remove(name);
    }

    fn set_push_error_handler(&self, handler: Arc<dyn PushErrorHandler>) {
        self.sender.set_error_handler(handler);
    }

    fn push_error_handler(&self) -> Arc<dyn PushErrorHandler> {
        self.sender.error_handler()
    }
}
