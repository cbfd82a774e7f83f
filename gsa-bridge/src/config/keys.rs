//! Built-in configuration keys, their defaults and typed accessors.

use std::time::Duration;

use super::snapshot::{ConfigSnapshot, KeySchema};
use crate::{Error, Result};

pub const SERVER_HOSTNAME: &str = "server.hostname";
pub const SERVER_PORT: &str = "server.port";
pub const SERVER_REVERSE_PROXY_PORT: &str = "server.reverseProxyPort";
pub const SERVER_REVERSE_PROXY_PROTOCOL: &str = "server.reverseProxyProtocol";
pub const SERVER_DASHBOARD_PORT: &str = "server.dashboardPort";
pub const SERVER_DOC_ID_PATH: &str = "server.docIdPath";
pub const SERVER_FULL_ACCESS_HOSTS: &str = "server.fullAccessHosts";
pub const SERVER_SECURE: &str = "server.secure";
pub const SERVER_KEY_ALIAS: &str = "server.keyAlias";
pub const SERVER_MAX_WORKER_THREADS: &str = "server.maxWorkerThreads";
pub const SERVER_QUEUE_CAPACITY: &str = "server.queueCapacity";
pub const SERVER_USE_COMPRESSION: &str = "server.useCompression";
pub const GSA_HOSTNAME: &str = "gsa.hostname";
pub const GSA_CHARACTER_ENCODING: &str = "gsa.characterEncoding";
pub const DOC_ID_IS_URL: &str = "docId.isUrl";
pub const FEED_NAME: &str = "feed.name";
pub const FEED_MAX_URLS: &str = "feed.maxUrls";
pub const ADAPTOR_PUSH_DOC_IDS_ON_STARTUP: &str = "adaptor.pushDocIdsOnStartup";
pub const ADAPTOR_FULL_LISTING_SCHEDULE: &str = "adaptor.fullListingSchedule";
pub const ADAPTOR_INCREMENTAL_POLL_PERIOD_SECS: &str = "adaptor.incrementalPollPeriodSecs";
pub const ADAPTOR_DOC_CONTENT_TIMEOUT_SECS: &str = "adaptor.docContentTimeoutSecs";
pub const TRANSFORM_PIPELINE: &str = "transform.pipeline";
pub const TRANSFORM_MAX_DOCUMENT_BYTES: &str = "transform.maxDocumentBytes";
pub const TRANSFORM_REQUIRED: &str = "transform.required";

/// Placeholder raw value asking for the effective value to be derived.
pub const GENERATE: &str = "GENERATE";

pub const DEFAULT_SERVER_PORT: u16 = 5678;
pub const DEFAULT_DASHBOARD_PORT: u16 = 5679;
pub const DEFAULT_DOC_ID_PATH: &str = "/doc/";
pub const DEFAULT_MAX_WORKER_THREADS: usize = 16;
/// Roughly one second of backlog at 16 workers and 100 ms per request.
pub const DEFAULT_QUEUE_CAPACITY: usize = 160;
pub const DEFAULT_FEED_MAX_URLS: usize = 5000;
/// 3:00 AM every day.
pub const DEFAULT_FULL_LISTING_SCHEDULE: &str = "0 3 * * *";
pub const DEFAULT_INCREMENTAL_POLL_PERIOD_SECS: u64 = 15 * 60;
pub const DEFAULT_DOC_CONTENT_TIMEOUT_SECS: u64 = 180;
pub const DEFAULT_TRANSFORM_MAX_DOCUMENT_BYTES: usize = 1024 * 1024;

/// Schema holding every key the service itself understands.
pub fn builtin_schema() -> KeySchema {
    let mut schema = KeySchema::new();

    schema.declare(SERVER_HOSTNAME, local_hostname().as_deref());
    schema.declare(SERVER_PORT, Some(&DEFAULT_SERVER_PORT.to_string()));
    schema.declare_computed(SERVER_REVERSE_PROXY_PORT, GENERATE, compute_reverse_proxy_port);
    schema.declare_computed(
        SERVER_REVERSE_PROXY_PROTOCOL,
        GENERATE,
        compute_reverse_proxy_protocol,
    );
    schema.declare(SERVER_DASHBOARD_PORT, Some(&DEFAULT_DASHBOARD_PORT.to_string()));
    schema.declare(SERVER_DOC_ID_PATH, Some(DEFAULT_DOC_ID_PATH));
    schema.declare(SERVER_FULL_ACCESS_HOSTS, Some(""));
    schema.declare(SERVER_SECURE, Some("false"));
    schema.declare(SERVER_KEY_ALIAS, Some("adaptor"));
    schema.declare(
        SERVER_MAX_WORKER_THREADS,
        Some(&DEFAULT_MAX_WORKER_THREADS.to_string()),
    );
    schema.declare(SERVER_QUEUE_CAPACITY, Some(&DEFAULT_QUEUE_CAPACITY.to_string()));
    schema.declare(SERVER_USE_COMPRESSION, Some("true"));
    schema.declare(GSA_HOSTNAME, None);
    schema.declare(GSA_CHARACTER_ENCODING, Some("UTF-8"));
    schema.declare(DOC_ID_IS_URL, Some("false"));
    schema.declare_computed(FEED_NAME, GENERATE, compute_feed_name);
    schema.declare(FEED_MAX_URLS, Some(&DEFAULT_FEED_MAX_URLS.to_string()));
    schema.declare(ADAPTOR_PUSH_DOC_IDS_ON_STARTUP, Some("true"));
    schema.declare(ADAPTOR_FULL_LISTING_SCHEDULE, Some(DEFAULT_FULL_LISTING_SCHEDULE));
    schema.declare(
        ADAPTOR_INCREMENTAL_POLL_PERIOD_SECS,
        Some(&DEFAULT_INCREMENTAL_POLL_PERIOD_SECS.to_string()),
    );
    schema.declare(
        ADAPTOR_DOC_CONTENT_TIMEOUT_SECS,
        Some(&DEFAULT_DOC_CONTENT_TIMEOUT_SECS.to_string()),
    );
    schema.declare(TRANSFORM_PIPELINE, Some(""));
    schema.declare(
        TRANSFORM_MAX_DOCUMENT_BYTES,
        Some(&DEFAULT_TRANSFORM_MAX_DOCUMENT_BYTES.to_string()),
    );
    schema.declare(TRANSFORM_REQUIRED, Some("false"));

    schema
}

fn compute_reverse_proxy_port(config: &ConfigSnapshot, raw: &str) -> Result<String> {
    if raw == GENERATE {
        config.value(SERVER_PORT)
    } else {
        Ok(raw.to_string())
    }
}

fn compute_reverse_proxy_protocol(config: &ConfigSnapshot, raw: &str) -> Result<String> {
    if raw == GENERATE {
        Ok(if config.server_secure()? { "https" } else { "http" }.to_string())
    } else {
        Ok(raw.to_string())
    }
}

fn compute_feed_name(config: &ConfigSnapshot, raw: &str) -> Result<String> {
    if raw == GENERATE {
        Ok(format!(
            "adaptor_{}_{}",
            config.value(SERVER_HOSTNAME)?.replace('.', "-"),
            config.value(SERVER_PORT)?
        ))
    } else {
        Ok(raw.to_string())
    }
}

/// Lower-cased host name of this machine, if it can be determined.
fn local_hostname() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_lowercase())
        .filter(|name| !name.is_empty())
}

impl ConfigSnapshot {
    pub fn server_hostname(&self) -> Result<String> {
        self.value(SERVER_HOSTNAME)
    }

    pub fn server_port(&self) -> Result<u16> {
        self.parse_value(SERVER_PORT)
    }

    pub fn dashboard_port(&self) -> Result<u16> {
        self.parse_value(SERVER_DASHBOARD_PORT)
    }

    pub fn reverse_proxy_port(&self) -> Result<u16> {
        self.parse_value(SERVER_REVERSE_PROXY_PORT)
    }

    pub fn reverse_proxy_protocol(&self) -> Result<String> {
        self.value(SERVER_REVERSE_PROXY_PROTOCOL)
    }

    /// Path prefix of the document endpoint; always begins and ends with `/`.
    pub fn doc_id_path(&self) -> Result<String> {
        let path = self.value(SERVER_DOC_ID_PATH)?;
        if !path.starts_with('/') || !path.ends_with('/') {
            return Err(Error::config(format!(
                "{SERVER_DOC_ID_PATH} must start and end with '/', got '{path}'"
            )));
        }
        Ok(path)
    }

    pub fn full_access_hosts(&self) -> Result<Vec<String>> {
        Ok(self
            .value(SERVER_FULL_ACCESS_HOSTS)?
            .split(',')
            .map(str::trim)
            .filter(|host| !host.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub fn server_secure(&self) -> Result<bool> {
        self.bool_value(SERVER_SECURE)
    }

    pub fn max_worker_threads(&self) -> Result<usize> {
        let workers: usize = self.parse_value(SERVER_MAX_WORKER_THREADS)?;
        if workers == 0 {
            return Err(Error::config(format!("{SERVER_MAX_WORKER_THREADS} must be positive")));
        }
        Ok(workers)
    }

    pub fn queue_capacity(&self) -> Result<usize> {
        self.parse_value(SERVER_QUEUE_CAPACITY)
    }

    pub fn use_compression(&self) -> Result<bool> {
        self.bool_value(SERVER_USE_COMPRESSION)
    }

    pub fn gsa_hostname(&self) -> Result<String> {
        self.value(GSA_HOSTNAME)
    }

    pub fn gsa_character_encoding(&self) -> Result<String> {
        self.value(GSA_CHARACTER_ENCODING)
    }

    pub fn doc_id_is_url(&self) -> Result<bool> {
        self.bool_value(DOC_ID_IS_URL)
    }

    pub fn feed_name(&self) -> Result<String> {
        self.value(FEED_NAME)
    }

    pub fn feed_max_urls(&self) -> Result<usize> {
        let max: usize = self.parse_value(FEED_MAX_URLS)?;
        if max == 0 {
            return Err(Error::config(format!("{FEED_MAX_URLS} must be positive")));
        }
        Ok(max)
    }

    pub fn push_doc_ids_on_startup(&self) -> Result<bool> {
        self.bool_value(ADAPTOR_PUSH_DOC_IDS_ON_STARTUP)
    }

    pub fn full_listing_schedule(&self) -> Result<String> {
        self.value(ADAPTOR_FULL_LISTING_SCHEDULE)
    }

    pub fn incremental_poll_period(&self) -> Result<Duration> {
        let secs: u64 = self.parse_value(ADAPTOR_INCREMENTAL_POLL_PERIOD_SECS)?;
        if secs == 0 {
            return Err(Error::config(format!(
                "{ADAPTOR_INCREMENTAL_POLL_PERIOD_SECS} must be positive"
            )));
        }
        Ok(Duration::from_secs(secs))
    }

    pub fn doc_content_timeout(&self) -> Result<Duration> {
        Ok(Duration::from_secs(
            self.parse_value(ADAPTOR_DOC_CONTENT_TIMEOUT_SECS)?,
        ))
    }

    pub fn transform_max_document_bytes(&self) -> Result<usize> {
        self.parse_value(TRANSFORM_MAX_DOCUMENT_BYTES)
    }

    pub fn transform_required(&self) -> Result<bool> {
        self.bool_value(TRANSFORM_REQUIRED)
    }
}
