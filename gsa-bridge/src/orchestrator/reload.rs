//! Decides how a configuration change is applied to the running service.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::Result;
use crate::config::keys::ADAPTOR_FULL_LISTING_SCHEDULE;
use crate::config::{
    ConfigModificationEvent, ConfigModificationListener, ConfigSnapshot, ConfigValidator,
};
use crate::scheduler::CronSchedule;
use crate::transform::{TransformPipeline, TransformRegistry};

/// Keys that can change without restarting the service.
pub const SAFE_KEYS: &[&str] = &[ADAPTOR_FULL_LISTING_SCHEDULE];

/// What the service does about a configuration change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadPlan {
    /// Move the full-listing job to a new schedule.
    Reschedule(String),
    /// Stop and start everything.
    Restart(BTreeSet<String>),
}

impl ReloadPlan {
    /// Plan for the keys changed by `event`.
    pub fn for_event(event: &ConfigModificationEvent) -> Self {
        let keys = event.modified_keys();
        let unsafe_keys: BTreeSet<String> = keys
            .iter()
            .filter(|key| !SAFE_KEYS.contains(&key.as_str()))
            .cloned()
            .collect();

        if !unsafe_keys.is_empty() {
            return Self::Restart(unsafe_keys);
        }
        match event.new_config().full_listing_schedule() {
            Ok(schedule) => Self::Reschedule(schedule),
            Err(_) => Self::Restart(keys.clone()),
        }
    }

    /// Combine with a later plan. A restart reads the latest configuration,
    /// so it absorbs any reschedule.
    pub fn merge(self, later: ReloadPlan) -> ReloadPlan {
        match (self, later) {
            (Self::Restart(mut a), Self::Restart(b)) => {
                a.extend(b);
                Self::Restart(a)
            }
            (Self::Restart(keys), Self::Reschedule(_)) => Self::Restart(keys),
            (Self::Reschedule(_), later) => later,
        }
    }
}

/// Configuration listener forwarding plans to the reload supervisor.
pub struct ReloadListener {
    plans: mpsc::UnboundedSender<ReloadPlan>,
}

impl ReloadListener {
    pub fn new(plans: mpsc::UnboundedSender<ReloadPlan>) -> Self {
        Self { plans }
    }
}

impl ConfigModificationListener for ReloadListener {
    fn config_modified(&self, event: &ConfigModificationEvent) -> Result<()> {
        let plan = ReloadPlan::for_event(event);
        info!(changes = %event.description(), ?plan, "Configuration changed");
        if self.plans.send(plan).is_err() {
            debug!("Reload supervisor gone, ignoring configuration change");
        }
        Ok(())
    }
}

/// Read every value the service needs to start, failing on the first one
/// that does not parse.
pub fn check_service_config(config: &ConfigSnapshot, transforms: &TransformRegistry) -> Result<()> {
    config.validate()?;
    config.server_hostname()?;
    config.server_port()?;
    config.dashboard_port()?;
    config.reverse_proxy_port()?;
    config.reverse_proxy_protocol()?;
    config.doc_id_path()?;
    config.server_secure()?;
    config.max_worker_threads()?;
    config.queue_capacity()?;
    config.use_compression()?;
    config.gsa_hostname()?;
    config.doc_id_is_url()?;
    config.feed_name()?;
    config.feed_max_urls()?;
    config.push_doc_ids_on_startup()?;
    config.incremental_poll_period()?;
    config.doc_content_timeout()?;
    CronSchedule::parse(&config.full_listing_schedule()?)?;
    TransformPipeline::from_config(config, transforms)?;
    Ok(())
}

/// Rejects reloads the running service could not restart with.
pub struct ServiceConfigValidator {
    transforms: Arc<TransformRegistry>,
}

impl ServiceConfigValidator {
    pub fn new(transforms: Arc<TransformRegistry>) -> Self {
        Self { transforms }
    }
}

impl ConfigValidator for ServiceConfigValidator {
    fn validate(&self, candidate: &ConfigSnapshot) -> Result<()> {
        check_service_config(candidate, &self.transforms)
    }
}
