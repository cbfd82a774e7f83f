//! Configuration modification events.
//!
//! An event is fired after a reloaded configuration has been validated and
//! published. Listeners run synchronously on the thread that performed the
//! reload, in registration order.

use std::collections::BTreeSet;
use std::sync::Arc;

use super::snapshot::ConfigSnapshot;

/// Describes one published configuration change.
#[derive(Debug, Clone)]
pub struct ConfigModificationEvent {
    old: Arc<ConfigSnapshot>,
    new: Arc<ConfigSnapshot>,
    modified_keys: BTreeSet<String>,
}

impl ConfigModificationEvent {
    pub fn new(
        old: Arc<ConfigSnapshot>,
        new: Arc<ConfigSnapshot>,
        modified_keys: BTreeSet<String>,
    ) -> Self {
        Self {
            old,
            new,
            modified_keys,
        }
    }

    /// Snapshot that was current before the change.
    pub fn old_config(&self) -> &Arc<ConfigSnapshot> {
        &self.old
    }

    /// Snapshot published by the change.
    pub fn new_config(&self) -> &Arc<ConfigSnapshot> {
        &self.new
    }

    /// Keys whose raw effective value was added, removed or changed.
    pub fn modified_keys(&self) -> &BTreeSet<String> {
        &self.modified_keys
    }

    /// Human readable description for logging.
    pub fn description(&self) -> String {
        let keys: Vec<&str> = self.modified_keys.iter().map(String::as_str).collect();
        format!(
            "Configuration generation {} -> {} changed keys [{}]",
            self.old.generation(),
            self.new.generation(),
            keys.join(", ")
        )
    }
}

/// Observer of configuration changes.
///
/// Returned errors and panics are logged by the store and do not prevent
/// other listeners from running.
pub trait ConfigModificationListener: Send + Sync {
    fn config_modified(&self, event: &ConfigModificationEvent) -> crate::Result<()>;
}

/// Check applied to a candidate configuration before it is published.
///
/// A failing validator rejects the whole reload; the current snapshot stays
/// in place and no event fires.
pub trait ConfigValidator: Send + Sync {
    fn validate(&self, candidate: &ConfigSnapshot) -> crate::Result<()>;
}

/// Identifier returned when a listener or validator is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);
