//! Health reporting shown on the dashboard.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use crate::push::{FullPushStatus, Journal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Normal,
    Warning,
    Error,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// A named component able to report its health.
pub trait StatusSource: Send + Sync {
    fn name(&self) -> &str;
    fn retrieve_status(&self) -> Status;
}

/// Status of one source, as reported by [`StatusRegistry::collect`].
#[derive(Debug, Clone, Serialize)]
pub struct NamedStatus {
    pub source: String,
    #[serde(flatten)]
    pub status: Status,
}

/// Registered status sources, keyed by name.
#[derive(Default)]
pub struct StatusRegistry {
    sources: DashMap<String, Arc<dyn StatusSource>>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source, replacing any source with the same name.
    pub fn add(&self, source: Arc<dyn StatusSource>) {
        self.sources.insert(source.name().to_string(), source);
    }

    pub fn remove(&self, name: &str) -> bool {
        self.sources.remove(name).is_some()
    }

    /// Current status of every source, sorted by name.
    pub fn collect(&self) -> Vec<NamedStatus> {
        let mut statuses: Vec<NamedStatus> = self
            .sources
            .iter()
            .map(|entry| NamedStatus {
                source: entry.key().clone(),
                status: entry.value().retrieve_status(),
            })
            .collect();
        statuses.sort_by(|a, b| a.source.cmp(&b.source));
        statuses
    }
}

/// Reports the outcome of the most recent full push.
pub struct LastPushStatusSource {
    journal: Arc<Journal>,
}

impl LastPushStatusSource {
    pub const NAME: &'static str = "last-full-push";

    pub fn new(journal: Arc<Journal>) -> Self {
        Self { journal }
    }
}

impl StatusSource for LastPushStatusSource {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn retrieve_status(&self) -> Status {
        match self.journal.last_full_push() {
            None if self.journal.is_full_push_in_progress() => {
                Status::new(StatusCode::Unavailable, "First full push in progress")
            }
            None => Status::new(StatusCode::Unavailable, "No full push has run yet"),
            Some(outcome) => {
                let when = outcome.finished_at.to_rfc3339();
                match outcome.status {
                    FullPushStatus::Success => Status::new(
                        StatusCode::Normal,
                        format!("Pushed {} ids, finished {when}", outcome.pushed_ids),
                    ),
                    FullPushStatus::Interrupted => Status::new(
                        StatusCode::Warning,
                        format!("Interrupted after {} ids at {when}", outcome.pushed_ids),
                    ),
                    FullPushStatus::Failure => {
                        Status::new(StatusCode::Error, format!("Failed at {when}"))
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str, StatusCode);

    impl StatusSource for Fixed {
        fn name(&self) -> &str {
            self.0
        }

        fn retrieve_status(&self) -> Status {
            Status::new(self.1, "fixed")
        }
    }

    #[test]
    fn test_registry_add_remove_and_sorting() {
        let registry = StatusRegistry::new();
        registry.add(Arc::new(Fixed("zeta", StatusCode::Normal)));
        registry.add(Arc::new(Fixed("alpha", StatusCode::Warning)));

        let names: Vec<String> = registry.collect().into_iter().map(|s| s.source).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);

        assert!(registry.remove("alpha"));
        assert!(!registry.remove("alpha"));
        assert_eq!(registry.collect().len(), 1);
    }

    #[test]
    fn test_last_push_status() {
        let journal = Arc::new(Journal::new());
        let source = LastPushStatusSource::new(journal.clone());
        assert_eq!(source.retrieve_status().code, StatusCode::Unavailable);

        journal.record_full_push_started();
        journal.record_full_push_finished(FullPushStatus::Success);
        assert_eq!(source.retrieve_status().code, StatusCode::Normal);

        journal.record_full_push_started();
        journal.record_full_push_finished(FullPushStatus::Failure);
        assert_eq!(source.retrieve_status().code, StatusCode::Error);
    }
}
