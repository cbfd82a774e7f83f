//! Service configuration.
//!
//! Configuration is plain `key=value` text layered over built-in defaults.
//! The [`ConfigStore`] publishes immutable snapshots and notifies listeners
//! with the set of keys that changed on each reload.

pub mod events;
pub mod keys;
pub mod properties;
pub mod snapshot;
pub mod store;
pub mod watcher;

pub use events::{
    ConfigModificationEvent, ConfigModificationListener, ConfigValidator, ListenerId,
};
pub use snapshot::{ConfigSnapshot, KeySchema, ValueComputer};
pub use store::ConfigStore;
pub use watcher::{DEFAULT_WATCH_INTERVAL, spawn_config_watcher};
