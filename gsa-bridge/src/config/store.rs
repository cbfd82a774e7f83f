//! Layered configuration store with change detection.
//!
//! The store publishes immutable [`ConfigSnapshot`]s. Mutations are serialized
//! by a writer lock; readers only clone the current `Arc` and never wait on a
//! reload in progress.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::events::{
    ConfigModificationEvent, ConfigModificationListener, ConfigValidator, ListenerId,
};
use super::keys::builtin_schema;
use super::properties;
use super::snapshot::{ConfigSnapshot, KeySchema, ValueComputer};
use crate::panic_hook::payload_message;
use crate::{Error, Result};

/// Backing file bookkeeping, guarded by the writer lock.
#[derive(Debug, Default)]
struct FileState {
    path: Option<PathBuf>,
    modified: Option<SystemTime>,
}

type ListenerList = Vec<(ListenerId, Arc<dyn ConfigModificationListener>)>;
type ValidatorList = Vec<(ListenerId, Arc<dyn ConfigValidator>)>;

/// Thread-safe configuration store.
pub struct ConfigStore {
    current: RwLock<Arc<ConfigSnapshot>>,
    writer: Mutex<FileState>,
    listeners: RwLock<ListenerList>,
    validators: RwLock<ValidatorList>,
    next_listener_id: AtomicU64,
}

impl ConfigStore {
    /// Create a store with the built-in keys and no file loaded.
    pub fn new() -> Self {
        Self::with_schema(builtin_schema())
    }

    /// Create a store with a custom key schema.
    pub fn with_schema(schema: KeySchema) -> Self {
        let initial = ConfigSnapshot::new(0, Arc::new(schema), BTreeMap::new(), BTreeMap::new());
        Self {
            current: RwLock::new(Arc::new(initial)),
            writer: Mutex::new(FileState::default()),
            listeners: RwLock::new(Vec::new()),
            validators: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.current.read().clone()
    }

    /// Effective value of `key` in the current snapshot.
    pub fn value(&self, key: &str) -> Result<String> {
        self.snapshot().value(key)
    }

    /// Path of the last file passed to [`load_file`](Self::load_file).
    pub fn config_file(&self) -> Option<PathBuf> {
        self.writer.lock().path.clone()
    }

    /// Validate the current snapshot, including registered validators.
    pub fn validate(&self) -> Result<()> {
        let current = self.snapshot();
        current.validate()?;
        self.run_validators(&current)
    }

    /// Declare a new key. Intended to be called before the first load.
    pub fn add_key(&self, key: &str, default: Option<&str>) -> Result<()> {
        self.update_schema(|schema| schema.add_key(key, default))
    }

    /// Declare a new key with a computed effective value.
    pub fn add_computed_key(
        &self,
        key: &str,
        default: Option<&str>,
        computer: ValueComputer,
    ) -> Result<()> {
        self.update_schema(|schema| schema.add_computed_key(key, default, computer))
    }

    /// Change the default of an existing key.
    pub fn override_key(&self, key: &str, default: Option<&str>) {
        // override_key never fails
        let _ = self.update_schema(|schema| {
            schema.override_key(key, default);
            Ok(())
        });
    }

    fn update_schema(&self, change: impl FnOnce(&mut KeySchema) -> Result<()>) -> Result<()> {
        let _writer = self.writer.lock();
        let old = self.snapshot();

        let mut schema = KeySchema::clone(old.schema());
        change(&mut schema)?;

        self.publish(ConfigSnapshot::new(
            old.generation() + 1,
            Arc::new(schema),
            old.file_layer().clone(),
            old.runtime_layer().clone(),
        ));
        Ok(())
    }

    /// Set a value in the runtime layer.
    ///
    /// Runtime values take precedence over file and default values and
    /// survive every reload. No modification event is fired.
    pub fn set_value(&self, key: &str, value: impl Into<String>) {
        let _writer = self.writer.lock();
        let old = self.snapshot();

        let mut runtime = old.runtime_layer().clone();
        let value = value.into();
        debug!(key = %key, value = %value, "Setting runtime configuration value");
        runtime.insert(key.to_string(), value);

        self.publish(ConfigSnapshot::new(
            old.generation() + 1,
            old.schema().clone(),
            old.file_layer().clone(),
            runtime,
        ));
    }

    /// Load configuration from a file, replacing the previous file layer.
    ///
    /// Returns whether a changed configuration was published.
    pub async fn load_file(&self, path: impl AsRef<Path>) -> Result<bool> {
        let path = path.as_ref().to_path_buf();
        let modified = tokio::fs::metadata(&path)
            .await
            .ok()
            .and_then(|meta| meta.modified().ok());
        {
            let mut state = self.writer.lock();
            state.path = Some(path.clone());
            state.modified = modified;
        }

        let source = tokio::fs::read_to_string(&path).await?;
        let changed = self.load_str(&source)?;
        if changed {
            info!(path = %path.display(), "New configuration file loaded");
        }
        Ok(changed)
    }

    /// Load configuration text, replacing the previous file layer.
    ///
    /// When no raw effective value differs nothing is published and no event
    /// fires. Otherwise the candidate is validated first, so an invalid file
    /// leaves the current snapshot untouched.
    pub fn load_str(&self, source: &str) -> Result<bool> {
        let file = properties::parse(source)?;

        let event = {
            let _writer = self.writer.lock();
            let old = self.snapshot();
            let candidate = ConfigSnapshot::new(
                old.generation() + 1,
                old.schema().clone(),
                file,
                old.runtime_layer().clone(),
            );

            let modified_keys = old.differences(&candidate);
            if modified_keys.is_empty() {
                info!("No configuration changes found");
                return Ok(false);
            }

            candidate.validate()?;
            self.run_validators(&candidate)?;

            let candidate = Arc::new(candidate);
            *self.current.write() = candidate.clone();
            ConfigModificationEvent::new(old, candidate, modified_keys)
        };

        debug!("{}", event.description());
        self.fire(&event);
        Ok(true)
    }

    /// Reload the backing file if its modification time changed.
    ///
    /// Returns whether the file was reloaded. Failures are logged and
    /// reported as `false`.
    pub async fn ensure_latest_config_loaded(&self) -> bool {
        let (path, last_modified) = {
            let state = self.writer.lock();
            match &state.path {
                Some(path) => (path.clone(), state.modified),
                None => return false,
            }
        };

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return false,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Configuration file not accessible");
                return false;
            }
        };

        let modified = match metadata.modified() {
            Ok(time) if time != SystemTime::UNIX_EPOCH => time,
            _ => return false,
        };
        if Some(modified) == last_modified {
            return false;
        }

        info!(path = %path.display(), "Noticed modified configuration file");
        match self.load_file(&path).await {
            Ok(_) => true,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to reload configuration file");
                false
            }
        }
    }

    /// Register a modification listener.
    pub fn add_listener(&self, listener: Arc<dyn ConfigModificationListener>) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Register a check every reloaded configuration must pass before it is
    /// published.
    pub fn add_validator(&self, validator: Arc<dyn ConfigValidator>) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.validators.write().push((id, validator));
        id
    }

    /// Remove a validator. Returns whether it was registered.
    pub fn remove_validator(&self, id: ListenerId) -> bool {
        let mut validators = self.validators.write();
        let before = validators.len();
        validators.retain(|(existing, _)| *existing != id);
        validators.len() != before
    }

    /// Every rejection is reported as a configuration error.
    fn run_validators(&self, candidate: &ConfigSnapshot) -> Result<()> {
        let validators: Vec<Arc<dyn ConfigValidator>> = self
            .validators
            .read()
            .iter()
            .map(|(_, validator)| validator.clone())
            .collect();

        for validator in validators {
            validator.validate(candidate).map_err(|e| match e {
                Error::Configuration(_) => e,
                other => Error::config(other.to_string()),
            })?;
        }
        Ok(())
    }

    fn publish(&self, snapshot: ConfigSnapshot) {
        *self.current.write() = Arc::new(snapshot);
    }

    fn fire(&self, event: &ConfigModificationEvent) {
        let listeners: Vec<Arc<dyn ConfigModificationListener>> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener.config_modified(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(error = %e, "Configuration listener failed");
                }
                Err(payload) => {
                    let message = payload_message(payload.as_ref())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!(panic = %message, "Configuration listener panicked");
                }
            }
        }
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}
