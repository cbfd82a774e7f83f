//! Immutable configuration snapshots.
//!
//! A snapshot combines three layers. Reading a raw value checks the runtime
//! layer first, then the file layer, then the built-in defaults. Keys with a
//! registered [`ValueComputer`] derive their effective value from the raw
//! value on every read.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::{Error, Result};

/// Computes the effective value of a key from its raw value.
pub type ValueComputer = fn(&ConfigSnapshot, &str) -> Result<String>;

/// Declared keys, their defaults and computed-value functions.
#[derive(Clone, Default)]
pub struct KeySchema {
    defaults: BTreeMap<String, String>,
    no_default: BTreeSet<String>,
    computers: HashMap<String, ValueComputer>,
}

impl KeySchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.defaults.contains_key(key) || self.no_default.contains(key)
    }

    /// Declare a key. `None` means the user must supply a value.
    pub fn add_key(&mut self, key: &str, default: Option<&str>) -> Result<()> {
        if self.contains(key) {
            return Err(Error::config(format!("Key already added: {key}")));
        }
        self.declare(key, default);
        Ok(())
    }

    /// Declare a key whose effective value is produced by `computer`.
    pub fn add_computed_key(
        &mut self,
        key: &str,
        default: Option<&str>,
        computer: ValueComputer,
    ) -> Result<()> {
        self.add_key(key, default)?;
        self.computers.insert(key.to_string(), computer);
        Ok(())
    }

    /// Replace the default of a key, declaring it if unknown.
    pub fn override_key(&mut self, key: &str, default: Option<&str>) {
        if !self.contains(key) {
            tracing::warn!(key = %key, "Overriding unknown configuration key");
        }
        self.defaults.remove(key);
        self.no_default.remove(key);
        self.declare(key, default);
    }

    pub(crate) fn declare(&mut self, key: &str, default: Option<&str>) {
        match default {
            Some(value) => {
                self.defaults.insert(key.to_string(), value.to_string());
            }
            None => {
                self.no_default.insert(key.to_string());
            }
        }
    }

    pub(crate) fn declare_computed(&mut self, key: &str, default: &str, computer: ValueComputer) {
        self.declare(key, Some(default));
        self.computers.insert(key.to_string(), computer);
    }

    pub fn defaults(&self) -> &BTreeMap<String, String> {
        &self.defaults
    }

    pub fn required_keys(&self) -> &BTreeSet<String> {
        &self.no_default
    }
}

impl fmt::Debug for KeySchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySchema")
            .field("defaults", &self.defaults)
            .field("no_default", &self.no_default)
            .field("computed", &self.computers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Point-in-time view of the whole configuration.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    generation: u64,
    schema: Arc<KeySchema>,
    file: BTreeMap<String, String>,
    runtime: BTreeMap<String, String>,
}

impl ConfigSnapshot {
    pub(crate) fn new(
        generation: u64,
        schema: Arc<KeySchema>,
        file: BTreeMap<String, String>,
        runtime: BTreeMap<String, String>,
    ) -> Self {
        Self {
            generation,
            schema,
            file,
            runtime,
        }
    }

    /// Monotonically increasing publication counter.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn schema(&self) -> &Arc<KeySchema> {
        &self.schema
    }

    pub(crate) fn file_layer(&self) -> &BTreeMap<String, String> {
        &self.file
    }

    pub(crate) fn runtime_layer(&self) -> &BTreeMap<String, String> {
        &self.runtime
    }

    /// Raw value as written, without computation.
    pub fn raw_value(&self, key: &str) -> Option<&str> {
        self.runtime
            .get(key)
            .or_else(|| self.file.get(key))
            .or_else(|| self.schema.defaults.get(key))
            .map(String::as_str)
    }

    /// Raw value, failing when the key has no value in any layer.
    pub fn get_raw_value(&self, key: &str) -> Result<&str> {
        self.raw_value(key)
            .ok_or_else(|| Error::config(format!("You must set configuration key '{key}'.")))
    }

    /// Effective value, applying the key's computer if one is registered.
    pub fn value(&self, key: &str) -> Result<String> {
        let raw = self.get_raw_value(key)?;
        match self.schema.computers.get(key) {
            Some(compute) => compute(self, raw),
            None => Ok(raw.to_string()),
        }
    }

    /// Effective value parsed into `T`.
    pub fn parse_value<T>(&self, key: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let value = self.value(key)?;
        value
            .trim()
            .parse()
            .map_err(|e| Error::config(format!("Invalid value '{value}' for '{key}': {e}")))
    }

    /// Effective value read as a boolean. Anything other than a
    /// case-insensitive `true` is false.
    pub fn bool_value(&self, key: &str) -> Result<bool> {
        Ok(self.value(key)?.trim().eq_ignore_ascii_case("true"))
    }

    /// Every key that has a raw value.
    pub fn keys(&self) -> BTreeSet<String> {
        self.schema
            .defaults
            .keys()
            .chain(self.file.keys())
            .chain(self.runtime.keys())
            .cloned()
            .collect()
    }

    /// Merged raw values of all layers.
    pub fn raw_values(&self) -> BTreeMap<String, String> {
        let mut merged = self.schema.defaults.clone();
        merged.extend(self.file.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged.extend(self.runtime.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    /// Raw values of keys starting with `prefix`, with the prefix removed.
    pub fn values_with_prefix(&self, prefix: &str) -> BTreeMap<String, String> {
        self.raw_values()
            .into_iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(prefix)
                    .map(|stripped| (stripped.to_string(), value.clone()))
            })
            .collect()
    }

    /// Reads a list of named sub-configurations.
    ///
    /// `key=a,b` with `key.a.x=1` produces `[{name: a, x: 1}, {name: b}]`.
    pub fn list_of_configs(&self, key: &str) -> Result<Vec<BTreeMap<String, String>>> {
        let value = self.value(key)?;
        if value.trim().is_empty() {
            return Ok(Vec::new());
        }

        value
            .split(',')
            .map(|item| {
                let item = item.trim();
                if item.is_empty() {
                    return Err(Error::config(format!("Invalid format for '{key}': {value}")));
                }
                let mut params = self.values_with_prefix(&format!("{key}.{item}."));
                params.insert("name".to_string(), item.to_string());
                Ok(params)
            })
            .collect()
    }

    /// Fails if any key without a default has no value.
    pub fn validate(&self) -> Result<()> {
        let unset: Vec<&str> = self
            .schema
            .no_default
            .iter()
            .filter(|key| self.raw_value(key).is_none())
            .map(String::as_str)
            .collect();

        if unset.is_empty() {
            Ok(())
        } else {
            Err(Error::config(format!(
                "Missing configuration values: [{}]",
                unset.join(", ")
            )))
        }
    }

    /// Keys whose raw effective value differs between the two snapshots.
    pub fn differences(&self, other: &ConfigSnapshot) -> BTreeSet<String> {
        let before = self.raw_values();
        let after = other.raw_values();

        before
            .keys()
            .chain(after.keys())
            .filter(|key| before.get(*key) != after.get(*key))
            .cloned()
            .collect()
    }
}
