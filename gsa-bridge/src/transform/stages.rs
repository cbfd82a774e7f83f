//! Built-in transform stages.

use std::collections::BTreeMap;

use bytes::Bytes;
use regex::bytes::Regex;

use super::DocumentTransform;
use crate::connector::DocContent;
use crate::{Error, Result};

/// Parameters every stage receives that are not stage options.
const RESERVED_PARAMS: [&str; 2] = ["name", "stage"];

/// Replaces regex matches in the content or in one metadata value.
///
/// Parameters: `pattern` (required), `replacement` (default empty) and
/// `target`, either `content` (default) or `metadata.<key>`.
pub struct RegexReplace {
    pattern: Regex,
    replacement: String,
    metadata_key: Option<String>,
}

impl RegexReplace {
    pub const STAGE: &'static str = "regex-replace";

    pub fn from_params(params: &BTreeMap<String, String>) -> Result<Box<dyn DocumentTransform>> {
        let pattern = params
            .get("pattern")
            .ok_or_else(|| Error::config("missing 'pattern'"))?;
        let pattern =
            Regex::new(pattern).map_err(|e| Error::config(format!("invalid pattern: {e}")))?;

        let metadata_key = match params.get("target").map(String::as_str) {
            None | Some("content") => None,
            Some(target) => match target.strip_prefix("metadata.") {
                Some(key) if !key.is_empty() => Some(key.to_string()),
                _ => return Err(Error::config(format!("invalid target '{target}'"))),
            },
        };

        Ok(Box::new(Self {
            pattern,
            replacement: params.get("replacement").cloned().unwrap_or_default(),
            metadata_key,
        }))
    }
}

impl DocumentTransform for RegexReplace {
    fn transform(&self, doc: &mut DocContent) -> Result<()> {
        let replacement = self.replacement.as_bytes();
        match &self.metadata_key {
            None => {
                let replaced = self.pattern.replace_all(&doc.content, replacement);
                doc.content = Bytes::from(replaced.into_owned());
            }
            Some(key) => {
                if let Some(value) = doc.metadata.get_mut(key) {
                    let replaced = self.pattern.replace_all(value.as_bytes(), replacement);
                    *value = String::from_utf8_lossy(&replaced).into_owned();
                }
            }
        }
        Ok(())
    }
}

/// Sets fixed metadata entries. Every parameter other than `overwrite`
/// becomes an entry; `overwrite=false` keeps values the connector set.
pub struct AddMetadata {
    entries: BTreeMap<String, String>,
    overwrite: bool,
}

impl AddMetadata {
    pub const STAGE: &'static str = "add-metadata";

    pub fn from_params(params: &BTreeMap<String, String>) -> Result<Box<dyn DocumentTransform>> {
        let overwrite = match params.get("overwrite").map(String::as_str) {
            None => true,
            Some(value) => value.eq_ignore_ascii_case("true"),
        };
        let entries = params
            .iter()
            .filter(|(key, _)| !RESERVED_PARAMS.contains(&key.as_str()) && *key != "overwrite")
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok(Box::new(Self { entries, overwrite }))
    }
}

impl DocumentTransform for AddMetadata {
    fn transform(&self, doc: &mut DocContent) -> Result<()> {
        for (key, value) in &self.entries {
            if self.overwrite || !doc.metadata.contains_key(key) {
                doc.metadata.insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }
}
