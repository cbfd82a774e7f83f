//! Document transform pipeline.
//!
//! `transform.pipeline` lists stage names separated by commas. Parameters of a
//! stage live under `transform.pipeline.<name>.`; the `stage` parameter picks
//! the registered constructor and defaults to the stage name.

mod stages;

pub use stages::{AddMetadata, RegexReplace};

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, warn};

use crate::config::ConfigSnapshot;
use crate::config::keys::TRANSFORM_PIPELINE;
use crate::connector::DocContent;
use crate::{Error, Result};

/// One step of the pipeline.
pub trait DocumentTransform: Send + Sync {
    fn transform(&self, doc: &mut DocContent) -> Result<()>;
}

/// Builds a stage from its parameters.
pub type StageConstructor = fn(&BTreeMap<String, String>) -> Result<Box<dyn DocumentTransform>>;

/// Stage constructors by name.
#[derive(Clone, Default)]
pub struct TransformRegistry {
    constructors: HashMap<String, StageConstructor>,
}

impl TransformRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the `regex-replace` and `add-metadata` stages.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(RegexReplace::STAGE, RegexReplace::from_params);
        registry.register(AddMetadata::STAGE, AddMetadata::from_params);
        registry
    }

    /// Register a constructor. Returns `true` if it replaced an existing one.
    pub fn register(&mut self, name: impl Into<String>, constructor: StageConstructor) -> bool {
        self.constructors.insert(name.into(), constructor).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn build(&self, params: &BTreeMap<String, String>) -> Result<Box<dyn DocumentTransform>> {
        let name = params.get("name").map(String::as_str).unwrap_or_default();
        let stage = params.get("stage").map(String::as_str).unwrap_or(name);
        let constructor = self.constructors.get(stage).ok_or_else(|| {
            Error::config(format!("Unknown transform stage '{stage}' for '{name}'"))
        })?;
        constructor(params)
            .map_err(|e| Error::config(format!("Could not create transform '{name}': {e}")))
    }
}

/// Ordered transform stages with the size policy applied before them.
pub struct TransformPipeline {
    stages: Vec<(String, Box<dyn DocumentTransform>)>,
    max_document_bytes: usize,
    required: bool,
}

impl TransformPipeline {
    /// Build the pipeline configured in `config`. `None` when no stage is
    /// configured.
    pub fn from_config(
        config: &ConfigSnapshot,
        registry: &TransformRegistry,
    ) -> Result<Option<Self>> {
        let specs = config.list_of_configs(TRANSFORM_PIPELINE)?;
        if specs.is_empty() {
            return Ok(None);
        }

        let stages = specs
            .iter()
            .map(|params| {
                let name = params.get("name").cloned().unwrap_or_default();
                registry.build(params).map(|stage| (name, stage))
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(
            stages = ?stages.iter().map(|(name, _)| name.as_str()).collect::<Vec<_>>(),
            "Transform pipeline created"
        );

        Ok(Some(Self {
            stages,
            max_document_bytes: config.transform_max_document_bytes()?,
            required: config.transform_required()?,
        }))
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Run every stage over `doc`.
    ///
    /// Documents above the size limit pass through untouched, or fail when
    /// transforms are required. A failing stage leaves `doc` unchanged.
    pub fn apply(&self, doc: &mut DocContent) -> Result<()> {
        if doc.content.len() > self.max_document_bytes {
            if self.required {
                return Err(Error::transform(format!(
                    "Document of {} bytes exceeds the {} byte transform limit",
                    doc.content.len(),
                    self.max_document_bytes
                )));
            }
            warn!(
                size = doc.content.len(),
                limit = self.max_document_bytes,
                "Document too large to transform, serving it unchanged"
            );
            return Ok(());
        }

        let mut working = doc.clone();
        for (name, stage) in &self.stages {
            stage
                .transform(&mut working)
                .map_err(|e| Error::transform(format!("stage '{name}' failed: {e}")))?;
        }
        *doc = working;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;
    use crate::config::keys::{GSA_HOSTNAME, SERVER_HOSTNAME};

    fn snapshot(extra: &str) -> std::sync::Arc<ConfigSnapshot> {
        let store = ConfigStore::new();
        store
            .load_str(&format!("{GSA_HOSTNAME}=gsa\n{SERVER_HOSTNAME}=bridge\n{extra}"))
            .unwrap();
        store.snapshot()
    }

    struct Fails;

    impl DocumentTransform for Fails {
        fn transform(&self, doc: &mut DocContent) -> Result<()> {
            doc.metadata.insert("touched".into(), "yes".into());
            Err(Error::transform("boom"))
        }
    }

    fn fails(_params: &BTreeMap<String, String>) -> Result<Box<dyn DocumentTransform>> {
        Ok(Box::new(Fails))
    }

    #[test]
    fn test_empty_pipeline_is_none() {
        let config = snapshot("");
        let pipeline = TransformPipeline::from_config(&config, &TransformRegistry::with_builtins());
        assert!(pipeline.unwrap().is_none());
    }

    #[test]
    fn test_stages_run_in_order() {
        let config = snapshot(
            "transform.pipeline=strip, tag\n\
             transform.pipeline.strip.stage=regex-replace\n\
             transform.pipeline.strip.pattern=secret\n\
             transform.pipeline.strip.replacement=*****\n\
             transform.pipeline.tag.stage=add-metadata\n\
             transform.pipeline.tag.department=finance\n",
        );
        let pipeline = TransformPipeline::from_config(&config, &TransformRegistry::with_builtins())
            .unwrap()
            .unwrap();
        assert_eq!(pipeline.stage_names(), vec!["strip", "tag"]);

        let mut doc = DocContent::new("the secret plan");
        pipeline.apply(&mut doc).unwrap();
        assert_eq!(&doc.content[..], b"the ***** plan");
        assert_eq!(doc.metadata["department"], "finance");
    }

    #[test]
    fn test_stage_defaults_to_name() {
        let config = snapshot(
            "transform.pipeline=add-metadata\ntransform.pipeline.add-metadata.owner=ops\n",
        );
        let pipeline = TransformPipeline::from_config(&config, &TransformRegistry::with_builtins())
            .unwrap()
            .unwrap();

        let mut doc = DocContent::new("x");
        pipeline.apply(&mut doc).unwrap();
        assert_eq!(doc.metadata["owner"], "ops");
    }

    #[test]
    fn test_unknown_stage_is_config_error() {
        let config = snapshot("transform.pipeline=missing\n");
        let result = TransformPipeline::from_config(&config, &TransformRegistry::with_builtins());
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_oversized_documents() {
        let registry = TransformRegistry::with_builtins();
        let base = "transform.pipeline=tag\n\
                    transform.pipeline.tag.stage=add-metadata\n\
                    transform.pipeline.tag.k=v\n\
                    transform.maxDocumentBytes=4\n";

        let lenient = TransformPipeline::from_config(&snapshot(base), &registry)
            .unwrap()
            .unwrap();
        let mut doc = DocContent::new("too long");
        lenient.apply(&mut doc).unwrap();
        assert!(doc.metadata.is_empty());

        let strict = TransformPipeline::from_config(
            &snapshot(&format!("{base}transform.required=true\n")),
            &registry,
        )
        .unwrap()
        .unwrap();
        let mut doc = DocContent::new("too long");
        assert!(matches!(strict.apply(&mut doc), Err(Error::Transform(_))));
    }

    #[test]
    fn test_failed_stage_leaves_document_unchanged() {
        let mut registry = TransformRegistry::new();
        assert!(!registry.register("fails", fails));
        let config = snapshot("transform.pipeline=fails\n");
        let pipeline = TransformPipeline::from_config(&config, &registry)
            .unwrap()
            .unwrap();

        let mut doc = DocContent::new("body");
        assert!(pipeline.apply(&mut doc).is_err());
        assert!(doc.metadata.is_empty());
    }
}
