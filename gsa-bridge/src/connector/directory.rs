//! Connector serving the files below a local directory.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{Connector, ConnectorContext, DocContent, DocRequest};
use crate::push::{DocId, DocIdPusher};
use crate::{Error, Result};

/// Exposes every regular file below `root`; the id is the relative path.
pub struct DirectoryConnector {
    root: PathBuf,
    last_poll: Mutex<Option<SystemTime>>,
}

impl DirectoryConnector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            last_poll: Mutex::new(None),
        }
    }

    /// Map an id back to a file below the root, refusing anything that
    /// would escape it.
    fn resolve(&self, id: &DocId) -> Option<PathBuf> {
        let relative = Path::new(id.as_str());
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return None;
        }
        Some(self.root.join(relative))
    }

    /// Relative paths and modification times of all files below the root.
    async fn list_files(&self) -> Result<Vec<(DocId, SystemTime)>> {
        let mut files = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file() {
                    let modified = entry.metadata().await?.modified()?;
                    if let Some(id) = self.doc_id_for(&path) {
                        files.push((id, modified));
                    }
                }
            }
        }

        files.sort();
        Ok(files)
    }

    fn doc_id_for(&self, path: &Path) -> Option<DocId> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Option<Vec<&str>> = relative.components().map(|c| c.as_os_str().to_str()).collect();
        Some(DocId::new(parts?.join("/")))
    }
}

fn content_type_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    Some(match ext.as_str() {
        "txt" | "log" => "text/plain",
        "html" | "htm" => "text/html",
        "xml" => "application/xml",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "csv" => "text/csv",
        "md" => "text/markdown",
        _ => return None,
    })
}

#[async_trait]
impl Connector for DirectoryConnector {
    async fn init(&self, _context: Arc<dyn ConnectorContext>) -> Result<()> {
        let metadata = tokio::fs::metadata(&self.root).await.map_err(|e| {
            Error::Initialization(format!("{}: {}", self.root.display(), e))
        })?;
        if !metadata.is_dir() {
            return Err(Error::Initialization(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }
        *self.last_poll.lock() = Some(SystemTime::now());
        info!(root = %self.root.display(), "Directory connector initialized");
        Ok(())
    }

    async fn destroy(&self) {
        debug!(root = %self.root.display(), "Directory connector destroyed");
    }

    async fn get_doc_ids(&self, pusher: &dyn DocIdPusher) -> Result<()> {
        let ids: Vec<DocId> = self.list_files().await?.into_iter().map(|(id, _)| id).collect();
        debug!(count = ids.len(), "Listing directory");

        match pusher.push_doc_ids(&ids).await? {
            None => Ok(()),
            Some(failed) => Err(Error::push(format!("delivery stopped at {failed}"))),
        }
    }

    async fn get_doc_content(&self, request: &DocRequest) -> Result<Option<DocContent>> {
        let Some(path) = self.resolve(&request.doc_id) else {
            return Ok(None);
        };

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let content = tokio::fs::read(&path).await?;
        let mut doc = DocContent::new(content).with_metadata("size", metadata.len().to_string());
        if let Some(content_type) = content_type_for(&path) {
            doc = doc.with_content_type(content_type);
        }
        doc.last_modified = metadata.modified().ok().map(DateTime::<Utc>::from);
        Ok(Some(doc))
    }

    async fn get_modified_doc_ids(&self, pusher: &dyn DocIdPusher) -> Result<()> {
        let poll_started = SystemTime::now();
        let since = *self.last_poll.lock();

        let modified: Vec<DocId> = self
            .list_files()
            .await?
            .into_iter()
            .filter(|(_, mtime)| since.is_none_or(|since| *mtime >= since))
            .map(|(id, _)| id)
            .collect();

        if !modified.is_empty() {
            debug!(count = modified.len(), "Pushing modified files");
            if let Some(failed) = pusher.push_doc_ids(&modified).await? {
                return Err(Error::push(format!("delivery stopped at {failed}")));
            }
        }

        *self.last_poll.lock() = Some(poll_started);
        Ok(())
    }

    fn supports_incremental(&self) -> bool {
        true
    }
}
