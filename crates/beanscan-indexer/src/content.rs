use beanscan_core::{modified_millis, path_for_uri, DocumentContentProvider, Result, ScanError};
use dashmap::DashMap;
use std::io;
use tracing::trace;

#[derive(Debug, Clone)]
struct Snapshot {
    text: String,
    last_modified: i64,
}

/// Document contents as the indexer sees them: editor snapshots of open documents
/// take precedence over the file on disk.
#[derive(Debug, Default)]
pub struct DocumentContents {
    open: DashMap<String, Snapshot>,
}

impl DocumentContents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, uri: &str, text: impl Into<String>, last_modified: i64) {
        trace!(uri, "Document opened");
        self.open.insert(
            uri.to_string(),
            Snapshot {
                text: text.into(),
                last_modified,
            },
        );
    }

    /// Replaces the snapshot of an open document. Opens it if unknown.
    pub fn change(&self, uri: &str, text: impl Into<String>, last_modified: i64) {
        self.open(uri, text, last_modified);
    }

    /// Drops the snapshot. Later reads fall back to disk.
    pub fn close(&self, uri: &str) -> bool {
        self.open.remove(uri).is_some()
    }

    pub fn is_open(&self, uri: &str) -> bool {
        self.open.contains_key(uri)
    }
}

impl DocumentContentProvider for DocumentContents {
    fn fetch_content(&self, uri: &str) -> Result<String> {
        if let Some(snapshot) = self.open.get(uri) {
            return Ok(snapshot.text.clone());
        }
        let path = path_for_uri(uri).ok_or_else(|| {
            ScanError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a file URI: {}", uri),
            ))
        })?;
        Ok(std::fs::read_to_string(path)?)
    }

    fn last_modified(&self, uri: &str) -> Option<i64> {
        if let Some(snapshot) = self.open.get(uri) {
            return Some(snapshot.last_modified);
        }
        modified_millis(&path_for_uri(uri)?)
    }
}
