//! Library entries
//!
//! Entries are keyed by `(type, path)` with `/`-separated paths. Reading a
//! path that names an entry returns it; reading any other path lists the
//! entries and sub-directories directly below it.

use super::{read_versioned, write_versioned, Versioned};
use crate::common::{KeyCodec, Result, ValueCodec};
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryEntry {
    #[serde(default)]
    pub meta: Map<String, Value>,
    pub body: String,
}

/// One child of a listed directory
#[derive(Debug, Clone, PartialEq)]
pub enum LibraryItem {
    Directory(String),
    File { name: String, meta: Map<String, Value> },
}

impl LibraryItem {
    /// Listing shape expected by editors: directories are plain names,
    /// files are their meta plus `fn`.
    pub fn to_json(&self) -> Value {
        match self {
            LibraryItem::Directory(name) => Value::String(name.clone()),
            LibraryItem::File { name, meta } => {
                let mut object = meta.clone();
                object.insert("fn".to_string(), Value::String(name.clone()));
                Value::Object(object)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LibraryListing {
    Entry(Versioned<LibraryEntry>),
    Directory(Vec<LibraryItem>),
}

fn normalise(path: &str) -> &str {
    path.trim_matches('/')
}

pub struct Library {
    transport: Arc<dyn Transport>,
    keys: KeyCodec,
    codec: ValueCodec,
}

impl Library {
    pub fn new(transport: Arc<dyn Transport>, keys: KeyCodec, codec: ValueCodec) -> Self {
        Self {
            transport,
            keys,
            codec,
        }
    }

    pub async fn get_entry(&self, entry_type: &str, path: &str) -> Result<LibraryListing> {
        let path = normalise(path);
        if !path.is_empty() {
            if let Some(entry) = self.read(entry_type, path).await? {
                return Ok(LibraryListing::Entry(entry));
            }
        }

        let prefix = self.keys.library_prefix(entry_type, path);
        let mut directories = BTreeSet::new();
        let mut files = Vec::new();
        for key in self.transport.scan_prefix(&prefix).await? {
            let Some(full) = self.keys.parse_library(entry_type, &key) else {
                continue;
            };
            let relative = if path.is_empty() {
                full.as_str()
            } else {
                match full.strip_prefix(path).and_then(|r| r.strip_prefix('/')) {
                    Some(relative) => relative,
                    None => continue,
                }
            };
            match relative.split_once('/') {
                Some((dir, _)) => {
                    directories.insert(dir.to_string());
                }
                None => {
                    // the entry may have been replaced since the scan
                    if let Some(entry) = self.read(entry_type, &full).await? {
                        files.push((relative.to_string(), entry.body.meta));
                    }
                }
            }
        }

        files.sort_by(|a, b| a.0.cmp(&b.0));
        let mut items: Vec<LibraryItem> =
            directories.into_iter().map(LibraryItem::Directory).collect();
        items.extend(
            files
                .into_iter()
                .map(|(name, meta)| LibraryItem::File { name, meta }),
        );
        Ok(LibraryListing::Directory(items))
    }

    /// Save an entry; returns its new revision.
    pub async fn save_entry(
        &self,
        entry_type: &str,
        path: &str,
        meta: Map<String, Value>,
        body: impl Into<String>,
    ) -> Result<u64> {
        let path = normalise(path);
        let key = self.keys.library(entry_type, path)?;
        let entry = LibraryEntry {
            meta,
            body: body.into(),
        };
        let revision =
            write_versioned(self.transport.as_ref(), &self.codec, &key, None, &entry, None).await?;
        tracing::info!("Saved library entry {}:{} (revision {})", entry_type, path, revision);
        Ok(revision)
    }

    async fn read(&self, entry_type: &str, path: &str) -> Result<Option<Versioned<LibraryEntry>>> {
        let key = self.keys.library(entry_type, path)?;
        read_versioned(self.transport.as_ref(), &self.codec, &key).await
    }
}
