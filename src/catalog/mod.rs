//! Catalog Module - The set of files a node advertises to its peers
//!
//! The exchange server only ever asks for a snapshot of the catalog; how the
//! records are produced (directory walk, persistent index, fixed list) lives
//! behind the [`CatalogProvider`] trait.

mod file_index;
mod fingerprint;

pub use file_index::FileIndex;
pub use fingerprint::Fingerprint;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Index database error: {0}")]
    Database(#[from] sled::Error),

    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Catalog unavailable: {0}")]
    Unavailable(String),
}

/// One entry of a node's catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Path of the file as indexed
    pub path: String,

    /// Hex content fingerprint, empty for directories
    #[serde(default)]
    pub hash: String,

    /// Size in bytes
    pub size: u64,

    /// Last modification time
    pub mod_time: DateTime<Utc>,

    /// Is this entry a directory?
    pub is_dir: bool,
}

impl FileRecord {
    /// Record for a regular file
    pub fn file(path: impl Into<String>, hash: Fingerprint, size: u64, mod_time: DateTime<Utc>) -> Self {
        Self {
            path: path.into(),
            hash: hash.to_hex(),
            size,
            mod_time,
            is_dir: false,
        }
    }

    /// Record for a directory (never fingerprinted)
    pub fn directory(path: impl Into<String>, size: u64, mod_time: DateTime<Utc>) -> Self {
        Self {
            path: path.into(),
            hash: String::new(),
            size,
            mod_time,
            is_dir: true,
        }
    }
}

/// Source of catalog snapshots.
///
/// Implementations must tolerate being called concurrently from several
/// connection handlers.
#[async_trait]
pub trait CatalogProvider: Send + Sync {
    /// Produce the current catalog, ordered by path
    async fn snapshot(&self) -> Result<Vec<FileRecord>, CatalogError>;
}

/// Fixed catalog held in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    records: Vec<FileRecord>,
}

impl MemoryCatalog {
    pub fn new(mut records: Vec<FileRecord>) -> Self {
        records.sort_by(|a, b| a.path.cmp(&b.path));
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl CatalogProvider for MemoryCatalog {
    async fn snapshot(&self) -> Result<Vec<FileRecord>, CatalogError> {
        Ok(self.records.clone())
    }
}
