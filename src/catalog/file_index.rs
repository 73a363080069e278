//! File Index - Persistent catalog backed by sled
//!
//! Walks a directory tree, fingerprints every regular file and keeps one
//! record per path. sled keeps keys sorted, so snapshots come out ordered by
//! path without an extra sort.

use super::{CatalogError, CatalogProvider, FileRecord, Fingerprint};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::Path;

/// Persistent index of files under one or more roots
#[derive(Clone)]
pub struct FileIndex {
    db: sled::Db,
}

impl FileIndex {
    /// Open (or create) an index database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Open a throwaway index that is removed when dropped
    pub fn temporary() -> Result<Self, CatalogError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    /// Index `root` and everything below it.
    ///
    /// Existing records for the same paths are replaced. Symbolic links are
    /// not followed. Returns the number of records written.
    pub fn index_directory(&self, root: impl AsRef<Path>) -> Result<usize, CatalogError> {
        let root = root.as_ref();
        tracing::info!("Indexing {}", root.display());

        let mut written = 0;
        self.walk(root, &mut written)?;
        self.db.flush()?;

        tracing::info!("Indexed {} entries under {}", written, root.display());
        Ok(written)
    }

    fn walk(&self, path: &Path, written: &mut usize) -> Result<(), CatalogError> {
        let meta = fs::symlink_metadata(path).map_err(|e| io_error(path, e))?;

        if meta.file_type().is_symlink() {
            tracing::debug!("Skipping symlink {}", path.display());
            return Ok(());
        }

        let mod_time: DateTime<Utc> = meta
            .modified()
            .map(DateTime::from)
            .unwrap_or_else(|_| Utc::now());
        let display = path.to_string_lossy().into_owned();

        if meta.is_dir() {
            self.put(&FileRecord::directory(display, meta.len(), mod_time))?;
            *written += 1;

            let mut children: Vec<_> = fs::read_dir(path)
                .map_err(|e| io_error(path, e))?
                .collect::<Result<_, _>>()
                .map_err(|e| io_error(path, e))?;
            children.sort_by_key(|entry| entry.file_name());

            for child in children {
                self.walk(&child.path(), written)?;
            }
        } else if meta.is_file() {
            let hash = Fingerprint::of_file(path).map_err(|e| io_error(path, e))?;
            self.put(&FileRecord::file(display, hash, meta.len(), mod_time))?;
            *written += 1;
        }

        Ok(())
    }

    /// Insert or replace a record
    pub fn put(&self, record: &FileRecord) -> Result<(), CatalogError> {
        let value = bincode::serialize(record)
            .map_err(|e| CatalogError::Serialization(e.to_string()))?;
        self.db.insert(record.path.as_bytes(), value)?;
        Ok(())
    }

    /// Look up a single path
    pub fn get(&self, path: &str) -> Result<Option<FileRecord>, CatalogError> {
        match self.db.get(path.as_bytes())? {
            Some(value) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    /// All records, ordered by path
    pub fn all(&self) -> Result<Vec<FileRecord>, CatalogError> {
        self.db
            .iter()
            .map(|entry| {
                let (_, value) = entry?;
                decode(&value)
            })
            .collect()
    }

    /// Number of indexed entries
    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> Result<(), CatalogError> {
        self.db.flush()?;
        Ok(())
    }
}

#[async_trait]
impl CatalogProvider for FileIndex {
    async fn snapshot(&self) -> Result<Vec<FileRecord>, CatalogError> {
        self.all()
    }
}

fn decode(value: &[u8]) -> Result<FileRecord, CatalogError> {
    bincode::deserialize(value).map_err(|e| CatalogError::Serialization(e.to_string()))
}

fn io_error(path: &Path, source: std::io::Error) -> CatalogError {
    CatalogError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn populate(dir: &Path) {
        fs::create_dir_all(dir.join("sub")).unwrap();
        fs::write(dir.join("one.txt"), b"first file").unwrap();
        fs::write(dir.join("sub").join("two.txt"), b"second file").unwrap();
    }

    #[test]
    fn test_index_directory() {
        let data = TempDir::new().unwrap();
        populate(data.path());

        let index = FileIndex::temporary().unwrap();
        let written = index.index_directory(data.path()).unwrap();

        // root, one.txt, sub, sub/two.txt
        assert_eq!(written, 4);
        assert_eq!(index.len(), 4);

        let one = data.path().join("one.txt");
        let record = index.get(&one.to_string_lossy()).unwrap().unwrap();
        assert!(!record.is_dir);
        assert_eq!(record.size, 10);
        assert_eq!(record.hash, Fingerprint::of_bytes(b"first file").to_hex());

        let sub = data.path().join("sub");
        let record = index.get(&sub.to_string_lossy()).unwrap().unwrap();
        assert!(record.is_dir);
        assert!(record.hash.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_ordered_by_path() {
        let data = TempDir::new().unwrap();
        populate(data.path());

        let index = FileIndex::temporary().unwrap();
        index.index_directory(data.path()).unwrap();

        let snapshot = index.snapshot().await.unwrap();
        let paths: Vec<&str> = snapshot.iter().map(|r| r.path.as_str()).collect();
        let mut sorted = paths.clone();
        sorted.sort();

        assert_eq!(snapshot.len(), 4);
        assert_eq!(paths, sorted);
    }

    #[test]
    fn test_reindex_replaces_records() {
        let data = TempDir::new().unwrap();
        populate(data.path());

        let index = FileIndex::temporary().unwrap();
        index.index_directory(data.path()).unwrap();

        fs::write(data.path().join("one.txt"), b"changed").unwrap();
        index.index_directory(data.path()).unwrap();

        let one = data.path().join("one.txt");
        let record = index.get(&one.to_string_lossy()).unwrap().unwrap();
        assert_eq!(index.len(), 4);
        assert_eq!(record.hash, Fingerprint::of_bytes(b"changed").to_hex());
    }

    #[test]
    fn test_open_on_disk() {
        let data = TempDir::new().unwrap();
        populate(data.path());
        let db_dir = TempDir::new().unwrap();

        let index = FileIndex::open(db_dir.path().join("files.db")).unwrap();
        index.index_directory(data.path()).unwrap();
        index.flush().unwrap();

        assert_eq!(index.all().unwrap().len(), 4);
        assert!(db_dir.path().join("files.db").exists());
    }

    #[test]
    fn test_missing_root_is_error() {
        let index = FileIndex::temporary().unwrap();
        let result = index.index_directory("/definitely/not/here");

        assert!(matches!(result, Err(CatalogError::Io { .. })));
    }
}
