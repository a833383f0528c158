//! File-backed durable storage for the engine.
//!
//! Each key is one JSON file in the data directory. Writes go to a
//! temporary file first and are renamed into place, so a crash mid-write
//! leaves the previous value intact.

use shopsync_engine::{NodeId, Storage};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Key under which the node id is persisted.
pub const NODE_KEY: &str = "node";

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("cannot create data directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("cannot read '{key}': {source}")]
    Read { key: String, source: io::Error },

    #[error("cannot write '{key}': {source}")]
    Write { key: String, source: io::Error },

    #[error("cannot remove '{key}': {source}")]
    Remove { key: String, source: io::Error },
}

impl From<StorageError> for shopsync_engine::Error {
    fn from(e: StorageError) -> Self {
        shopsync_engine::Error::Storage(e.to_string())
    }
}

/// One file per key under a directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Open (creating if needed) a storage directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StorageError::CreateDir {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(key)))
    }
}

/// `cache:products` -> `cache_products`
fn file_stem(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

impl Storage for FileStorage {
    fn get_item(&self, key: &str) -> shopsync_engine::error::Result<Option<String>> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Read {
                key: key.to_string(),
                source,
            }
            .into()),
        }
    }

    fn set_item(&mut self, key: &str, value: &str) -> shopsync_engine::error::Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        let write = |source| StorageError::Write {
            key: key.to_string(),
            source,
        };

        fs::write(&tmp, value).map_err(write)?;
        fs::rename(&tmp, &path).map_err(write)?;
        Ok(())
    }

    fn remove_item(&mut self, key: &str) -> shopsync_engine::error::Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Remove {
                key: key.to_string(),
                source,
            }
            .into()),
        }
    }
}

/// The persisted node id, or the configured / a freshly generated one,
/// which is then persisted.
///
/// A persisted id wins over the configured one so operation ids never
/// collide across restarts.
pub fn resolve_node_id(
    storage: &mut dyn Storage,
    configured: Option<&str>,
) -> shopsync_engine::error::Result<NodeId> {
    if let Some(stored) = storage.get_item(NODE_KEY)? {
        let stored = stored.trim().to_string();
        if !stored.is_empty() {
            if configured.is_some_and(|c| c != stored) {
                tracing::warn!(node_id = %stored, "ignoring NODE_ID, a different id is already persisted");
            }
            return Ok(stored);
        }
    }

    let node_id = configured
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    storage.set_item(NODE_KEY, &node_id)?;
    tracing::info!(%node_id, "node id assigned");
    Ok(node_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_map_to_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileStorage::open(dir.path()).unwrap();

        storage.set_item("cache:products", "[]").unwrap();
        assert!(dir.path().join("cache_products.json").exists());
        assert_eq!(
            storage.get_item("cache:products").unwrap().as_deref(),
            Some("[]")
        );
        // No temporary file is left behind
        assert!(!dir.path().join("cache_products.json.tmp").exists());
    }

    #[test]
    fn missing_keys_read_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileStorage::open(dir.path().join("nested")).unwrap();

        assert_eq!(storage.get_item("queue").unwrap(), None);
        storage.remove_item("queue").unwrap();
    }

    #[test]
    fn overwrite_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileStorage::open(dir.path()).unwrap();

        storage.set_item("queue", "{\"v\":1}").unwrap();
        storage.set_item("queue", "{\"v\":2}").unwrap();
        assert_eq!(storage.get_item("queue").unwrap().as_deref(), Some("{\"v\":2}"));

        storage.remove_item("queue").unwrap();
        assert_eq!(storage.get_item("queue").unwrap(), None);
    }

    #[test]
    fn node_id_is_generated_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileStorage::open(dir.path()).unwrap();

        let first = resolve_node_id(&mut storage, None).unwrap();
        assert!(uuid::Uuid::parse_str(&first).is_ok());

        let mut reopened = FileStorage::open(dir.path()).unwrap();
        assert_eq!(resolve_node_id(&mut reopened, Some("till-9")).unwrap(), first);
    }

    #[test]
    fn configured_node_id_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileStorage::open(dir.path()).unwrap();

        assert_eq!(resolve_node_id(&mut storage, Some("till-1")).unwrap(), "till-1");
        assert_eq!(storage.get_item(NODE_KEY).unwrap().as_deref(), Some("till-1"));
    }
}
