//! Every index under one data directory, by name.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

use crate::config::{Settings, SETTINGS_FILE};
use crate::error::Error;
use crate::index::Index;

pub const MAX_NAME_LEN: usize = 128;

pub fn validate_name(name: &str) -> Result<(), Error> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(Error::invalid(format!("Invalid index name {}", name)))
    }
}

pub struct IndexManager {
    path: PathBuf,
    indexes: RwLock<BTreeMap<String, Arc<Index>>>,
}

impl IndexManager {
    /// Opens every index found directly under `path`.
    pub fn open(path: &Path) -> Result<IndexManager, Error> {
        std::fs::create_dir_all(path)?;
        let mut indexes = BTreeMap::new();
        let walker = WalkDir::new(path).min_depth(1).max_depth(1).into_iter();
        for entry in walker.filter_entry(|e| e.file_type().is_dir()) {
            let entry = entry.map_err(|e| Error::invalid(format!("Could not list {}: {}", path.display(), e)))?;
            let name = match entry.file_name().to_str() {
                Some(name) if validate_name(name).is_ok() => name.to_string(),
                _ => continue,
            };
            if !entry.path().join(SETTINGS_FILE).exists() {
                continue;
            }
            let index = Index::open(entry.path())?;
            indexes.insert(name, Arc::new(index));
        }
        tracing::info!(path = ?path, indexes = indexes.len(), "opened index manager");
        Ok(IndexManager {
            path: path.to_path_buf(),
            indexes: RwLock::new(indexes),
        })
    }

    pub fn create(&self, name: &str, settings: Settings) -> Result<Arc<Index>, Error> {
        validate_name(name)?;
        let mut indexes = self.indexes.write();
        if indexes.contains_key(name) {
            return Err(Error::invalid(format!("Index {} already exists", name)));
        }
        let index = Arc::new(Index::create(&self.path.join(name), settings)?);
        indexes.insert(name.to_string(), index.clone());
        tracing::info!(index = name, "created index");
        Ok(index)
    }

    pub fn get(&self, name: &str) -> Result<Arc<Index>, Error> {
        self.indexes
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("index {}", name)))
    }

    pub fn list(&self) -> Vec<String> {
        self.indexes.read().keys().cloned().collect()
    }

    /// Removes the index and its directory once pending writes are done.
    pub fn drop_index(&self, name: &str) -> Result<(), Error> {
        let index = self
            .indexes
            .write()
            .remove(name)
            .ok_or_else(|| Error::NotFound(format!("index {}", name)))?;
        index.wait_for_writes();
        let path = index.path().to_path_buf();
        drop(index);
        std::fs::remove_dir_all(&path)?;
        tracing::info!(index = name, "dropped index");
        Ok(())
    }
}
