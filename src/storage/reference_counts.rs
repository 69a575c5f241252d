//! Persistent hash -> reference count map
//!
//! Owned exclusively by the blob writer thread, so no interior locking.
//! Every mutation is followed by a flush; an entry at zero is kept until the
//! next garbage collection so the blob stays eligible for deletion.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::codec::write_file_atomically;
use crate::error::{AppError, Result};

#[derive(Debug)]
pub struct ReferenceCounts {
    path: PathBuf,
    counts: HashMap<String, u64>,
}

impl ReferenceCounts {
    /// Load the map from `path`. A missing file is an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let counts = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                AppError::storage_access(
                    format!("Unreadable reference count file: {}", e),
                    Some(path.clone()),
                )
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No reference count file, starting empty");
                HashMap::new()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, counts })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, hash: &str) -> Option<u64> {
        self.counts.get(hash).copied()
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.counts.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &u64)> {
        self.counts.iter()
    }

    /// Returns the new count.
    pub fn increment(&mut self, hash: &str) -> u64 {
        let count = self.counts.entry(hash.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Decrement, saturating at zero. Unknown hashes are `NotFound`.
    pub fn decrement(&mut self, hash: &str) -> Result<u64> {
        let count = self
            .counts
            .get_mut(hash)
            .ok_or_else(|| AppError::not_found(format!("No reference count for {}", hash)))?;
        if *count == 0 {
            warn!(hash = %hash, "Decrement on a blob that is already unreferenced");
        }
        *count = count.saturating_sub(1);
        Ok(*count)
    }

    pub fn remove(&mut self, hash: &str) -> Option<u64> {
        self.counts.remove(hash)
    }

    pub fn replace(&mut self, counts: HashMap<String, u64>) {
        self.counts = counts;
    }

    pub fn flush(&self) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.counts)?;
        write_file_atomically(&self.path, &bytes)
            .map_err(|e| e.with_context("Failed to persist reference counts"))
    }
}
