//! On-disk layout of a store
//!
//! ```text
//! <base>/
//! ├── attachments.db            # SQLite metadata index
//! ├── reference_counts.json     # hash -> count
//! ├── blobs/
//! │   └── a3/
//! │       └── a3f2e1d4c5...     # full SHA-256 hash as filename
//! └── metadata/
//!     └── a3f2e1d4c5....meta    # blob descriptor (JSON)
//! ```

use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};

pub const BLOBS_DIR: &str = "blobs";
pub const METADATA_DIR: &str = "metadata";
pub const REFERENCE_COUNTS_FILE: &str = "reference_counts.json";
pub const INDEX_DB_FILE: &str = "attachments.db";
pub const DESCRIPTOR_EXTENSION: &str = "meta";

/// SHA-256 rendered as lowercase hex.
pub const HASH_HEX_LEN: usize = 64;

#[derive(Debug, Clone)]
pub struct StorageLayout {
    base_dir: PathBuf,
}

impl StorageLayout {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.base_dir.join(BLOBS_DIR)
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.base_dir.join(METADATA_DIR)
    }

    pub fn reference_counts_path(&self) -> PathBuf {
        self.base_dir.join(REFERENCE_COUNTS_FILE)
    }

    pub fn index_db_path(&self) -> PathBuf {
        self.base_dir.join(INDEX_DB_FILE)
    }

    /// `blobs/<first 2 hex chars>`
    pub fn shard_dir(&self, hash: &str) -> PathBuf {
        self.blobs_dir().join(&hash[..2])
    }

    /// `blobs/<first 2 hex chars>/<full hash>`
    pub fn blob_path(&self, hash: &str) -> PathBuf {
        self.shard_dir(hash).join(hash)
    }

    /// Blob path relative to the base directory, as recorded in descriptors.
    pub fn relative_blob_path(&self, hash: &str) -> String {
        format!("{}/{}/{}", BLOBS_DIR, &hash[..2], hash)
    }

    pub fn descriptor_path(&self, hash: &str) -> PathBuf {
        self.metadata_dir()
            .join(format!("{}.{}", hash, DESCRIPTOR_EXTENSION))
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [self.base_dir.clone(), self.blobs_dir(), self.metadata_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                AppError::storage_access(
                    format!("Failed to create store directory: {}", e),
                    Some(dir.clone()),
                )
            })?;
        }
        Ok(())
    }
}

pub fn is_valid_hash(hash: &str) -> bool {
    hash.len() == HASH_HEX_LEN
        && hash
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Reject anything that is not a lowercase SHA-256 hex digest before it is
/// turned into a path.
pub fn validate_hash(hash: &str) -> Result<()> {
    if is_valid_hash(hash) {
        Ok(())
    } else {
        Err(AppError::validation_error(format!(
            "Invalid content hash: {:?}",
            hash
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "a3f2e1d4c5b6a7890123456789abcdef0123456789abcdef0123456789abcdef";

    #[test]
    fn test_blob_path_sharding() {
        let layout = StorageLayout::new("/store");
        let path = layout.blob_path(HASH);

        assert_eq!(path, PathBuf::from("/store/blobs/a3").join(HASH));
        assert_eq!(layout.relative_blob_path(HASH), format!("blobs/a3/{}", HASH));
    }

    #[test]
    fn test_descriptor_path() {
        let layout = StorageLayout::new("/store");
        let path = layout.descriptor_path(HASH);
        assert_eq!(
            path,
            PathBuf::from("/store/metadata").join(format!("{}.meta", HASH))
        );
    }

    #[test]
    fn test_hash_validation() {
        assert!(is_valid_hash(HASH));
        assert!(!is_valid_hash("a3"));
        assert!(!is_valid_hash(&HASH.to_uppercase()));
        assert!(!is_valid_hash(&format!("../{}", &HASH[3..])));
        assert!(validate_hash("not-a-hash").is_err());
    }
}
