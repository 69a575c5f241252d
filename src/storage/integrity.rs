//! Integrity Verification for blobs and the metadata index
//!
//! Checks that:
//! - every blob on disk still hashes back to its address
//! - every hash referenced by an attachment record has a blob

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::cas::BlobStore;
use super::layout::is_valid_hash;
use super::metadata_store::MetadataStore;
use crate::error::Result;

/// Validation report for integrity verification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Blobs found on disk and re-hashed
    pub total_blobs: usize,
    pub valid_blobs: usize,
    pub corrupted_blobs: Vec<String>,
    /// Hashes referenced by records with no blob behind them
    pub missing_blobs: Vec<String>,
    /// Records pointing at a missing blob
    pub dangling_records: u64,
    pub warnings: Vec<String>,
    /// Timestamp of validation
    pub timestamp: i64,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self {
            total_blobs: 0,
            valid_blobs: 0,
            corrupted_blobs: Vec::new(),
            missing_blobs: Vec::new(),
            dangling_records: 0,
            warnings: Vec::new(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    /// Check if validation passed (no errors)
    pub fn is_valid(&self) -> bool {
        self.corrupted_blobs.is_empty() && self.missing_blobs.is_empty()
    }

    pub fn error_count(&self) -> usize {
        self.corrupted_blobs.len() + self.missing_blobs.len()
    }
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self::new()
    }
}

/// Re-hash every blob and cross-check every record's hash.
///
/// Read-only: nothing is repaired or deleted. Unreadable blobs are reported
/// as warnings rather than aborting the run.
pub async fn verify_integrity(
    blob_store: &BlobStore,
    metadata_store: &MetadataStore,
) -> Result<ValidationReport> {
    info!("Starting integrity verification");
    let mut report = ValidationReport::new();

    let hashes: Vec<String> = WalkDir::new(blob_store.layout().blobs_dir())
        .min_depth(2)
        .max_depth(2)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .filter(|name| is_valid_hash(name))
        .collect();
    report.total_blobs = hashes.len();

    for hash in &hashes {
        match blob_store.verify(hash).await {
            Ok(true) => report.valid_blobs += 1,
            Ok(false) => {
                warn!(hash = %hash, "Blob is corrupted (hash mismatch)");
                report.corrupted_blobs.push(hash.clone());
            }
            Err(e) => {
                report
                    .warnings
                    .push(format!("Failed to verify blob {}: {}", hash, e));
            }
        }
    }

    for (hash, records) in metadata_store.reference_counts().await? {
        if blob_store.exists(&hash).await {
            continue;
        }
        debug!(hash = %hash, records, "Referenced blob is missing");
        report.missing_blobs.push(hash);
        report.dangling_records += records;
    }
    report.missing_blobs.sort();

    if report.is_valid() {
        info!(blobs = report.total_blobs, "Integrity verification passed");
    } else {
        warn!(
            errors = report.error_count(),
            corrupted = report.corrupted_blobs.len(),
            missing = report.missing_blobs.len(),
            "Integrity verification found issues"
        );
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::config::StorageConfig;
    use crate::models::{AttachmentRecord, ContentCategory};
    use crate::storage::metadata_store::now_millis;
    use tempfile::TempDir;

    async fn open(dir: &TempDir) -> (BlobStore, MetadataStore) {
        let mut config = StorageConfig::default();
        config.base_dir = dir.path().to_path_buf();
        let blobs = BlobStore::open(&config).await.unwrap();
        let index = MetadataStore::new(dir.path()).await.unwrap();
        (blobs, index)
    }

    fn record_for(hash: &str) -> AttachmentRecord {
        let now = now_millis();
        AttachmentRecord {
            id: uuid::Uuid::new_v4().to_string(),
            content_hash: hash.to_string(),
            original_filename: "a.txt".to_string(),
            declared_mime_type: None,
            detected_mime_type: "text/plain".to_string(),
            content_category: ContentCategory::Text,
            file_size: 5,
            parent_record_id: "p".to_string(),
            extracted_metadata: serde_json::Map::new(),
            created_at: now,
            last_accessed_at: now,
        }
    }

    #[tokio::test]
    async fn test_empty_store_is_valid() {
        let dir = TempDir::new().unwrap();
        let (blobs, index) = open(&dir).await;

        let report = verify_integrity(&blobs, &index).await.unwrap();
        assert_eq!(report.total_blobs, 0);
        assert!(report.is_valid());
    }

    #[tokio::test]
    async fn test_corrupted_and_missing_blobs_are_reported() {
        let dir = TempDir::new().unwrap();
        let (blobs, index) = open(&dir).await;

        let good = blobs.store(&b"good"[..], None, None).await.unwrap().content_hash;
        let bad = blobs.store(&b"bad"[..], None, None).await.unwrap().content_hash;
        std::fs::write(blobs.layout().blob_path(&bad), b"flipped").unwrap();

        index.insert(&record_for(&good)).await.unwrap();
        let ghost = BlobStore::compute_hash(b"never stored");
        index.insert(&record_for(&ghost)).await.unwrap();
        index.insert(&record_for(&ghost)).await.unwrap();

        let report = verify_integrity(&blobs, &index).await.unwrap();
        assert_eq!(report.total_blobs, 2);
        assert_eq!(report.valid_blobs, 1);
        assert_eq!(report.corrupted_blobs, vec![bad]);
        assert_eq!(report.missing_blobs, vec![ghost]);
        assert_eq!(report.dangling_records, 2);
        assert_eq!(report.error_count(), 2);
    }
}
