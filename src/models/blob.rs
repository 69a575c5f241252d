//! Blob 模型
//!
//! Descriptor persisted next to every blob, plus the result types returned by
//! the blob store's mutating calls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Side-metadata written to `<base>/metadata/<hash>.meta`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobDescriptor {
    pub content_hash: String,
    /// Size of the pre-compression bytes.
    pub raw_size: u64,
    /// Size of the bytes on disk.
    pub stored_size: u64,
    pub is_compressed: bool,
    /// Path relative to the store's base directory.
    pub storage_path: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename_hint: Option<String>,
}

/// Result of `BlobStore::store`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreOutcome {
    pub content_hash: String,
    pub was_newly_stored: bool,
    pub stored_size: u64,
}

/// Result of a garbage collection sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcReport {
    pub deleted_count: usize,
    pub reclaimed_bytes: u64,
    /// Deletions that failed and were skipped; the next sweep retries them.
    pub failed_deletions: usize,
    /// Referenced hashes with no blob on disk. They stay in the map and are
    /// logged; `rebuild_reference_counts` is the repair path.
    pub dangling_references: usize,
}

/// 存储统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_blobs: usize,
    /// Bytes on disk.
    pub total_bytes: u64,
    /// Pre-compression bytes of every distinct blob.
    pub original_bytes: u64,
    /// Bytes not written thanks to deduplication.
    pub dedup_savings: u64,
    pub compression_savings: u64,
    /// Blobs with a zero reference count awaiting the next sweep.
    pub unreferenced_blobs: usize,
}
