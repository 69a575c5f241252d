//! Content-Addressable Blob Store
//!
//! Based on Git's object storage model:
//! - SHA-256 over the pre-compression bytes (address independent of filename,
//!   MIME and compression policy)
//! - Sharded directory structure (`blobs/<first 2 hex>/<full hash>`)
//! - Automatic deduplication with persisted reference counts
//! - Write-then-verify-then-rename, so readers never see a partial blob
//!
//! Mutations go through the single writer thread (see [`super::writer`]);
//! reads hit the filesystem directly and only ever observe completed writes.

use bytes::Bytes;
use std::collections::HashMap;
use tokio::fs;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::codec::{self, compute_hash, gunzip_limited, looks_gzipped, CompressionPolicy};
use super::layout::{is_valid_hash, validate_hash, StorageLayout};
use super::writer::{BlobWriter, Reply, StoreRequest, WriterCommand};
use crate::error::{AppError, Result};
use crate::infrastructure::config::StorageConfig;
use crate::models::{BlobDescriptor, GcReport, StoreOutcome, StoreStats};

/// Handle to a blob store. Cheap to clone; every clone talks to the same
/// writer thread.
#[derive(Debug, Clone)]
pub struct BlobStore {
    layout: StorageLayout,
    max_file_size: u64,
    commands: mpsc::Sender<WriterCommand>,
}

impl BlobStore {
    /// Open (or create) a store under `config.base_dir`.
    ///
    /// Loads the reference-count map and descriptors, then starts the writer
    /// thread. The thread stops once the last handle is dropped.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use attachment_store::infrastructure::StorageConfig;
    /// # use attachment_store::storage::BlobStore;
    /// # tokio_test::block_on(async {
    /// let store = BlobStore::open(&StorageConfig::default()).await.unwrap();
    /// let outcome = store.store(&b"hello"[..], Some("a.txt"), None).await.unwrap();
    /// assert_eq!(store.retrieve(&outcome.content_hash).await.unwrap(), b"hello");
    /// # })
    /// ```
    pub async fn open(config: &StorageConfig) -> Result<Self> {
        let layout = StorageLayout::new(&config.base_dir);
        let policy = CompressionPolicy::new(config.compression_threshold, config.compression_level);

        let writer_layout = layout.clone();
        let writer = tokio::task::spawn_blocking(move || BlobWriter::open(writer_layout, policy))
            .await
            .map_err(|e| AppError::Internal(format!("Blob store loader panicked: {}", e)))??;

        let (commands, receiver) = mpsc::channel(config.writer_queue_depth.max(1));
        writer.spawn(receiver)?;

        Ok(Self {
            layout,
            max_file_size: config.max_file_size,
            commands,
        })
    }

    /// Compute SHA-256 hash of content
    pub fn compute_hash(content: &[u8]) -> String {
        codec::compute_hash(content)
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Store content, deduplicating by hash.
    ///
    /// Content above `max_file_size` is rejected before any I/O. Known content
    /// only gains a reference; its bytes are not rewritten.
    pub async fn store(
        &self,
        content: impl Into<Bytes>,
        filename_hint: Option<&str>,
        mime_hint: Option<&str>,
    ) -> Result<StoreOutcome> {
        let content = content.into();
        let size = content.len() as u64;
        if size > self.max_file_size {
            warn!(size, limit = self.max_file_size, "Rejecting oversized content");
            return Err(AppError::FileTooLarge {
                size,
                limit: self.max_file_size,
            });
        }

        let request = StoreRequest {
            content_hash: compute_hash(&content),
            content,
            filename_hint: filename_hint.map(str::to_string),
            mime_hint: mime_hint.map(str::to_string),
        };
        self.request(|response| WriterCommand::Store { request, response })
            .await
    }

    /// Read a blob back, decompressing and re-verifying its hash.
    ///
    /// # Errors
    ///
    /// - `NotFound` if no blob exists for `hash`
    /// - `Corrupted` if the bytes on disk do not hash back to `hash`
    pub async fn retrieve(&self, hash: &str) -> Result<Vec<u8>> {
        validate_hash(hash)?;
        let path = self.layout.blob_path(hash);

        let stored = fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AppError::not_found(format!("Blob {}", hash))
            } else {
                AppError::storage_access(format!("Failed to read blob: {}", e), Some(path.clone()))
            }
        })?;

        let descriptor = self.descriptor(hash).await?;
        let compressed = descriptor.as_ref().map(|d| d.is_compressed);
        let limit = descriptor
            .as_ref()
            .map(|d| d.raw_size)
            .unwrap_or(self.max_file_size);

        let hash = hash.to_string();
        tokio::task::spawn_blocking(move || decode_and_verify(&hash, stored, compressed, limit))
            .await
            .map_err(|e| AppError::Internal(format!("Blob decode task panicked: {}", e)))?
    }

    /// Check if a blob exists on disk.
    pub async fn exists(&self, hash: &str) -> bool {
        if !is_valid_hash(hash) {
            return false;
        }
        fs::metadata(self.layout.blob_path(hash))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    /// Read the side-metadata for a blob. A missing or unreadable descriptor
    /// is `None`.
    pub async fn descriptor(&self, hash: &str) -> Result<Option<BlobDescriptor>> {
        validate_hash(hash)?;
        let path = self.layout.descriptor_path(hash);
        match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(descriptor) => Ok(Some(descriptor)),
                Err(e) => {
                    warn!(hash = %hash, error = %e, "Unreadable blob descriptor");
                    Ok(None)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::storage_access(
                format!("Failed to read descriptor: {}", e),
                Some(path),
            )),
        }
    }

    /// Re-hash a stored blob. `Ok(false)` means corrupted.
    pub async fn verify(&self, hash: &str) -> Result<bool> {
        match self.retrieve(hash).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_corrupted() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn increment_reference(&self, hash: &str) -> Result<u64> {
        validate_hash(hash)?;
        let hash = hash.to_string();
        self.request(|response| WriterCommand::Increment { hash, response })
            .await
    }

    /// Drop one reference. Reaching zero only marks the blob for the next
    /// [`garbage_collect`](Self::garbage_collect); nothing is deleted here.
    pub async fn decrement_reference(&self, hash: &str) -> Result<u64> {
        validate_hash(hash)?;
        let hash = hash.to_string();
        self.request(|response| WriterCommand::Decrement { hash, response })
            .await
    }

    pub async fn garbage_collect(&self) -> Result<GcReport> {
        self.request(|response| WriterCommand::CollectGarbage { response })
            .await
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        self.request(|response| WriterCommand::Stats { response })
            .await
    }

    /// Replace the whole reference-count map, e.g. with counts recomputed
    /// from the metadata index.
    pub async fn replace_reference_counts(&self, counts: HashMap<String, u64>) -> Result<()> {
        if let Some(bad) = counts.keys().find(|hash| !is_valid_hash(hash)) {
            return Err(AppError::validation_error(format!(
                "Invalid content hash in reference counts: {:?}",
                bad
            )));
        }
        self.request(|response| WriterCommand::ReplaceReferenceCounts { counts, response })
            .await
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> WriterCommand) -> Result<T> {
        let (response, reply) = oneshot::channel();
        self.commands
            .send(command(response))
            .await
            .map_err(|_| writer_stopped())?;
        reply.await.map_err(|_| writer_stopped())?
    }
}

fn writer_stopped() -> AppError {
    AppError::Internal("Blob writer thread has stopped".to_string())
}

/// `compressed` is `None` when the descriptor is gone; then the raw bytes are
/// tried first and gzip second.
fn decode_and_verify(
    hash: &str,
    stored: Vec<u8>,
    compressed: Option<bool>,
    limit: u64,
) -> Result<Vec<u8>> {
    let content = match compressed {
        Some(true) => gunzip_limited(hash, &stored, limit)?,
        Some(false) => stored,
        None => {
            if compute_hash(&stored) == hash {
                debug!(hash = %hash, "Descriptor missing, raw bytes verified");
                return Ok(stored);
            }
            if looks_gzipped(&stored) {
                gunzip_limited(hash, &stored, limit)?
            } else {
                stored
            }
        }
    };

    let actual = compute_hash(&content);
    if actual != hash {
        warn!(hash = %hash, actual = %actual, "Blob failed hash verification");
        return Err(AppError::corrupted(
            hash,
            format!("content hashes to {}", actual),
        ));
    }
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_store(dir: &TempDir) -> BlobStore {
        let mut config = StorageConfig::default();
        config.base_dir = dir.path().to_path_buf();
        config.compression_threshold = 64;
        BlobStore::open(&config).await.unwrap()
    }

    #[test]
    fn test_different_content_different_hash() {
        let hash1 = BlobStore::compute_hash(b"content1");
        let hash2 = BlobStore::compute_hash(b"content2");
        assert_ne!(hash1, hash2);
    }

    #[tokio::test]
    async fn test_identical_content_is_deduplicated() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let first = store.store(&b"hello"[..], Some("a.txt"), None).await.unwrap();
        let second = store.store(&b"hello"[..], Some("b.txt"), None).await.unwrap();

        assert_eq!(first.content_hash, second.content_hash);
        assert!(first.was_newly_stored);
        assert!(!second.was_newly_stored);
    }

    #[tokio::test]
    async fn test_round_trip_through_compression() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let text = "line of text\n".repeat(500);

        let outcome = store
            .store(text.clone().into_bytes(), Some("log.txt"), Some("text/plain"))
            .await
            .unwrap();
        assert!(outcome.stored_size < text.len() as u64);

        let retrieved = store.retrieve(&outcome.content_hash).await.unwrap();
        assert_eq!(retrieved, text.as_bytes());
    }

    #[tokio::test]
    async fn test_oversized_content_is_rejected_before_io() {
        let dir = TempDir::new().unwrap();
        let mut config = StorageConfig::default();
        config.base_dir = dir.path().to_path_buf();
        config.max_file_size = 1000;
        let store = BlobStore::open(&config).await.unwrap();

        let content = vec![7u8; 1002];
        let err = store.store(content.clone(), None, None).await.unwrap_err();
        assert!(matches!(err, AppError::FileTooLarge { size: 1002, limit: 1000 }));

        let hash = BlobStore::compute_hash(&content);
        assert!(!store.exists(&hash).await);
        assert!(!store.layout().shard_dir(&hash).exists());
    }

    #[tokio::test]
    async fn test_corruption_is_detected() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let outcome = store.store(&b"precious"[..], None, None).await.unwrap();

        std::fs::write(store.layout().blob_path(&outcome.content_hash), b"tampered").unwrap();

        let err = store.retrieve(&outcome.content_hash).await.unwrap_err();
        assert!(err.is_corrupted());
        assert!(!store.verify(&outcome.content_hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupted_compressed_blob_is_detected() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let text = "compress me ".repeat(200);
        let outcome = store
            .store(text.into_bytes(), None, Some("text/plain"))
            .await
            .unwrap();

        let path = store.layout().blob_path(&outcome.content_hash);
        let mut bytes = std::fs::read(&path).unwrap();
        let middle = bytes.len() / 2;
        bytes[middle] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        assert!(store.retrieve(&outcome.content_hash).await.unwrap_err().is_corrupted());
    }

    #[tokio::test]
    async fn test_decrement_then_gc_removes_blob() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let outcome = store.store(&b"short-lived"[..], None, None).await.unwrap();
        let hash = outcome.content_hash;

        assert_eq!(store.decrement_reference(&hash).await.unwrap(), 0);
        assert!(store.exists(&hash).await);
        assert_eq!(store.retrieve(&hash).await.unwrap(), b"short-lived");

        let report = store.garbage_collect().await.unwrap();
        assert_eq!(report.deleted_count, 1);
        assert!(!store.exists(&hash).await);
        assert!(store.retrieve(&hash).await.unwrap_err().is_not_found());

        let again = store.garbage_collect().await.unwrap();
        assert_eq!(again.reclaimed_bytes, 0);
    }

    #[tokio::test]
    async fn test_retrieve_unknown_hash_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let err = store.retrieve(&"ab".repeat(32)).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_retrieve_without_descriptor_still_verifies() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let text = "descriptor lost ".repeat(100);
        let outcome = store
            .store(text.clone().into_bytes(), None, Some("text/plain"))
            .await
            .unwrap();

        std::fs::remove_file(store.layout().descriptor_path(&outcome.content_hash)).unwrap();
        let retrieved = store.retrieve(&outcome.content_hash).await.unwrap();
        assert_eq!(retrieved, text.as_bytes());
    }

    #[tokio::test]
    async fn test_concurrent_identical_stores_converge() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.store(&b"same bytes"[..], None, None).await })
            })
            .collect();

        let mut newly_stored = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().was_newly_stored {
                newly_stored += 1;
            }
        }
        assert_eq!(newly_stored, 1);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_blobs, 1);
        assert_eq!(stats.dedup_savings, 10 * 15);
    }

    #[tokio::test]
    async fn test_counts_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let hash = {
            let store = open_store(&dir).await;
            store.store(&b"durable"[..], None, None).await.unwrap();
            store.store(&b"durable"[..], None, None).await.unwrap().content_hash
        };

        let store = open_store(&dir).await;
        assert_eq!(store.decrement_reference(&hash).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_replace_reference_counts_rejects_bad_hash() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let mut counts = HashMap::new();
        counts.insert("../etc/passwd".to_string(), 1);
        assert!(store.replace_reference_counts(counts).await.is_err());
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(16))]

            #[test]
            fn prop_store_retrieve_round_trip(content in prop::collection::vec(any::<u8>(), 0..4096)) {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();
                runtime.block_on(async {
                    let dir = TempDir::new().unwrap();
                    let store = open_store(&dir).await;
                    let outcome = store
                        .store(content.clone(), None, Some("text/plain"))
                        .await
                        .unwrap();
                    let retrieved = store.retrieve(&outcome.content_hash).await.unwrap();
                    assert_eq!(retrieved, content);
                });
            }
        }
    }
}
