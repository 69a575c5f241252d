//! Single-writer owner of the blob store's mutable state
//!
//! Every mutating call is a [`WriterCommand`] processed in arrival order by one
//! dedicated thread. The thread owns the reference-count map and the descriptor
//! cache outright, so two stores of identical content can never race into a
//! double write.

use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::codec::{compute_hash, gunzip_limited, write_file_atomically, CompressionPolicy};
use super::layout::{is_valid_hash, StorageLayout, DESCRIPTOR_EXTENSION};
use super::reference_counts::ReferenceCounts;
use crate::error::{AppError, Result};
use crate::models::{BlobDescriptor, ContentCategory, StoreOutcome, StoreStats};

pub(crate) const WRITER_THREAD_NAME: &str = "blob-writer";

pub(crate) type Reply<T> = oneshot::Sender<Result<T>>;

/// Content already hashed by the caller, ready for the writer.
#[derive(Debug)]
pub(crate) struct StoreRequest {
    pub content_hash: String,
    pub content: Bytes,
    pub filename_hint: Option<String>,
    pub mime_hint: Option<String>,
}

#[derive(Debug)]
pub(crate) enum WriterCommand {
    Store {
        request: StoreRequest,
        response: Reply<StoreOutcome>,
    },
    Increment {
        hash: String,
        response: Reply<u64>,
    },
    Decrement {
        hash: String,
        response: Reply<u64>,
    },
    CollectGarbage {
        response: Reply<crate::models::GcReport>,
    },
    Stats {
        response: Reply<StoreStats>,
    },
    ReplaceReferenceCounts {
        counts: HashMap<String, u64>,
        response: Reply<()>,
    },
}

pub(crate) struct BlobWriter {
    pub(super) layout: StorageLayout,
    pub(super) policy: CompressionPolicy,
    pub(super) counts: ReferenceCounts,
    pub(super) descriptors: HashMap<String, BlobDescriptor>,
}

impl BlobWriter {
    /// Load persisted state. Unreadable descriptors are skipped with a warning;
    /// the next store of that content rewrites them.
    pub fn open(layout: StorageLayout, policy: CompressionPolicy) -> Result<Self> {
        layout.ensure_directories()?;
        let counts = ReferenceCounts::load(layout.reference_counts_path())?;
        let descriptors = load_descriptors(&layout)?;

        info!(
            base_dir = %layout.base_dir().display(),
            blobs = descriptors.len(),
            references = counts.len(),
            "Blob store state loaded"
        );

        Ok(Self {
            layout,
            policy,
            counts,
            descriptors,
        })
    }

    /// Move the writer onto its own thread. The thread exits once every
    /// sender has been dropped.
    pub fn spawn(
        self,
        receiver: mpsc::Receiver<WriterCommand>,
    ) -> Result<std::thread::JoinHandle<()>> {
        std::thread::Builder::new()
            .name(WRITER_THREAD_NAME.to_string())
            .spawn(move || self.run(receiver))
            .map_err(|e| AppError::Internal(format!("Failed to start blob writer: {}", e)))
    }

    fn run(mut self, mut receiver: mpsc::Receiver<WriterCommand>) {
        debug!("Blob writer started");
        while let Some(command) = receiver.blocking_recv() {
            self.handle(command);
        }
        debug!("Blob writer stopped");
    }

    fn handle(&mut self, command: WriterCommand) {
        // A dropped receiver means the caller went away; the mutation stands.
        match command {
            WriterCommand::Store { request, response } => {
                let _ = response.send(self.store(request));
            }
            WriterCommand::Increment { hash, response } => {
                let _ = response.send(self.increment(&hash));
            }
            WriterCommand::Decrement { hash, response } => {
                let _ = response.send(self.decrement(&hash));
            }
            WriterCommand::CollectGarbage { response } => {
                let _ = response.send(self.collect_garbage());
            }
            WriterCommand::Stats { response } => {
                let _ = response.send(Ok(self.stats()));
            }
            WriterCommand::ReplaceReferenceCounts { counts, response } => {
                let _ = response.send(self.replace_counts(counts));
            }
        }
    }

    pub(super) fn store(&mut self, request: StoreRequest) -> Result<StoreOutcome> {
        let hash = request.content_hash.clone();
        let blob_path = self.layout.blob_path(&hash);

        if self.descriptors.contains_key(&hash) && blob_path.is_file() {
            self.increment(&hash)?;
            let stored_size = self.descriptors.get(&hash).map_or(0, |d| d.stored_size);
            debug!(hash = %hash, "Content already stored, reference added");
            return Ok(StoreOutcome {
                content_hash: hash,
                was_newly_stored: false,
                stored_size,
            });
        }

        if self.descriptors.contains_key(&hash) {
            warn!(hash = %hash, "Descriptor present but blob missing, rewriting");
        }

        let descriptor = self.write_blob(&request)?;
        let stored_size = descriptor.stored_size;
        write_descriptor(&self.layout, &descriptor)?;
        self.descriptors.insert(hash.clone(), descriptor);
        self.increment(&hash)?;

        info!(
            hash = %hash,
            raw_size = request.content.len(),
            stored_size,
            "Stored new blob"
        );

        Ok(StoreOutcome {
            content_hash: hash,
            was_newly_stored: true,
            stored_size,
        })
    }

    /// Write to a temp file in the shard directory, re-read and re-hash it,
    /// and only then rename it into place.
    fn write_blob(&self, request: &StoreRequest) -> Result<BlobDescriptor> {
        let hash = &request.content_hash;
        let raw = request.content.as_ref();
        let raw_size = raw.len() as u64;

        let mime = request
            .mime_hint
            .as_deref()
            .unwrap_or("application/octet-stream");
        let category = ContentCategory::from_mime(mime);
        let compressed = if self.policy.should_compress(category, mime, raw_size) {
            self.policy.compress(raw)?
        } else {
            None
        };
        let is_compressed = compressed.is_some();
        let payload: &[u8] = compressed.as_deref().unwrap_or(raw);

        let shard_dir = self.layout.shard_dir(hash);
        std::fs::create_dir_all(&shard_dir).map_err(|e| {
            AppError::storage_access(
                format!("Failed to create shard directory: {}", e),
                Some(shard_dir.clone()),
            )
        })?;

        let mut temp = tempfile::Builder::new()
            .prefix(".incoming-")
            .suffix(".tmp")
            .tempfile_in(&shard_dir)
            .map_err(|e| {
                AppError::storage_access(
                    format!("Failed to create temp file: {}", e),
                    Some(shard_dir.clone()),
                )
            })?;
        temp.write_all(payload)?;
        temp.as_file().sync_all()?;

        let mut written = Vec::with_capacity(payload.len());
        let file = temp.as_file_mut();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut written)?;

        let round_trip = if is_compressed {
            gunzip_limited(hash, &written, raw_size)?
        } else {
            written
        };
        let actual = compute_hash(&round_trip);
        if &actual != hash {
            error!(hash = %hash, actual = %actual, "Written blob failed verification");
            return Err(AppError::corrupted(
                hash.clone(),
                format!("write verification produced {}", actual),
            ));
        }

        let blob_path = self.layout.blob_path(hash);
        temp.persist(&blob_path).map_err(|e| {
            AppError::storage_access(
                format!("Failed to move blob into place: {}", e.error),
                Some(blob_path.clone()),
            )
        })?;

        let now = Utc::now();
        Ok(BlobDescriptor {
            content_hash: hash.clone(),
            raw_size,
            stored_size: payload.len() as u64,
            is_compressed,
            storage_path: self.layout.relative_blob_path(hash),
            created_at: now,
            last_accessed_at: now,
            mime_hint: request.mime_hint.clone(),
            filename_hint: request.filename_hint.clone(),
        })
    }

    pub(super) fn increment(&mut self, hash: &str) -> Result<u64> {
        if !self.descriptors.contains_key(hash) && !self.layout.blob_path(hash).is_file() {
            return Err(AppError::not_found(format!("Blob {}", hash)));
        }
        let count = self.counts.increment(hash);
        if let Err(e) = self.counts.flush() {
            let _ = self.counts.decrement(hash);
            return Err(e);
        }
        Ok(count)
    }

    pub(super) fn decrement(&mut self, hash: &str) -> Result<u64> {
        let previous = self
            .counts
            .get(hash)
            .ok_or_else(|| AppError::not_found(format!("No reference count for {}", hash)))?;
        let count = self.counts.decrement(hash)?;
        if let Err(e) = self.counts.flush() {
            if previous > count {
                self.counts.increment(hash);
            }
            return Err(e);
        }
        if count == 0 {
            debug!(hash = %hash, "Blob is now unreferenced, eligible for collection");
        }
        Ok(count)
    }

    fn replace_counts(&mut self, counts: HashMap<String, u64>) -> Result<()> {
        let total = counts.len();
        self.counts.replace(counts);
        self.counts.flush()?;
        info!(entries = total, "Reference counts replaced");
        Ok(())
    }

    pub(super) fn stats(&self) -> StoreStats {
        let mut stats = StoreStats::default();
        for (hash, descriptor) in &self.descriptors {
            stats.total_blobs += 1;
            stats.total_bytes += descriptor.stored_size;
            stats.original_bytes += descriptor.raw_size;
            if descriptor.is_compressed {
                stats.compression_savings +=
                    descriptor.raw_size.saturating_sub(descriptor.stored_size);
            }
            match self.counts.get(hash) {
                Some(0) | None => stats.unreferenced_blobs += 1,
                Some(count) => {
                    stats.dedup_savings += descriptor.raw_size * (count - 1);
                }
            }
        }
        stats
    }
}

pub(crate) fn write_descriptor(layout: &StorageLayout, descriptor: &BlobDescriptor) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(descriptor)?;
    write_file_atomically(&layout.descriptor_path(&descriptor.content_hash), &bytes)
        .map_err(|e| e.with_context("Failed to write blob descriptor"))
}

pub(crate) fn read_descriptor_file(path: &std::path::Path) -> Result<BlobDescriptor> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn load_descriptors(layout: &StorageLayout) -> Result<HashMap<String, BlobDescriptor>> {
    let mut descriptors = HashMap::new();
    let metadata_dir = layout.metadata_dir();
    let entries = std::fs::read_dir(&metadata_dir).map_err(|e| {
        AppError::storage_access(
            format!("Failed to list descriptors: {}", e),
            Some(metadata_dir.clone()),
        )
    })?;

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(DESCRIPTOR_EXTENSION) {
            continue;
        }
        let Some(hash) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if !is_valid_hash(hash) {
            continue;
        }
        match read_descriptor_file(&path) {
            Ok(descriptor) if descriptor.content_hash == hash => {
                descriptors.insert(hash.to_string(), descriptor);
            }
            Ok(_) => warn!(path = %path.display(), "Descriptor names a different hash, ignoring"),
            Err(e) => warn!(path = %path.display(), error = %e, "Unreadable descriptor, ignoring"),
        }
    }

    Ok(descriptors)
}
