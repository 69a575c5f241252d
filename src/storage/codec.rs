//! Hashing, compression and atomic file writes
//!
//! The content hash is always taken over the pre-compression bytes, so the
//! address of a blob does not depend on the compression policy.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::Path;

use crate::error::{AppError, Result};
use crate::models::ContentCategory;

const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

/// Compute SHA-256 hash of content as lowercase hex.
pub fn compute_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// Compression decision for a single blob.
#[derive(Debug, Clone, Copy)]
pub struct CompressionPolicy {
    pub threshold: u64,
    pub level: u32,
}

impl CompressionPolicy {
    pub fn new(threshold: u64, level: u32) -> Self {
        Self {
            threshold,
            level: level.min(9),
        }
    }

    /// Already-compressed categories are never recompressed. Structured text
    /// wearing an image MIME (`image/svg+xml`) is still compressible.
    pub fn should_compress(&self, category: ContentCategory, mime: &str, size: u64) -> bool {
        if size < self.threshold {
            return false;
        }
        let structured = mime.ends_with("+xml") || mime.ends_with("+json");
        structured || !category.is_precompressed()
    }

    /// Returns the gzip payload only when it is actually smaller.
    pub fn compress(&self, content: &[u8]) -> Result<Option<Vec<u8>>> {
        let compressed = gzip(content, self.level)?;
        if compressed.len() < content.len() {
            Ok(Some(compressed))
        } else {
            Ok(None)
        }
    }
}

pub fn gzip(content: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(content.len() / 2), Compression::new(level));
    encoder.write_all(content)?;
    Ok(encoder.finish()?)
}

/// Inflate a gzip payload, refusing to produce more than `limit` bytes.
pub fn gunzip_limited(hash: &str, payload: &[u8], limit: u64) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(payload).take(limit.saturating_add(1));
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| AppError::corrupted(hash, format!("undecodable compressed data: {}", e)))?;
    if out.len() as u64 > limit {
        return Err(AppError::corrupted(
            hash,
            format!("decompressed size exceeds {} bytes", limit),
        ));
    }
    Ok(out)
}

pub fn looks_gzipped(payload: &[u8]) -> bool {
    payload.starts_with(&GZIP_MAGIC)
}

/// Write `content` next to `target` and rename it into place.
///
/// The temp file lives in the target's directory so the rename never crosses
/// filesystems; it is removed on every error path.
pub fn write_file_atomically(target: &Path, content: &[u8]) -> Result<()> {
    let dir = target.parent().ok_or_else(|| {
        AppError::storage_access("Target has no parent directory", Some(target.to_path_buf()))
    })?;
    std::fs::create_dir_all(dir).map_err(|e| {
        AppError::storage_access(
            format!("Failed to create directory: {}", e),
            Some(dir.to_path_buf()),
        )
    })?;

    let mut temp = tempfile::Builder::new()
        .prefix(".incoming-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| {
            AppError::storage_access(
                format!("Failed to create temp file: {}", e),
                Some(dir.to_path_buf()),
            )
        })?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(target).map_err(|e| {
        AppError::storage_access(
            format!("Failed to rename temp file into place: {}", e.error),
            Some(target.to_path_buf()),
        )
    })?;
    Ok(())
}
