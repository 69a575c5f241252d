//! Garbage collection sweep
//!
//! Runs on the writer thread, so no store can interleave with a sweep. Any
//! single deletion failure is logged and skipped; a later sweep retries it.

use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::layout::{is_valid_hash, DESCRIPTOR_EXTENSION};
use super::writer::BlobWriter;
use crate::error::Result;
use crate::models::GcReport;

const TEMP_PREFIX: &str = ".incoming-";

impl BlobWriter {
    pub(super) fn collect_garbage(&mut self) -> Result<GcReport> {
        let mut report = GcReport::default();
        let mut live = HashSet::new();

        let blobs_dir = self.layout.blobs_dir();
        for entry in WalkDir::new(&blobs_dir).min_depth(2).max_depth(2) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable blob entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(TEMP_PREFIX) {
                remove_stale_temp(entry.path(), &mut report);
                continue;
            }
            if !is_valid_hash(&name) {
                debug!(path = %entry.path().display(), "Ignoring foreign file in blob directory");
                continue;
            }

            if self.counts.get(&name).unwrap_or(0) > 0 {
                live.insert(name);
                continue;
            }

            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            match std::fs::remove_file(entry.path()) {
                Ok(()) => {
                    report.deleted_count += 1;
                    report.reclaimed_bytes += size;
                    self.counts.remove(&name);
                    self.descriptors.remove(&name);
                    remove_if_present(&self.layout.descriptor_path(&name));
                    debug!(hash = %name, bytes = size, "Collected unreferenced blob");
                }
                Err(e) => {
                    warn!(hash = %name, error = %e, "Failed to delete blob, skipping");
                    report.failed_deletions += 1;
                    live.insert(name);
                }
            }
        }

        let unbacked: Vec<(String, u64)> = self
            .counts
            .iter()
            .filter(|(hash, _)| !live.contains(*hash))
            .map(|(hash, count)| (hash.clone(), *count))
            .collect();
        for (hash, count) in unbacked {
            if count == 0 {
                self.counts.remove(&hash);
                self.descriptors.remove(&hash);
            } else {
                warn!(hash = %hash, references = count, "Referenced blob is missing from disk");
                report.dangling_references += 1;
            }
        }

        self.sweep_metadata_dir(&live, &mut report);
        self.counts.flush()?;
        remove_empty_shards(&blobs_dir);

        info!(
            deleted = report.deleted_count,
            reclaimed_bytes = report.reclaimed_bytes,
            failed = report.failed_deletions,
            dangling = report.dangling_references,
            "Garbage collection finished"
        );
        Ok(report)
    }

    /// Drop descriptors for blobs that no longer exist and are not referenced.
    fn sweep_metadata_dir(&mut self, live: &HashSet<String>, report: &mut GcReport) {
        let metadata_dir = self.layout.metadata_dir();
        let Ok(entries) = std::fs::read_dir(&metadata_dir) else {
            return;
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(TEMP_PREFIX) {
                remove_stale_temp(&path, report);
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some(DESCRIPTOR_EXTENSION) {
                continue;
            }
            let Some(hash) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if live.contains(hash) || self.counts.get(hash).unwrap_or(0) > 0 {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    self.descriptors.remove(hash);
                    debug!(hash = %hash, "Removed orphan descriptor");
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to remove orphan descriptor");
                    report.failed_deletions += 1;
                }
            }
        }
    }
}

fn remove_stale_temp(path: &Path, report: &mut GcReport) {
    if let Err(e) = std::fs::remove_file(path) {
        warn!(path = %path.display(), error = %e, "Failed to remove stale temp file");
        report.failed_deletions += 1;
    }
}

fn remove_if_present(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove descriptor"),
    }
}

fn remove_empty_shards(blobs_dir: &Path) {
    let Ok(shards) = std::fs::read_dir(blobs_dir) else {
        return;
    };
    for shard in shards.flatten() {
        // remove_dir refuses non-empty directories
        let _ = std::fs::remove_dir(shard.path());
    }
}
