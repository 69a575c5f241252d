//! 附件查询与导出
//!
//! Read side of the store: index lookups, content reads and export.

use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::{NamedTempFile, TempPath};
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::models::{AttachmentQuery, AttachmentRecord, ExportSidecar};
use crate::storage::{now_millis, BlobStore, MetadataStore};

#[derive(Debug, Clone)]
pub struct AttachmentQueryService {
    blobs: BlobStore,
    index: MetadataStore,
}

impl AttachmentQueryService {
    pub fn new(blobs: BlobStore, index: MetadataStore) -> Self {
        Self { blobs, index }
    }

    /// Records of `parent_id` in creation order.
    pub async fn get_for_parent(&self, parent_id: &str) -> Result<Vec<AttachmentRecord>> {
        self.index.get_for_parent(parent_id).await
    }

    pub async fn search_by_filename_pattern(
        &self,
        pattern: &str,
        limit: usize,
    ) -> Result<Vec<AttachmentRecord>> {
        self.index.search_by_filename_pattern(pattern, limit).await
    }

    pub async fn search_by_mime_type(
        &self,
        mime: &str,
        limit: usize,
    ) -> Result<Vec<AttachmentRecord>> {
        self.index.search_by_mime_type(mime, limit).await
    }

    pub async fn search_advanced(&self, query: &AttachmentQuery) -> Result<Vec<AttachmentRecord>> {
        self.index.search_advanced(query).await
    }

    /// `None` for an unknown id.
    pub async fn get_info(&self, attachment_id: &str) -> Result<Option<AttachmentRecord>> {
        self.index.get(attachment_id).await
    }

    /// Record plus verified bytes. Marks the record as accessed.
    pub async fn read_content(&self, attachment_id: &str) -> Result<(AttachmentRecord, Vec<u8>)> {
        let mut record = self
            .index
            .get(attachment_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Attachment {}", attachment_id)))?;

        let content = self.blobs.retrieve(&record.content_hash).await?;

        let now = now_millis();
        self.index.touch(&record.id, now).await?;
        record.last_accessed_at = now;
        Ok((record, content))
    }

    /// Write the attachment's bytes to `destination` and its sidecar to
    /// `destination` + `.meta`.
    ///
    /// Both files are staged next to the destination first. A file already
    /// at `destination` is moved aside and only dropped once both renames
    /// have succeeded; on failure it is put back, so a failed export leaves
    /// the directory as it found it.
    pub async fn export(&self, attachment_id: &str, destination: &Path) -> Result<ExportSidecar> {
        let (record, content) = self.read_content(attachment_id).await?;
        let sidecar = ExportSidecar::from(&record);
        let sidecar_json = serde_json::to_vec_pretty(&sidecar)?;

        let target = destination.to_path_buf();
        tokio::task::spawn_blocking(move || write_export_pair(&target, &content, &sidecar_json))
            .await
            .map_err(|e| AppError::Internal(format!("Export task panicked: {}", e)))??;

        info!(
            id = %record.id,
            destination = %destination.display(),
            "Attachment exported"
        );
        Ok(sidecar)
    }
}

/// `destination` with `.meta` appended to the full file name.
pub fn sidecar_path(destination: &Path) -> PathBuf {
    let mut name = OsString::from(destination.as_os_str());
    name.push(".meta");
    PathBuf::from(name)
}

fn write_export_pair(destination: &Path, content: &[u8], sidecar: &[u8]) -> Result<()> {
    let dir = match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(|e| {
        AppError::storage_access(
            format!("Failed to create export directory: {}", e),
            Some(dir.to_path_buf()),
        )
    })?;

    let staged_content = stage(dir, content)?;
    let staged_sidecar = stage(dir, sidecar)?;
    let sidecar_target = sidecar_path(destination);
    let previous = set_aside(dir, destination)?;

    let written = scopeguard::guard(
        (destination.to_path_buf(), previous),
        |(path, previous)| match previous {
            Some(previous) => {
                debug!(path = %path.display(), "Restoring file replaced by failed export");
                if let Err(e) = std::fs::rename(&previous, &path) {
                    warn!(path = %path.display(), error = %e, "Failed to restore previous file");
                }
            }
            None => {
                debug!(path = %path.display(), "Removing half-written export");
                let _ = std::fs::remove_file(&path);
            }
        },
    );

    staged_content
        .persist(destination)
        .map_err(|e| rename_error(e.error, destination))?;
    staged_sidecar
        .persist(&sidecar_target)
        .map_err(|e| rename_error(e.error, &sidecar_target))?;

    // dropping the set-aside path deletes the replaced file
    let _ = scopeguard::ScopeGuard::into_inner(written);
    Ok(())
}

/// Move an existing file at `destination` to a temp path in `dir`.
fn set_aside(dir: &Path, destination: &Path) -> Result<Option<TempPath>> {
    if !destination.is_file() {
        return Ok(None);
    }
    let holder = tempfile::Builder::new()
        .prefix(".export-")
        .suffix(".prev")
        .tempfile_in(dir)
        .map_err(|e| {
            AppError::storage_access(
                format!("Failed to create temp file: {}", e),
                Some(dir.to_path_buf()),
            )
        })?
        .into_temp_path();
    std::fs::rename(destination, &holder).map_err(|e| {
        AppError::storage_access(
            format!("Failed to move existing file aside: {}", e),
            Some(destination.to_path_buf()),
        )
    })?;
    Ok(Some(holder))
}

fn stage(dir: &Path, content: &[u8]) -> Result<NamedTempFile> {
    let mut temp = tempfile::Builder::new()
        .prefix(".export-")
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
    Ok(temp)
}

fn rename_error(error: std::io::Error, target: &Path) -> AppError {
    AppError::storage_access(
        format!("Failed to move export into place: {}", error),
        Some(target.to_path_buf()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::config::StorageConfig;
    use crate::models::ContentCategory;
    use tempfile::TempDir;

    async fn service(dir: &Path) -> AttachmentQueryService {
        let config = StorageConfig {
            base_dir: dir.join("store"),
            ..Default::default()
        };
        let blobs = BlobStore::open(&config).await.unwrap();
        let index = MetadataStore::new(&config.base_dir).await.unwrap();
        AttachmentQueryService::new(blobs, index)
    }

    async fn add(service: &AttachmentQueryService, id: &str, content: &[u8]) -> AttachmentRecord {
        let outcome = service.blobs.store(content.to_vec(), Some("a.txt"), None).await.unwrap();
        let now = now_millis();
        let record = AttachmentRecord {
            id: id.to_string(),
            content_hash: outcome.content_hash,
            original_filename: "a.txt".to_string(),
            declared_mime_type: None,
            detected_mime_type: "text/plain".to_string(),
            content_category: ContentCategory::Text,
            file_size: content.len() as u64,
            parent_record_id: "p1".to_string(),
            extracted_metadata: Default::default(),
            created_at: now,
            last_accessed_at: now,
        };
        service.index.insert(&record).await.unwrap();
        record
    }

    #[tokio::test]
    async fn test_get_info_is_optional() {
        let dir = TempDir::new().unwrap();
        let service = service(dir.path()).await;
        add(&service, "a1", b"hello").await;

        assert!(service.get_info("a1").await.unwrap().is_some());
        assert!(service.get_info("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_content_touches_record() {
        let dir = TempDir::new().unwrap();
        let service = service(dir.path()).await;
        let added = add(&service, "a1", b"hello").await;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let (record, content) = service.read_content("a1").await.unwrap();

        assert_eq!(content, b"hello");
        assert!(record.last_accessed_at > added.last_accessed_at);
        let stored = service.get_info("a1").await.unwrap().unwrap();
        assert_eq!(stored.last_accessed_at, record.last_accessed_at);
    }

    #[tokio::test]
    async fn test_export_writes_content_and_sidecar() {
        let dir = TempDir::new().unwrap();
        let service = service(dir.path()).await;
        let record = add(&service, "a1", b"hello").await;
        let destination = dir.path().join("out").join("a.txt");

        let sidecar = service.export("a1", &destination).await.unwrap();

        assert_eq!(std::fs::read(&destination).unwrap(), b"hello");
        let written: ExportSidecar =
            serde_json::from_slice(&std::fs::read(sidecar_path(&destination)).unwrap()).unwrap();
        assert_eq!(written, sidecar);
        assert_eq!(written.content_hash, record.content_hash);
        assert_eq!(written.file_size, 5);
        assert_eq!(written.parent_id, "p1");
    }

    #[tokio::test]
    async fn test_failed_export_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let service = service(dir.path()).await;
        add(&service, "a1", b"hello").await;
        let destination = dir.path().join("a.txt");
        // a directory where the sidecar should go makes the second rename fail
        std::fs::create_dir_all(sidecar_path(&destination).join("occupied")).unwrap();

        assert!(service.export("a1", &destination).await.is_err());
        assert!(!destination.exists());

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".export-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_failed_export_keeps_existing_destination() {
        let dir = TempDir::new().unwrap();
        let service = service(dir.path()).await;
        add(&service, "a1", b"hello").await;
        let destination = dir.path().join("out.txt");
        std::fs::write(&destination, b"earlier export").unwrap();
        std::fs::create_dir_all(sidecar_path(&destination).join("occupied")).unwrap();

        assert!(service.export("a1", &destination).await.is_err());

        assert_eq!(std::fs::read(&destination).unwrap(), b"earlier export");
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".export-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_export_replaces_existing_destination() {
        let dir = TempDir::new().unwrap();
        let service = service(dir.path()).await;
        add(&service, "a1", b"hello").await;
        let destination = dir.path().join("out.txt");
        std::fs::write(&destination, b"earlier export").unwrap();

        service.export("a1", &destination).await.unwrap();

        assert_eq!(std::fs::read(&destination).unwrap(), b"hello");
        assert!(sidecar_path(&destination).is_file());
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".export-"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_export_unknown_attachment() {
        let dir = TempDir::new().unwrap();
        let service = service(dir.path()).await;
        let error = service
            .export("nope", &dir.path().join("x"))
            .await
            .unwrap_err();
        assert!(error.is_not_found());
    }

    #[test]
    fn test_sidecar_path_appends_suffix() {
        assert_eq!(
            sidecar_path(Path::new("/tmp/report.pdf")),
            PathBuf::from("/tmp/report.pdf.meta")
        );
    }
}
