//! Shared helpers for the integration tests
//!
//! Each test gets its own temporary store with in-memory collaborators.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use attachment_store::application::AttachmentSystem;
use attachment_store::infrastructure::StoreConfig;
use attachment_store::models::ExtractedAttachment;
use attachment_store::services::{InMemoryContentSource, InMemoryParentRecords};
use tempfile::TempDir;

pub struct TestStore {
    pub system: AttachmentSystem,
    pub parents: Arc<InMemoryParentRecords>,
    pub source: Arc<InMemoryContentSource>,
    pub temp_dir: TempDir,
}

impl TestStore {
    pub fn base_dir(&self) -> PathBuf {
        self.system.config().storage.base_dir.clone()
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }
}

/// A store with default settings and parents `p1`..`p3` already present.
pub async fn create_test_store() -> TestStore {
    create_test_store_with(|_| {}).await
}

pub async fn create_test_store_with(customize: impl FnOnce(&mut StoreConfig)) -> TestStore {
    let temp_dir = TempDir::new().unwrap();
    let mut config = StoreConfig::with_base_dir(temp_dir.path().join("store"));
    customize(&mut config);

    let parents = Arc::new(InMemoryParentRecords::new());
    for id in ["p1", "p2", "p3"] {
        parents.insert(id);
    }
    let source = Arc::new(InMemoryContentSource::new());

    let system = AttachmentSystem::open(config, parents.clone())
        .await
        .unwrap()
        .with_source(source.clone());

    TestStore {
        system,
        parents,
        source,
        temp_dir,
    }
}

pub fn attachment(name: &str, content: &[u8]) -> ExtractedAttachment {
    ExtractedAttachment::new(name, None, content.to_vec(), "test")
}

/// SOI, APP0, SOS with `payload` as entropy data, EOI.
pub fn jpeg(payload: &[u8]) -> Vec<u8> {
    let mut jpeg = vec![0xFF, 0xD8];
    jpeg.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x06, b'J', b'F', b'I', b'F']);
    jpeg.extend_from_slice(&[0xFF, 0xDA, 0x00, 0x04, 0x01, 0x00]);
    jpeg.extend_from_slice(payload);
    jpeg.extend_from_slice(&[0xFF, 0xD9]);
    jpeg
}

/// A JPEG start with no end marker.
pub fn truncated_jpeg() -> Vec<u8> {
    vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F']
}

pub fn pdf(body: &str) -> Vec<u8> {
    format!("%PDF-1.4\n{}\n%%EOF\n", body).into_bytes()
}

/// Text that compresses well and clears the default compression threshold.
pub fn compressible_text(len: usize) -> Vec<u8> {
    b"attachment store line of text\n"
        .iter()
        .copied()
        .cycle()
        .take(len)
        .collect()
}
