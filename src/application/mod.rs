//! 应用层
//!
//! Wires storage and services together from one `StoreConfig`.

use std::sync::Arc;
use tracing::info;

use crate::error::Result;
use crate::infrastructure::config::StoreConfig;
use crate::models::GcReport;
use crate::services::{
    AttachmentPipeline, AttachmentQueryService, ContentAnalyzer, ParentRecordStore,
    RawContentSource,
};
use crate::storage::{verify_integrity, BlobStore, MetadataStore, ValidationReport};

/// Every component of one store, opened over the same base directory.
#[derive(Debug, Clone)]
pub struct AttachmentSystem {
    config: StoreConfig,
    blobs: BlobStore,
    index: MetadataStore,
    pipeline: AttachmentPipeline,
    query: AttachmentQueryService,
}

impl AttachmentSystem {
    /// Validate `config`, then open the blob store and the metadata index.
    pub async fn open(config: StoreConfig, parents: Arc<dyn ParentRecordStore>) -> Result<Self> {
        config.check()?;

        let blobs = BlobStore::open(&config.storage).await?;
        let index = MetadataStore::new(&config.storage.base_dir).await?;
        let analyzer = Arc::new(ContentAnalyzer::new(&config.analysis)?);

        let pipeline = AttachmentPipeline::new(
            blobs.clone(),
            index.clone(),
            analyzer,
            parents,
            config.pipeline.clone(),
        );
        let query = AttachmentQueryService::new(blobs.clone(), index.clone());

        info!(base_dir = %config.storage.base_dir.display(), "Attachment store opened");
        Ok(Self {
            config,
            blobs,
            index,
            pipeline,
            query,
        })
    }

    pub fn with_source(mut self, source: Arc<dyn RawContentSource>) -> Self {
        self.pipeline = self.pipeline.with_source(source);
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn blob_store(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn index(&self) -> &MetadataStore {
        &self.index
    }

    pub fn pipeline(&self) -> &AttachmentPipeline {
        &self.pipeline
    }

    pub fn query(&self) -> &AttachmentQueryService {
        &self.query
    }

    pub async fn garbage_collect(&self) -> Result<GcReport> {
        self.blobs.garbage_collect().await
    }

    pub async fn verify_integrity(&self) -> Result<ValidationReport> {
        verify_integrity(&self.blobs, &self.index).await
    }

    /// Close the index pool. The blob writer stops once every handle is gone.
    pub async fn close(&self) {
        self.index.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExtractedAttachment;
    use crate::services::InMemoryParentRecords;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_process_and_query() {
        let dir = TempDir::new().unwrap();
        let parents = Arc::new(InMemoryParentRecords::new());
        parents.insert("p1");

        let system = AttachmentSystem::open(StoreConfig::with_base_dir(dir.path()), parents)
            .await
            .unwrap();
        let stored = system
            .pipeline()
            .process_one(
                "p1",
                ExtractedAttachment::new("a.txt", None, &b"hello"[..], "test"),
            )
            .await
            .unwrap();

        let info = system.query().get_info(&stored.record.id).await.unwrap();
        assert_eq!(info.unwrap().content_hash, stored.record.content_hash);
        assert!(system.verify_integrity().await.unwrap().is_valid());
        assert_eq!(system.garbage_collect().await.unwrap().deleted_count, 0);
        system.close().await;
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = StoreConfig::with_base_dir(dir.path());
        config.pipeline.batch_size = 0;

        let result = AttachmentSystem::open(config, Arc::new(InMemoryParentRecords::new())).await;
        assert!(result.is_err());
    }
}
