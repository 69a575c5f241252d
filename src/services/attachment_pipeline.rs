//! 附件处理流水线
//!
//! Every attachment goes analyze → store → record → link. Batch and bulk
//! calls fan out with `futures::stream::buffered`, so concurrency stays
//! bounded and nothing outlives the call that started it.

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{RwLock, RwLockReadGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::carving;
use super::collaborators::{ParentRecordStore, RawContent, RawContentSource, RecordPatch};
use super::content_analyzer::ContentAnalyzer;
use super::processing_metrics::{MetricsSnapshot, ProcessingMetrics};
use crate::error::{AppError, Result};
use crate::infrastructure::config::PipelineConfig;
use crate::models::{
    AggregateResult, AttachmentRecord, ExtractedAttachment, FailureEntry, ItemStage,
    ParentOutcome, PipelineStep, ProcessingFailure, StoredAttachment,
};
use crate::storage::{now_millis, BlobStore, MetadataStore};

/// Outcome of a single item.
pub type ItemResult = std::result::Result<StoredAttachment, ProcessingFailure>;

#[derive(Clone)]
pub struct AttachmentPipeline {
    blobs: BlobStore,
    index: MetadataStore,
    analyzer: Arc<ContentAnalyzer>,
    parents: Arc<dyn ParentRecordStore>,
    source: Option<Arc<dyn RawContentSource>>,
    config: PipelineConfig,
    metrics: Arc<ProcessingMetrics>,
    /// Shared by every span that changes a reference count and the index
    /// together; `rebuild_reference_counts` takes it exclusively.
    ingest_gate: Arc<RwLock<()>>,
}

impl fmt::Debug for AttachmentPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachmentPipeline")
            .field("blobs", &self.blobs)
            .field("config", &self.config)
            .field("has_source", &self.source.is_some())
            .finish()
    }
}

impl AttachmentPipeline {
    pub fn new(
        blobs: BlobStore,
        index: MetadataStore,
        analyzer: Arc<ContentAnalyzer>,
        parents: Arc<dyn ParentRecordStore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            blobs,
            index,
            analyzer,
            parents,
            source: None,
            config,
            metrics: Arc::new(ProcessingMetrics::new()),
            ingest_gate: Arc::new(RwLock::new(())),
        }
    }

    /// Attach the collaborator `extract_from_source` falls back to.
    pub fn with_source(mut self, source: Arc<dyn RawContentSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn blob_store(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn index(&self) -> &MetadataStore {
        &self.index
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Hold off `rebuild_reference_counts` while the guard lives.
    ///
    /// Callers that pair `blob_store().store` with `index().insert` outside
    /// the pipeline take this across both calls, otherwise a rebuild in
    /// between drops the fresh reference and the next GC deletes the blob.
    /// Do not call pipeline methods while holding it.
    pub async fn ingest_guard(&self) -> RwLockReadGuard<'_, ()> {
        self.ingest_gate.read().await
    }

    /// Collect the attachments of `parent_id`.
    ///
    /// A given container is carved directly. Otherwise the raw-content
    /// source is asked; pre-split attachments come back unchanged and a
    /// container is carved. Signatures without a terminator are skipped.
    ///
    /// # Errors
    ///
    /// `ExtractionFailed` when no source is configured or the source fails.
    pub async fn extract_from_source(
        &self,
        parent_id: &str,
        container: Option<Bytes>,
    ) -> Result<Vec<ExtractedAttachment>> {
        let content = match container {
            Some(bytes) => RawContent::Container(bytes),
            None => {
                let source = self.source.as_ref().ok_or_else(|| {
                    AppError::ExtractionFailed(format!(
                        "No raw-content source configured for parent {}",
                        parent_id
                    ))
                })?;
                source.fetch(parent_id).await.map_err(|e| {
                    AppError::ExtractionFailed(format!(
                        "Failed to fetch raw content for parent {}: {}",
                        parent_id, e
                    ))
                })?
            }
        };

        let attachments = match content {
            RawContent::Attachments(items) => items,
            RawContent::Container(bytes) => {
                let parent = parent_id.to_string();
                tokio::task::spawn_blocking(move || carving::carve(&bytes, &parent))
                    .await
                    .map_err(|e| AppError::Internal(format!("Carving task panicked: {}", e)))?
            }
        };

        debug!(
            parent_id,
            count = attachments.len(),
            "Extracted attachments"
        );
        Ok(attachments)
    }

    /// Run one attachment through the pipeline.
    ///
    /// If recording or linking fails after the store, the reference taken is
    /// released and any written record deleted before the failure is returned.
    pub async fn process_one(&self, parent_id: &str, attachment: ExtractedAttachment) -> ItemResult {
        let started = Instant::now();
        self.metrics.record_attempt();

        let result = self.run_item(parent_id, attachment).await;
        match &result {
            Ok(stored) => {
                self.metrics
                    .record_success(stored.record.file_size, stored.deduplicated, started.elapsed());
            }
            Err(failure) => {
                warn!(
                    parent_id,
                    item = %failure.item,
                    step = %failure.step,
                    error = %failure.error,
                    "Attachment processing failed"
                );
                self.metrics.record_failure(failure.step, started.elapsed());
            }
        }
        result
    }

    async fn run_item(&self, parent_id: &str, attachment: ExtractedAttachment) -> ItemResult {
        let ExtractedAttachment {
            filename,
            mime_type,
            bytes,
            ..
        } = attachment;
        let fail = |step, reached, error| {
            ProcessingFailure::new(filename.clone(), parent_id, step, reached, error)
        };

        // Analyze
        let analyzer = Arc::clone(&self.analyzer);
        let (content, name, declared) = (bytes.clone(), filename.clone(), mime_type.clone());
        let analysis = tokio::task::spawn_blocking(move || {
            analyzer.analyze(&content, Some(&name), declared.as_deref())
        })
        .await
        .map_err(|e| AppError::Internal(format!("Analysis task panicked: {}", e)))
        .and_then(|r| r)
        .map_err(|e| fail(PipelineStep::Analyze, ItemStage::Discovered, e))?;

        // Store; the reference and its record land under one gate hold
        let _ingest = self.ingest_gate.read().await;
        let file_size = bytes.len() as u64;
        let outcome = self
            .blobs
            .store(bytes, Some(&filename), Some(&analysis.detected_mime_type))
            .await
            .map_err(|e| fail(PipelineStep::Store, ItemStage::Analyzed, e))?;

        // Record
        let now = now_millis();
        let record = AttachmentRecord {
            id: Uuid::new_v4().to_string(),
            content_hash: outcome.content_hash.clone(),
            original_filename: filename.clone(),
            declared_mime_type: mime_type,
            detected_mime_type: analysis.detected_mime_type,
            content_category: analysis.content_category,
            file_size,
            parent_record_id: parent_id.to_string(),
            extracted_metadata: analysis.extracted_metadata,
            created_at: now,
            last_accessed_at: now,
        };
        if let Err(e) = self.index.insert(&record).await {
            self.release(&record.content_hash).await;
            return Err(fail(PipelineStep::Record, ItemStage::Stored, e));
        }

        // Link
        if let Err(e) = self.link(parent_id, &record.id).await {
            if let Err(delete_error) = self.index.delete(&record.id).await {
                warn!(id = %record.id, error = %delete_error, "Failed to roll back attachment record");
            }
            self.release(&record.content_hash).await;
            return Err(fail(PipelineStep::Link, ItemStage::Stored, e));
        }

        debug!(
            parent_id,
            id = %record.id,
            hash = %record.content_hash,
            deduplicated = !outcome.was_newly_stored,
            "Attachment linked"
        );
        Ok(StoredAttachment {
            record,
            deduplicated: !outcome.was_newly_stored,
            stored_size: outcome.stored_size,
            stage: ItemStage::Linked,
        })
    }

    async fn link(&self, parent_id: &str, attachment_id: &str) -> Result<()> {
        if self.parents.get_record(parent_id).await?.is_none() {
            return Err(AppError::not_found(format!("Parent record {}", parent_id)));
        }
        self.parents
            .update_record(parent_id, RecordPatch::add(attachment_id))
            .await
    }

    /// Give back a reference taken by a store that could not complete.
    async fn release(&self, hash: &str) {
        if let Err(e) = self.blobs.decrement_reference(hash).await {
            warn!(hash, error = %e, "Failed to release reference; rebuild_reference_counts repairs this");
        }
    }

    /// Process `attachments` for one parent. Results keep the input order.
    pub async fn process_batch(
        &self,
        parent_id: &str,
        attachments: Vec<ExtractedAttachment>,
    ) -> Vec<ItemResult> {
        let batch_size = self.config.batch_size.max(1);
        let concurrency = self.config.max_concurrent_operations.max(1);
        let mut results = Vec::with_capacity(attachments.len());
        let mut items = attachments.into_iter().peekable();

        while items.peek().is_some() {
            let chunk: Vec<_> = items.by_ref().take(batch_size).collect();
            let outcomes: Vec<ItemResult> = stream::iter(chunk)
                .map(|attachment| self.process_one(parent_id, attachment))
                .buffered(concurrency)
                .collect()
                .await;
            results.extend(outcomes);
        }

        let failed = results.iter().filter(|r| r.is_err()).count();
        info!(
            parent_id,
            total = results.len(),
            failed,
            "Batch processed"
        );
        results
    }

    /// Extract and process every parent in `parent_ids`.
    ///
    /// Parents run concurrently up to `max_concurrent_parents`; attachments
    /// within a parent run one after another. A parent whose content cannot
    /// be extracted counts as one failed item with no step.
    pub async fn process_bulk(&self, parent_ids: &[String]) -> AggregateResult {
        let started = Instant::now();
        let concurrency = self.config.max_concurrent_parents.max(1);

        let parents: Vec<ParentOutcome> = stream::iter(parent_ids)
            .map(|parent_id| self.process_parent(parent_id))
            .buffered(concurrency)
            .collect()
            .await;

        let result = AggregateResult::from_parents(parents, started.elapsed());
        info!(
            parents = parent_ids.len(),
            elapsed_ms = result.elapsed.as_millis() as u64,
            items_per_second = result.items_per_second,
            "Bulk processing finished: {}",
            result.summary()
        );
        result
    }

    async fn process_parent(&self, parent_id: &str) -> ParentOutcome {
        let started = Instant::now();
        let mut outcome = ParentOutcome {
            parent_id: parent_id.to_string(),
            ..Default::default()
        };

        let attachments = match self.extract_from_source(parent_id, None).await {
            Ok(attachments) => attachments,
            Err(e) => {
                warn!(parent_id, error = %e, "Skipping parent");
                outcome.processed = 1;
                outcome.failed = 1;
                outcome.failures.push(FailureEntry {
                    parent_id: parent_id.to_string(),
                    item: parent_id.to_string(),
                    step: None,
                    reason: e.to_string(),
                });
                outcome.elapsed = started.elapsed();
                return outcome;
            }
        };

        for attachment in attachments {
            outcome.processed += 1;
            match self.process_one(parent_id, attachment).await {
                Ok(stored) => {
                    outcome.succeeded += 1;
                    if stored.deduplicated {
                        outcome.deduplicated += 1;
                    }
                }
                Err(failure) => {
                    outcome.failed += 1;
                    outcome.failures.push(FailureEntry::from(&failure));
                }
            }
        }

        outcome.elapsed = started.elapsed();
        outcome
    }

    /// `process_batch` that stops when `token` fires.
    ///
    /// Cancellation drops every in-flight item. A store already handed to
    /// the writer still completes, so its reference may outlive the call
    /// until `rebuild_reference_counts` runs.
    pub async fn process_batch_cancellable(
        &self,
        parent_id: &str,
        attachments: Vec<ExtractedAttachment>,
        token: &CancellationToken,
    ) -> Result<Vec<ItemResult>> {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                warn!(parent_id, "Batch processing cancelled");
                Err(AppError::Cancelled(format!("Batch for parent {}", parent_id)))
            }
            results = self.process_batch(parent_id, attachments) => Ok(results),
        }
    }

    /// `process_bulk` that stops when `token` fires.
    pub async fn process_bulk_cancellable(
        &self,
        parent_ids: &[String],
        token: &CancellationToken,
    ) -> Result<AggregateResult> {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                warn!(parents = parent_ids.len(), "Bulk processing cancelled");
                Err(AppError::Cancelled(format!("Bulk run over {} parents", parent_ids.len())))
            }
            result = self.process_bulk(parent_ids) => Ok(result),
        }
    }

    /// Drop every attachment of `parent_id`.
    ///
    /// Records go first, in one transaction; then each blob loses a
    /// reference and the parent's list is cleared. Returns the removed
    /// records. Bytes stay on disk until the next GC.
    pub async fn remove_parent(&self, parent_id: &str) -> Result<Vec<AttachmentRecord>> {
        let _ingest = self.ingest_gate.read().await;
        let removed = self.index.delete_for_parent(parent_id).await?;
        if removed.is_empty() {
            return Ok(removed);
        }

        for record in &removed {
            self.release(&record.content_hash).await;
        }

        let ids = removed.iter().map(|r| r.id.clone()).collect();
        match self
            .parents
            .update_record(parent_id, RecordPatch::remove(ids))
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(parent_id, "Parent record already gone");
            }
            Err(e) => return Err(e),
        }

        info!(parent_id, removed = removed.len(), "Parent attachments removed");
        Ok(removed)
    }

    /// Drop one attachment.
    ///
    /// # Errors
    ///
    /// `NotFound` if no record has `attachment_id`.
    pub async fn remove_attachment(&self, attachment_id: &str) -> Result<AttachmentRecord> {
        let _ingest = self.ingest_gate.read().await;
        let record = self
            .index
            .get(attachment_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Attachment {}", attachment_id)))?;

        match self
            .parents
            .update_record(
                &record.parent_record_id,
                RecordPatch::remove(vec![record.id.clone()]),
            )
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(parent_id = %record.parent_record_id, "Parent record already gone");
            }
            Err(e) => return Err(e),
        }

        if self.index.delete(&record.id).await? {
            self.release(&record.content_hash).await;
        }
        Ok(record)
    }

    /// Recompute every reference count from the index and hand the result
    /// to the blob store. Returns the number of referenced blobs.
    ///
    /// Waits for in-flight items and removals to finish, and holds new ones
    /// back until the counts are replaced, so no reference taken between a
    /// store and its record is lost.
    pub async fn rebuild_reference_counts(&self) -> Result<usize> {
        let _exclusive = self.ingest_gate.write().await;
        let counts = self.index.reference_counts().await?;
        let referenced = counts.len();
        self.blobs.replace_reference_counts(counts).await?;
        info!(referenced, "Reference counts rebuilt from index");
        Ok(referenced)
    }
}
