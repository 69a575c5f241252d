//! 外部协作者接口
//!
//! The pipeline never owns parent records or source formats. It talks to
//! them through these traits; in-memory implementations back tests and
//! embedding.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::ExtractedAttachment;

/// The slice of a parent record this crate cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRecord {
    pub id: String,
    pub attachment_ids: Vec<String>,
}

/// Changes to a parent's attachment reference list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordPatch {
    pub add_attachments: Vec<String>,
    pub remove_attachments: Vec<String>,
}

impl RecordPatch {
    pub fn add(id: impl Into<String>) -> Self {
        Self {
            add_attachments: vec![id.into()],
            ..Default::default()
        }
    }

    pub fn remove(ids: Vec<String>) -> Self {
        Self {
            remove_attachments: ids,
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait ParentRecordStore: Send + Sync {
    async fn get_record(&self, id: &str) -> Result<Option<ParentRecord>>;

    /// Apply `patch`. An unknown parent is `NotFound`.
    async fn update_record(&self, id: &str, patch: RecordPatch) -> Result<()>;
}

/// What a raw-content source hands over for a parent.
#[derive(Debug, Clone)]
pub enum RawContent {
    /// Pre-split attachment blocks with their hints.
    Attachments(Vec<ExtractedAttachment>),
    /// One opaque container to carve.
    Container(Bytes),
}

#[async_trait]
pub trait RawContentSource: Send + Sync {
    async fn fetch(&self, parent_id: &str) -> Result<RawContent>;
}

/// DashMap-backed parent records.
#[derive(Debug, Default)]
pub struct InMemoryParentRecords {
    records: DashMap<String, ParentRecord>,
}

impl InMemoryParentRecords {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: impl Into<String>) {
        let id = id.into();
        self.records.insert(
            id.clone(),
            ParentRecord {
                id,
                attachment_ids: Vec::new(),
            },
        );
    }

    pub fn attachment_ids(&self, id: &str) -> Option<Vec<String>> {
        self.records.get(id).map(|r| r.attachment_ids.clone())
    }
}

#[async_trait]
impl ParentRecordStore for InMemoryParentRecords {
    async fn get_record(&self, id: &str) -> Result<Option<ParentRecord>> {
        Ok(self.records.get(id).map(|r| r.clone()))
    }

    async fn update_record(&self, id: &str, patch: RecordPatch) -> Result<()> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| AppError::not_found(format!("Parent record {}", id)))?;
        record
            .attachment_ids
            .retain(|existing| !patch.remove_attachments.contains(existing));
        for added in patch.add_attachments {
            if !record.attachment_ids.contains(&added) {
                record.attachment_ids.push(added);
            }
        }
        Ok(())
    }
}

/// DashMap-backed raw content, keyed by parent id.
#[derive(Debug, Default)]
pub struct InMemoryContentSource {
    content: DashMap<String, RawContent>,
}

impl InMemoryContentSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, parent_id: impl Into<String>, content: RawContent) {
        self.content.insert(parent_id.into(), content);
    }
}

#[async_trait]
impl RawContentSource for InMemoryContentSource {
    async fn fetch(&self, parent_id: &str) -> Result<RawContent> {
        self.content
            .get(parent_id)
            .map(|c| c.clone())
            .ok_or_else(|| AppError::not_found(format!("No raw content for {}", parent_id)))
    }
}
