//! 处理报告模型
//!
//! 定义附件处理过程中的结果和错误模型：
//! - 单个附件的处理阶段与失败原因
//! - 每个父记录的处理汇总
//! - 批量导入的全局汇总

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::AppError;
use crate::models::AttachmentRecord;

/// Transient attachment produced by carving or handed over by a content source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedAttachment {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Bytes,
    pub original_source_id: String,
}

impl ExtractedAttachment {
    pub fn new(
        filename: impl Into<String>,
        mime_type: Option<String>,
        bytes: impl Into<Bytes>,
        original_source_id: impl Into<String>,
    ) -> Self {
        Self {
            filename: filename.into(),
            mime_type,
            bytes: bytes.into(),
            original_source_id: original_source_id.into(),
        }
    }
}

/// 附件处理阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStage {
    Discovered,
    Analyzed,
    Stored,
    Linked,
}

/// The step that was running when an item failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStep {
    Analyze,
    Store,
    Record,
    Link,
}

impl PipelineStep {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineStep::Analyze => "analyze",
            PipelineStep::Store => "store",
            PipelineStep::Record => "record",
            PipelineStep::Link => "link",
        }
    }
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 成功处理的附件
#[derive(Debug, Clone, PartialEq)]
pub struct StoredAttachment {
    pub record: AttachmentRecord,
    /// `true` when the bytes were already present and only a reference was added.
    pub deduplicated: bool,
    pub stored_size: u64,
    pub stage: ItemStage,
}

/// 处理失败详情
///
/// Keeps the failing step and the last stage the item reached so the cause
/// can be diagnosed without re-running the item.
#[derive(Debug)]
pub struct ProcessingFailure {
    pub item: String,
    pub parent_id: String,
    pub step: PipelineStep,
    pub reached: ItemStage,
    pub error: AppError,
}

impl ProcessingFailure {
    pub fn new(
        item: impl Into<String>,
        parent_id: impl Into<String>,
        step: PipelineStep,
        reached: ItemStage,
        error: AppError,
    ) -> Self {
        Self {
            item: item.into(),
            parent_id: parent_id.into(),
            step,
            reached,
            error,
        }
    }

    pub fn reason(&self) -> String {
        self.error.to_string()
    }

    pub fn into_error(self) -> AppError {
        AppError::ProcessingFailed {
            item: self.item,
            step: self.step.name().to_string(),
            reason: self.error.to_string(),
        }
    }
}

impl fmt::Display for ProcessingFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (parent {}) failed at {}: {}",
            self.item, self.parent_id, self.step, self.error
        )
    }
}

/// `(item, reason)` pair surfaced in bulk summaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub parent_id: String,
    pub item: String,
    pub step: Option<PipelineStep>,
    pub reason: String,
}

impl From<&ProcessingFailure> for FailureEntry {
    fn from(failure: &ProcessingFailure) -> Self {
        Self {
            parent_id: failure.parent_id.clone(),
            item: failure.item.clone(),
            step: Some(failure.step),
            reason: failure.reason(),
        }
    }
}

/// 单个父记录的处理汇总
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParentOutcome {
    pub parent_id: String,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub deduplicated: usize,
    pub elapsed: Duration,
    pub failures: Vec<FailureEntry>,
}

/// 批量处理的全局汇总
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateResult {
    pub parents: Vec<ParentOutcome>,
    pub total_processed: usize,
    pub total_succeeded: usize,
    pub total_failed: usize,
    pub elapsed: Duration,
    pub items_per_second: f64,
}

impl AggregateResult {
    pub fn from_parents(parents: Vec<ParentOutcome>, elapsed: Duration) -> Self {
        let total_processed = parents.iter().map(|p| p.processed).sum();
        let total_succeeded = parents.iter().map(|p| p.succeeded).sum();
        let total_failed = parents.iter().map(|p| p.failed).sum();
        let seconds = elapsed.as_secs_f64();
        let items_per_second = if seconds > 0.0 {
            total_processed as f64 / seconds
        } else {
            0.0
        };

        Self {
            parents,
            total_processed,
            total_succeeded,
            total_failed,
            elapsed,
            items_per_second,
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &FailureEntry> {
        self.parents.iter().flat_map(|p| p.failures.iter())
    }

    /// "N succeeded / M failed"
    pub fn summary(&self) -> String {
        format!(
            "{} succeeded / {} failed",
            self.total_succeeded, self.total_failed
        )
    }
}
