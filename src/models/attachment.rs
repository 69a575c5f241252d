//! 附件模型
//!
//! Persisted attachment records and the content category derived from MIME.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::AppError;

/// 内容分类
///
/// Drives both the compression policy and which metadata extractor runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentCategory {
    Image,
    Document,
    Text,
    Audio,
    Video,
    Archive,
    Other,
}

impl ContentCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentCategory::Image => "image",
            ContentCategory::Document => "document",
            ContentCategory::Text => "text",
            ContentCategory::Audio => "audio",
            ContentCategory::Video => "video",
            ContentCategory::Archive => "archive",
            ContentCategory::Other => "other",
        }
    }

    /// Classify a MIME value. Parameters such as `; charset=utf-8` are ignored.
    pub fn from_mime(mime: &str) -> Self {
        let essence = mime
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        let (top, sub) = essence.split_once('/').unwrap_or((essence.as_str(), ""));

        match top {
            "image" => return ContentCategory::Image,
            "audio" => return ContentCategory::Audio,
            "video" => return ContentCategory::Video,
            "text" => return ContentCategory::Text,
            _ => {}
        }

        if sub.ends_with("+xml") || sub.ends_with("+json") {
            return ContentCategory::Text;
        }

        match sub {
            "json" | "xml" | "javascript" | "x-javascript" | "csv" | "yaml" | "x-yaml"
            | "markdown" | "x-sh" | "toml" | "sql" => ContentCategory::Text,
            "pdf" | "msword" | "rtf" => ContentCategory::Document,
            s if s.starts_with("vnd.openxmlformats")
                || s.starts_with("vnd.ms-")
                || s.starts_with("vnd.oasis.opendocument") =>
            {
                ContentCategory::Document
            }
            "zip" | "gzip" | "x-gzip" | "x-tar" | "x-7z-compressed" | "x-rar-compressed"
            | "vnd.rar" | "x-bzip2" | "zstd" | "x-xz" => ContentCategory::Archive,
            _ => ContentCategory::Other,
        }
    }

    /// Categories whose payloads are already compressed on the wire.
    pub fn is_precompressed(&self) -> bool {
        matches!(
            self,
            ContentCategory::Image
                | ContentCategory::Audio
                | ContentCategory::Video
                | ContentCategory::Archive
        )
    }
}

impl fmt::Display for ContentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentCategory {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(ContentCategory::Image),
            "document" => Ok(ContentCategory::Document),
            "text" => Ok(ContentCategory::Text),
            "audio" => Ok(ContentCategory::Audio),
            "video" => Ok(ContentCategory::Video),
            "archive" => Ok(ContentCategory::Archive),
            "other" => Ok(ContentCategory::Other),
            unknown => Err(AppError::validation_error(format!(
                "Unknown content category: {}",
                unknown
            ))),
        }
    }
}

/// 附件记录
///
/// One record per logical attachment; many records may share one blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub id: String,
    pub content_hash: String,
    pub original_filename: String,
    pub declared_mime_type: Option<String>,
    pub detected_mime_type: String,
    pub content_category: ContentCategory,
    pub file_size: u64,
    pub parent_record_id: String,
    pub extracted_metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

/// 附件查询条件
///
/// Every filter is optional; an absent filter imposes no constraint.
#[derive(Debug, Clone, Default)]
pub struct AttachmentQuery {
    pub filename_pattern: Option<String>,
    pub mime_type_pattern: Option<String>,
    /// Inclusive `(min, max)` in bytes.
    pub size_range: Option<(u64, u64)>,
    /// Inclusive range over `created_at`.
    pub date_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub limit: usize,
    pub offset: usize,
}

impl AttachmentQuery {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    pub fn filename(mut self, pattern: impl Into<String>) -> Self {
        self.filename_pattern = Some(pattern.into());
        self
    }

    pub fn mime_type(mut self, pattern: impl Into<String>) -> Self {
        self.mime_type_pattern = Some(pattern.into());
        self
    }

    pub fn size_between(mut self, min: u64, max: u64) -> Self {
        self.size_range = Some((min, max));
        self
    }

    pub fn created_between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.date_range = Some((from, to));
        self
    }

    pub fn page(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

/// 导出附带的描述文件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportSidecar {
    pub original_filename: String,
    pub mime_type: String,
    pub file_size: u64,
    pub parent_id: String,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

impl From<&AttachmentRecord> for ExportSidecar {
    fn from(record: &AttachmentRecord) -> Self {
        Self {
            original_filename: record.original_filename.clone(),
            mime_type: record.detected_mime_type.clone(),
            file_size: record.file_size,
            parent_id: record.parent_record_id.clone(),
            content_hash: record.content_hash.clone(),
            created_at: record.created_at,
            last_accessed_at: record.last_accessed_at,
        }
    }
}
