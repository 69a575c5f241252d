//! 服务层
//!
//! Content analysis, carving and the attachment pipeline, plus the read-side
//! query service. Everything here sits on top of `storage`.

pub mod attachment_pipeline;
pub mod attachment_query;
pub mod carving;
pub mod collaborators;
pub mod content_analyzer;
pub mod metadata_extractors;
pub mod mime_detector;
pub mod processing_metrics;

pub use attachment_pipeline::{AttachmentPipeline, ItemResult};
pub use attachment_query::{sidecar_path, AttachmentQueryService};
pub use carving::{carve, find_embedded, CarvedRange, EmbeddedKind};
pub use collaborators::{
    InMemoryContentSource, InMemoryParentRecords, ParentRecord, ParentRecordStore, RawContent,
    RawContentSource, RecordPatch,
};
pub use content_analyzer::{ContentAnalysis, ContentAnalyzer};
pub use metadata_extractors::{ExtractorRegistry, MetadataExtractor, MetadataMap};
pub use mime_detector::{MimeAllowList, MimeSource};
pub use processing_metrics::{MetricsSnapshot, ProcessingMetrics};
