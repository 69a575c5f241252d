pub mod attachment;
pub mod blob;
pub mod processing_report;

// 重新导出核心类型
pub use attachment::{AttachmentQuery, AttachmentRecord, ContentCategory, ExportSidecar};
pub use blob::{BlobDescriptor, GcReport, StoreOutcome, StoreStats};
pub use processing_report::{
    AggregateResult, ExtractedAttachment, FailureEntry, ItemStage, ParentOutcome,
    PipelineStep, ProcessingFailure, StoredAttachment,
};
