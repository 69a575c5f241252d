//! Attachment Store
//!
//! 内容寻址附件存储：
//! - 按 SHA-256 去重的 blob 存储，带引用计数和显式垃圾回收
//! - MIME 识别与按类别的元数据提取
//! - 附件提取、批量处理与父记录关联
//! - SQLite 元数据索引、查询与导出
//!
//! ```no_run
//! use std::sync::Arc;
//! use attachment_store::application::AttachmentSystem;
//! use attachment_store::infrastructure::StoreConfig;
//! use attachment_store::models::ExtractedAttachment;
//! use attachment_store::services::InMemoryParentRecords;
//!
//! # tokio_test::block_on(async {
//! let parents = Arc::new(InMemoryParentRecords::new());
//! parents.insert("note-1");
//!
//! let system = AttachmentSystem::open(StoreConfig::with_base_dir("./data"), parents)
//!     .await
//!     .unwrap();
//! let attachment = ExtractedAttachment::new("a.txt", None, &b"hello"[..], "import");
//! let stored = system.pipeline().process_one("note-1", attachment).await.unwrap();
//! println!("{}", stored.record.content_hash);
//! # })
//! ```

pub mod application;
pub mod error;
pub mod infrastructure;
pub mod models;
pub mod services;
pub mod storage;

pub use application::AttachmentSystem;
pub use error::{AppError, Result};
