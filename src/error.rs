use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/**
 * 应用错误类型 - 使用 miette 提供用户友好的错误诊断
 *
 * Single-item operations surface these directly; batch operations wrap them
 * per item inside `ProcessingFailure` instead of returning early.
 */
#[derive(Error, Debug, Diagnostic)]
pub enum AppError {
    #[error("File too large: {size} bytes exceeds the limit of {limit} bytes")]
    #[diagnostic(
        code(store::file_too_large),
        help("Raise storage.max_file_size or split the attachment")
    )]
    FileTooLarge { size: u64, limit: u64 },

    #[error("Not found: {0}")]
    #[diagnostic(code(store::not_found))]
    NotFound(String),

    #[error("Corrupted blob {hash}: {reason}")]
    #[diagnostic(
        code(store::corrupted),
        help("Run `attachment-store verify` and restore the blob from its source")
    )]
    Corrupted { hash: String, reason: String },

    #[error("Extraction failed: {0}")]
    #[diagnostic(code(store::extraction_failed))]
    ExtractionFailed(String),

    #[error("Processing failed for {item} at step '{step}': {reason}")]
    #[diagnostic(code(store::processing_failed))]
    ProcessingFailed {
        item: String,
        step: String,
        reason: String,
    },

    #[error("IO error: {0}")]
    #[diagnostic(code(store::io_error))]
    Io(#[from] std::io::Error),

    #[error("Storage access error: {message}")]
    #[diagnostic(
        code(store::storage_access),
        help("Check that the storage directory exists and is writable")
    )]
    StorageAccess {
        message: String,
        path: Option<PathBuf>,
    },

    #[error("Unsupported type: {0}")]
    #[diagnostic(
        code(store::unsupported_type),
        help("Add the MIME type to analysis.allowed_mime_types to accept it")
    )]
    UnsupportedType(String),

    #[error("Validation error: {0}")]
    #[diagnostic(
        code(store::validation_error),
        help("Check that your input meets the required format and constraints")
    )]
    Validation(String),

    #[error("Database error: {0}")]
    #[diagnostic(
        code(store::database_error),
        help("Check database connection and schema integrity")
    )]
    DatabaseError(String),

    #[error("Configuration error: {0}")]
    #[diagnostic(code(store::config_error))]
    Config(String),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(store::serialization_error))]
    Serialization(String),

    #[error("Operation cancelled: {0}")]
    #[diagnostic(code(store::cancelled))]
    Cancelled(String),

    #[error("Internal error: {0}")]
    #[diagnostic(code(store::internal_error))]
    Internal(String),
}

impl AppError {
    /**
     * 为错误添加上下文信息
     */
    pub fn with_context(self, context: impl Into<String>) -> Self {
        let context = context.into();
        match self {
            AppError::StorageAccess { message, path } => AppError::StorageAccess {
                message: format!("{}: {}", context, message),
                path,
            },
            AppError::ExtractionFailed(message) => {
                AppError::ExtractionFailed(format!("{}: {}", context, message))
            }
            AppError::DatabaseError(message) => {
                AppError::DatabaseError(format!("{}: {}", context, message))
            }
            other => other,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        AppError::NotFound(message.into())
    }

    pub fn corrupted(hash: impl Into<String>, reason: impl Into<String>) -> Self {
        AppError::Corrupted {
            hash: hash.into(),
            reason: reason.into(),
        }
    }

    pub fn validation_error(message: impl Into<String>) -> Self {
        AppError::Validation(message.into())
    }

    pub fn database_error(message: impl Into<String>) -> Self {
        AppError::DatabaseError(message.into())
    }

    /**
     * 创建详细的存储访问错误
     */
    pub fn storage_access(message: impl Into<String>, path: Option<PathBuf>) -> Self {
        AppError::StorageAccess {
            message: message.into(),
            path,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            AppError::NotFound(_) => true,
            AppError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    pub fn is_corrupted(&self) -> bool {
        matches!(self, AppError::Corrupted { .. })
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        AppError::Serialization(error.to_string())
    }
}

impl From<sqlx::Error> for AppError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::RowNotFound => AppError::NotFound("row not found".to_string()),
            other => AppError::DatabaseError(other.to_string()),
        }
    }
}

/**
 * 统一结果类型
 */
pub type Result<T> = std::result::Result<T, AppError>;
