//! SQLite Metadata Index
//!
//! Persists one [`AttachmentRecord`] per logical attachment and answers the
//! parent, filename, MIME, size and date lookups.
//!
//! ## Database Schema
//!
//! - `attachments`: record id, content hash, filename, declared and detected
//!   MIME, category, size, parent id, extracted metadata (JSON text) and
//!   millisecond timestamps
//!
//! Search results come back most recently accessed first; `get_for_parent`
//! returns creation order.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use super::layout::INDEX_DB_FILE;
use crate::error::{AppError, Result};
use crate::models::{AttachmentQuery, AttachmentRecord, ContentCategory};

const RECENT_FIRST: &str = " ORDER BY last_accessed_at DESC, created_at DESC, rowid DESC";

/// SQLite metadata index
#[derive(Debug, Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    /// Open the index at `<base_dir>/attachments.db`, creating it if needed.
    pub async fn new(base_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(base_dir).await.map_err(|e| {
            AppError::storage_access(
                format!("Failed to create store directory: {}", e),
                Some(base_dir.to_path_buf()),
            )
        })?;

        let db_path = base_dir.join(INDEX_DB_FILE);
        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());

        info!(path = %db_path.display(), "Opening metadata index");

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(&db_url)
            .await
            .map_err(|e| {
                AppError::database_error(format!("Failed to connect to database: {}", e))
            })?;

        // WAL lets searches run while the pipeline writes
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await
            .map_err(|e| AppError::database_error(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&pool)
            .await
            .map_err(|e| {
                AppError::database_error(format!("Failed to set synchronous mode: {}", e))
            })?;

        Self::init_schema(&pool).await?;

        Ok(Self { pool })
    }

    async fn init_schema(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS attachments (
                id TEXT PRIMARY KEY NOT NULL,
                content_hash TEXT NOT NULL,
                original_filename TEXT NOT NULL,
                declared_mime_type TEXT,
                detected_mime_type TEXT NOT NULL,
                content_category TEXT NOT NULL,
                file_size INTEGER NOT NULL,
                parent_record_id TEXT NOT NULL,
                extracted_metadata TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL,
                last_accessed_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(|e| {
            AppError::database_error(format!("Failed to create attachments table: {}", e))
        })?;

        for statement in [
            "CREATE INDEX IF NOT EXISTS idx_attachments_parent ON attachments(parent_record_id, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_attachments_hash ON attachments(content_hash)",
            "CREATE INDEX IF NOT EXISTS idx_attachments_mime ON attachments(detected_mime_type)",
            "CREATE INDEX IF NOT EXISTS idx_attachments_accessed ON attachments(last_accessed_at)",
        ] {
            sqlx::query(statement)
                .execute(pool)
                .await
                .map_err(|e| AppError::database_error(format!("Failed to create index: {}", e)))?;
        }

        debug!("Metadata index schema ready");
        Ok(())
    }

    pub async fn insert(&self, record: &AttachmentRecord) -> Result<()> {
        let metadata = serde_json::to_string(&record.extracted_metadata)?;
        sqlx::query(
            r#"
            INSERT INTO attachments (
                id, content_hash, original_filename, declared_mime_type,
                detected_mime_type, content_category, file_size, parent_record_id,
                extracted_metadata, created_at, last_accessed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.content_hash)
        .bind(&record.original_filename)
        .bind(&record.declared_mime_type)
        .bind(&record.detected_mime_type)
        .bind(record.content_category.as_str())
        .bind(record.file_size as i64)
        .bind(&record.parent_record_id)
        .bind(metadata)
        .bind(record.created_at.timestamp_millis())
        .bind(record.last_accessed_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database_error(format!("Failed to insert attachment: {}", e)))?;

        debug!(id = %record.id, hash = %record.content_hash, "Attachment recorded");
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<AttachmentRecord>> {
        let row = sqlx::query("SELECT * FROM attachments WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::database_error(format!("Failed to query attachment: {}", e)))?;

        row.as_ref().map(row_to_record).transpose()
    }

    /// Records for a parent in creation order; insertion order breaks ties.
    pub async fn get_for_parent(&self, parent_id: &str) -> Result<Vec<AttachmentRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM attachments WHERE parent_record_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::database_error(format!("Failed to query parent attachments: {}", e))
        })?;

        rows.iter().map(row_to_record).collect()
    }

    /// Case-insensitive filename match. `*` and `?` are wildcards; a pattern
    /// without wildcards matches anywhere in the name.
    pub async fn search_by_filename_pattern(
        &self,
        pattern: &str,
        limit: usize,
    ) -> Result<Vec<AttachmentRecord>> {
        self.search_advanced(&AttachmentQuery::new(limit).filename(pattern))
            .await
    }

    /// Exact detected MIME, or a whole top-level type with `image/*`.
    pub async fn search_by_mime_type(
        &self,
        mime: &str,
        limit: usize,
    ) -> Result<Vec<AttachmentRecord>> {
        self.search_advanced(&AttachmentQuery::new(limit).mime_type(mime))
            .await
    }

    /// One query composed from whichever filters are present.
    pub async fn search_advanced(&self, query: &AttachmentQuery) -> Result<Vec<AttachmentRecord>> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT * FROM attachments WHERE 1 = 1");

        if let Some(pattern) = query.filename_pattern.as_deref() {
            builder
                .push(" AND original_filename LIKE ")
                .push_bind(filename_like(pattern))
                .push(" ESCAPE '\\'");
        }

        if let Some(pattern) = query.mime_type_pattern.as_deref() {
            match mime_filter(pattern) {
                MimeFilter::Any => {}
                MimeFilter::Exact(mime) => {
                    builder.push(" AND detected_mime_type = ").push_bind(mime);
                }
                MimeFilter::Prefix(like) => {
                    builder
                        .push(" AND detected_mime_type LIKE ")
                        .push_bind(like)
                        .push(" ESCAPE '\\'");
                }
            }
        }

        if let Some((min, max)) = query.size_range {
            if min > max {
                return Err(AppError::validation_error(format!(
                    "Empty size range: {} > {}",
                    min, max
                )));
            }
            builder
                .push(" AND file_size BETWEEN ")
                .push_bind(min as i64)
                .push(" AND ")
                .push_bind(max.min(i64::MAX as u64) as i64);
        }

        if let Some((from, to)) = query.date_range {
            if from > to {
                return Err(AppError::validation_error("Date range ends before it starts"));
            }
            builder
                .push(" AND created_at BETWEEN ")
                .push_bind(from.timestamp_millis())
                .push(" AND ")
                .push_bind(to.timestamp_millis());
        }

        builder
            .push(RECENT_FIRST)
            .push(" LIMIT ")
            .push_bind(query.limit as i64)
            .push(" OFFSET ")
            .push_bind(query.offset as i64);

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::database_error(format!("Failed to search attachments: {}", e)))?;

        rows.iter().map(row_to_record).collect()
    }

    /// Mark a record as accessed. Returns `false` for an unknown id.
    pub async fn touch(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query("UPDATE attachments SET last_accessed_at = ? WHERE id = ?")
            .bind(at.timestamp_millis())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::database_error(format!("Failed to touch attachment: {}", e)))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM attachments WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::database_error(format!("Failed to delete attachment: {}", e)))?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete every record of a parent and return what was removed.
    pub async fn delete_for_parent(&self, parent_id: &str) -> Result<Vec<AttachmentRecord>> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::database_error(format!("Failed to begin transaction: {}", e))
        })?;

        let rows = sqlx::query(
            "SELECT * FROM attachments WHERE parent_record_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(parent_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| {
            AppError::database_error(format!("Failed to query parent attachments: {}", e))
        })?;
        let removed = rows.iter().map(row_to_record).collect::<Result<Vec<_>>>()?;

        sqlx::query("DELETE FROM attachments WHERE parent_record_id = ?")
            .bind(parent_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::database_error(format!("Failed to delete parent attachments: {}", e))
            })?;

        tx.commit().await.map_err(|e| {
            AppError::database_error(format!("Failed to commit transaction: {}", e))
        })?;

        info!(parent_id = %parent_id, removed = removed.len(), "Parent attachments removed");
        Ok(removed)
    }

    /// Number of records per content hash.
    pub async fn reference_counts(&self) -> Result<HashMap<String, u64>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT content_hash, COUNT(*) FROM attachments GROUP BY content_hash",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::database_error(format!("Failed to count references: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(|(hash, count)| (hash, count.max(0) as u64))
            .collect())
    }

    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM attachments")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::database_error(format!("Failed to count attachments: {}", e)))?;
        Ok(row.get("count"))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Timestamps are persisted at millisecond precision; records built with
/// this compare equal to what the index returns.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

fn row_to_record(row: &SqliteRow) -> Result<AttachmentRecord> {
    let category: String = row.try_get("content_category")?;
    let metadata: String = row.try_get("extracted_metadata")?;
    let file_size: i64 = row.try_get("file_size")?;

    Ok(AttachmentRecord {
        id: row.try_get("id")?,
        content_hash: row.try_get("content_hash")?,
        original_filename: row.try_get("original_filename")?,
        declared_mime_type: row.try_get("declared_mime_type")?,
        detected_mime_type: row.try_get("detected_mime_type")?,
        content_category: category.parse::<ContentCategory>()?,
        file_size: file_size.max(0) as u64,
        parent_record_id: row.try_get("parent_record_id")?,
        extracted_metadata: serde_json::from_str(&metadata)?,
        created_at: millis_to_datetime(row.try_get("created_at")?)?,
        last_accessed_at: millis_to_datetime(row.try_get("last_accessed_at")?)?,
    })
}

fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| AppError::database_error(format!("Timestamp out of range: {}", millis)))
}

fn escape_like(text: &str, out: &mut String) {
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
}

/// Translate a `*`/`?` filename pattern into a LIKE expression.
fn filename_like(pattern: &str) -> String {
    let has_wildcards = pattern.contains('*') || pattern.contains('?');
    let mut like = String::with_capacity(pattern.len() + 2);
    if !has_wildcards {
        like.push('%');
    }
    for c in pattern.chars() {
        match c {
            '*' => like.push('%'),
            '?' => like.push('_'),
            other => escape_like(&other.to_string(), &mut like),
        }
    }
    if !has_wildcards {
        like.push('%');
    }
    like
}

#[derive(Debug, PartialEq)]
enum MimeFilter {
    Any,
    Exact(String),
    Prefix(String),
}

fn mime_filter(pattern: &str) -> MimeFilter {
    let pattern = pattern.trim().to_ascii_lowercase();
    if pattern.is_empty() || pattern == "*" || pattern == "*/*" {
        return MimeFilter::Any;
    }
    match pattern.strip_suffix("/*") {
        Some(top) => {
            let mut like = String::new();
            escape_like(top, &mut like);
            like.push_str("/%");
            MimeFilter::Prefix(like)
        }
        None => MimeFilter::Exact(pattern),
    }
}
