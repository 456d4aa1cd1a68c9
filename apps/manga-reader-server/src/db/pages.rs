//! Page OCR state database operations
//!
//! Every status transition of the OCR state machine goes through
//! [`PageRepository`]. Transitions that touch both the page row and its text
//! blocks run in a single transaction so a crash never leaves half of one.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::Result;
use crate::ocr::{Recognition, TextBlock};

/// OCR status of a page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum OcrStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Page record
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub id: String,
    pub manga_id: String,
    pub page_number: i64,
    pub image_path: String,
    pub ocr_status: OcrStatus,
    pub ocr_started_at: Option<String>,
    pub ocr_completed_at: Option<String>,
    pub ocr_error: Option<String>,
    pub ocr_failure_count: i64,
    pub image_width: Option<i64>,
    pub image_height: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

/// Create page request
#[derive(Debug, Clone, Deserialize)]
pub struct NewPage {
    pub manga_id: String,
    pub page_number: i64,
    pub image_path: String,
}

/// Stored text block row
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredTextBlock {
    pub id: String,
    pub page_id: String,
    pub block_index: i64,
    pub x1: i64,
    pub y1: i64,
    pub x2: i64,
    pub y2: i64,
    pub text: String,
    pub text_lines: String,
    pub confidence: f64,
    pub vertical: bool,
    pub line_count: i64,
    pub font_size: Option<f64>,
    pub width: i64,
    pub height: i64,
}

impl StoredTextBlock {
    pub fn into_text_block(self) -> Result<TextBlock> {
        Ok(TextBlock {
            bbox: [self.x1, self.y1, self.x2, self.y2],
            text: self.text,
            text_lines: serde_json::from_str(&self.text_lines)?,
            confidence: self.confidence,
            vertical: self.vertical,
            lines: self.line_count,
            font_size: self.font_size,
            width: self.width,
            height: self.height,
        })
    }
}

const PAGE_COLUMNS: &str = "id, manga_id, page_number, image_path, ocr_status, ocr_started_at, \
     ocr_completed_at, ocr_error, ocr_failure_count, image_width, image_height, created_at, updated_at";

/// Page repository
pub struct PageRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> PageRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a specific page
    pub async fn get(&self, id: &str) -> Result<Option<Page>> {
        let page = sqlx::query_as::<_, Page>(&format!(
            "SELECT {} FROM pages WHERE id = ?",
            PAGE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(self.pool)
        .await?;

        Ok(page)
    }

    /// Register a new page in the PENDING state
    pub async fn create(&self, data: &NewPage) -> Result<Page> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO pages (id, manga_id, page_number, image_path, ocr_status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&data.manga_id)
        .bind(data.page_number)
        .bind(&data.image_path)
        .bind(OcrStatus::Pending)
        .bind(&now)
        .bind(&now)
        .execute(self.pool)
        .await?;

        self.get(&id)
            .await?
            .ok_or_else(|| crate::error::AppError::Internal("Failed to fetch created page".to_string()))
    }

    /// List pages in a given status, in reading order
    pub async fn list_by_status(&self, status: OcrStatus) -> Result<Vec<Page>> {
        let pages = sqlx::query_as::<_, Page>(&format!(
            "SELECT {} FROM pages WHERE ocr_status = ? ORDER BY manga_id ASC, page_number ASC",
            PAGE_COLUMNS
        ))
        .bind(status)
        .fetch_all(self.pool)
        .await?;

        Ok(pages)
    }

    /// Count pages in a given status
    pub async fn count_by_status(&self, status: OcrStatus) -> Result<i64> {
        let result: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pages WHERE ocr_status = ?")
            .bind(status)
            .fetch_one(self.pool)
            .await?;

        Ok(result.0)
    }

    /// Text blocks of a page, in the order the recognizer returned them
    pub async fn text_blocks(&self, page_id: &str) -> Result<Vec<StoredTextBlock>> {
        let blocks = sqlx::query_as::<_, StoredTextBlock>(
            r#"
            SELECT id, page_id, block_index, x1, y1, x2, y2, text, text_lines,
                   confidence, vertical, line_count, font_size, width, height
            FROM text_blocks
            WHERE page_id = ?
            ORDER BY block_index ASC
            "#,
        )
        .bind(page_id)
        .fetch_all(self.pool)
        .await?;

        Ok(blocks)
    }

    // ========================================================================
    // State transitions
    // ========================================================================

    /// PENDING/FAILED/COMPLETED -> PROCESSING
    ///
    /// Returns false when the page no longer exists.
    pub async fn mark_processing(&self, id: &str) -> Result<bool> {
        let now = Utc::now().to_rfc3339();

        let result = sqlx::query(
            r#"
            UPDATE pages
            SET ocr_status = ?, ocr_started_at = ?, ocr_completed_at = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(OcrStatus::Processing)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// PROCESSING -> COMPLETED, replacing the page's text blocks
    pub async fn mark_completed(&self, id: &str, recognition: &Recognition) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE pages
            SET ocr_status = ?, ocr_completed_at = ?, ocr_error = NULL, ocr_failure_count = 0,
                image_width = ?, image_height = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(OcrStatus::Completed)
        .bind(&now)
        .bind(i64::from(recognition.image_size.width))
        .bind(i64::from(recognition.image_size.height))
        .bind(&now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query("DELETE FROM text_blocks WHERE page_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        for (index, block) in recognition.blocks.iter().enumerate() {
            let text_lines = serde_json::to_string(&block.text_lines)?;
            let [x1, y1, x2, y2] = block.bbox;

            sqlx::query(
                r#"
                INSERT INTO text_blocks (id, page_id, block_index, x1, y1, x2, y2, text, text_lines,
                                         confidence, vertical, line_count, font_size, width, height, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(id)
            .bind(index as i64)
            .bind(x1)
            .bind(y1)
            .bind(x2)
            .bind(y2)
            .bind(&block.text)
            .bind(text_lines)
            .bind(block.confidence)
            .bind(block.vertical)
            .bind(block.lines)
            .bind(block.font_size)
            .bind(block.width)
            .bind(block.height)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Any state -> FAILED. Existing text blocks are left alone.
    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<bool> {
        let now = Utc::now().to_rfc3339();

        let result = sqlx::query(
            r#"
            UPDATE pages
            SET ocr_status = ?, ocr_completed_at = ?, ocr_error = ?,
                ocr_failure_count = ocr_failure_count + 1, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(OcrStatus::Failed)
        .bind(&now)
        .bind(error)
        .bind(&now)
        .bind(id)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// FAILED -> PENDING for one page, dropping whatever text it had
    pub async fn reset_failed_page(&self, id: &str) -> Result<Option<Page>> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM text_blocks WHERE page_id IN (SELECT id FROM pages WHERE id = ? AND ocr_status = ?)",
        )
        .bind(id)
        .bind(OcrStatus::Failed)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            r#"
            UPDATE pages
            SET ocr_status = ?, ocr_started_at = NULL, ocr_completed_at = NULL, ocr_error = NULL,
                image_width = NULL, image_height = NULL, updated_at = ?
            WHERE id = ? AND ocr_status = ?
            "#,
        )
        .bind(OcrStatus::Pending)
        .bind(&now)
        .bind(id)
        .bind(OcrStatus::Failed)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get(id).await
    }

    // ========================================================================
    // Bulk repairs used at startup and by "retry all"
    // ========================================================================

    /// PROCESSING -> PENDING for every page. A page may have been a rerun of
    /// a completed one, so its old blocks and dimensions are dropped too.
    /// Returns the number of pages reset.
    pub async fn reset_processing(&self) -> Result<u64> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM text_blocks
            WHERE page_id IN (SELECT id FROM pages WHERE ocr_status = ?)
            "#,
        )
        .bind(OcrStatus::Processing)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            r#"
            UPDATE pages
            SET ocr_status = ?, ocr_started_at = NULL, ocr_completed_at = NULL,
                image_width = NULL, image_height = NULL, updated_at = ?
            WHERE ocr_status = ?
            "#,
        )
        .bind(OcrStatus::Pending)
        .bind(&now)
        .bind(OcrStatus::Processing)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    /// FAILED -> PENDING for pages that failed fewer than `ceiling` times
    /// (every failed page when `ceiling` is `None`).
    pub async fn reset_failed(&self, ceiling: Option<u32>) -> Result<u64> {
        let now = Utc::now().to_rfc3339();
        let ceiling = ceiling.map(i64::from);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM text_blocks
            WHERE page_id IN (
                SELECT id FROM pages
                WHERE ocr_status = ? AND (? IS NULL OR ocr_failure_count < ?)
            )
            "#,
        )
        .bind(OcrStatus::Failed)
        .bind(ceiling)
        .bind(ceiling)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            r#"
            UPDATE pages
            SET ocr_status = ?, ocr_started_at = NULL, ocr_completed_at = NULL, ocr_error = NULL,
                image_width = NULL, image_height = NULL, updated_at = ?
            WHERE ocr_status = ? AND (? IS NULL OR ocr_failure_count < ?)
            "#,
        )
        .bind(OcrStatus::Pending)
        .bind(&now)
        .bind(OcrStatus::Failed)
        .bind(ceiling)
        .bind(ceiling)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    /// COMPLETED pages without image dimensions are partial writes: drop
    /// their text blocks and send them back to PENDING.
    pub async fn repair_partial_completions(&self) -> Result<u64> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM text_blocks
            WHERE page_id IN (
                SELECT id FROM pages
                WHERE ocr_status = ? AND (image_width IS NULL OR image_height IS NULL)
            )
            "#,
        )
        .bind(OcrStatus::Completed)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            r#"
            UPDATE pages
            SET ocr_status = ?, ocr_started_at = NULL, ocr_completed_at = NULL,
                image_width = NULL, image_height = NULL, updated_at = ?
            WHERE ocr_status = ? AND (image_width IS NULL OR image_height IS NULL)
            "#,
        )
        .bind(OcrStatus::Pending)
        .bind(&now)
        .bind(OcrStatus::Completed)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }
}
