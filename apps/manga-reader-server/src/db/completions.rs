//! OCR run completion records

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::error::Result;
use crate::ocr::CompletionSummary;

/// Persisted summary of a drained OCR run
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRecord {
    pub id: String,
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub completed_at: String,
    pub status: String,
}

/// Completion repository
pub struct CompletionRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> CompletionRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Store a run summary as an unread notification
    pub async fn create(&self, summary: &CompletionSummary) -> Result<CompletionRecord> {
        sqlx::query(
            r#"
            INSERT INTO ocr_completions (id, total, completed, failed, completed_at, status)
            VALUES (?, ?, ?, ?, ?, 'unread')
            "#,
        )
        .bind(&summary.id)
        .bind(summary.total as i64)
        .bind(summary.completed as i64)
        .bind(summary.failed as i64)
        .bind(summary.completed_at.to_rfc3339())
        .execute(self.pool)
        .await?;

        self.get(&summary.id)
            .await?
            .ok_or_else(|| crate::error::AppError::Internal("Failed to fetch completion record".to_string()))
    }

    /// Get a specific record
    pub async fn get(&self, id: &str) -> Result<Option<CompletionRecord>> {
        let record = sqlx::query_as::<_, CompletionRecord>(
            r#"
            SELECT id, total, completed, failed, completed_at, status
            FROM ocr_completions
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await?;

        Ok(record)
    }

    /// Unread records, newest first
    pub async fn list_unread(&self) -> Result<Vec<CompletionRecord>> {
        let records = sqlx::query_as::<_, CompletionRecord>(
            r#"
            SELECT id, total, completed, failed, completed_at, status
            FROM ocr_completions
            WHERE status = 'unread'
            ORDER BY completed_at DESC
            "#,
        )
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }

    /// Mark a record as dismissed
    pub async fn dismiss(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE ocr_completions SET status = 'dismissed' WHERE id = ?")
            .bind(id)
            .execute(self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Number of stored records regardless of status
    pub async fn count(&self) -> Result<i64> {
        let result: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM ocr_completions")
            .fetch_one(self.pool)
            .await?;

        Ok(result.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use chrono::Utc;

    fn summary(total: usize, completed: usize, failed: usize) -> CompletionSummary {
        CompletionSummary {
            id: uuid::Uuid::new_v4().to_string(),
            total,
            completed,
            failed,
            completed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_create_and_dismiss() {
        let pool = test_pool().await;
        let repo = CompletionRepository::new(&pool);

        let record = repo.create(&summary(5, 4, 1)).await.unwrap();
        assert_eq!(record.status, "unread");
        assert_eq!(record.total, 5);
        assert_eq!(repo.list_unread().await.unwrap().len(), 1);

        assert!(repo.dismiss(&record.id).await.unwrap());
        assert!(repo.list_unread().await.unwrap().is_empty());
        assert_eq!(repo.count().await.unwrap(), 1);

        assert!(!repo.dismiss("missing").await.unwrap());
    }
}
