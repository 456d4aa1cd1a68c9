//! Startup reconciliation
//!
//! Brings the stored page states back in line with an empty in-memory queue
//! after a restart or crash. Runs once, before the scheduler accepts work:
//!
//! 1. PROCESSING pages were interrupted mid-run and go back to PENDING.
//! 2. FAILED pages below the retry ceiling go back to PENDING with their
//!    partial text dropped.
//! 3. COMPLETED pages without image dimensions are partial writes and are
//!    redone.
//!
//! Every step is idempotent; a second pass over a reconciled store changes
//! nothing.

use serde::Serialize;
use sqlx::SqlitePool;

use crate::db::{OcrStatus, Page, PageRepository};
use crate::error::Result;

/// What a reconciliation pass changed
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    pub reset_processing: u64,
    pub reset_failed: u64,
    pub repaired_partial: u64,
    /// FAILED pages left alone because they hit the retry ceiling
    pub exhausted: u64,
    /// Every PENDING page after the pass, for the backlog
    #[serde(skip)]
    pub pending: Vec<Page>,
}

impl RecoveryReport {
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn changed(&self) -> u64 {
        self.reset_processing + self.reset_failed + self.repaired_partial
    }
}

/// Repair stored page states and collect the backlog.
///
/// `retry_ceiling` limits how many recorded failures a page may have and
/// still be retried automatically; `None` retries every failed page.
pub async fn reconcile(pool: &SqlitePool, retry_ceiling: Option<u32>) -> Result<RecoveryReport> {
    let repo = PageRepository::new(pool);

    let reset_processing = repo.reset_processing().await?;
    let reset_failed = repo.reset_failed(retry_ceiling).await?;
    let repaired_partial = repo.repair_partial_completions().await?;
    let exhausted = repo.count_by_status(OcrStatus::Failed).await?.max(0) as u64;
    let pending = repo.list_by_status(OcrStatus::Pending).await?;

    let report = RecoveryReport {
        reset_processing,
        reset_failed,
        repaired_partial,
        exhausted,
        pending,
    };

    if report.changed() > 0 {
        tracing::warn!(
            reset_processing,
            reset_failed,
            repaired_partial,
            "Repaired OCR state left by previous run"
        );
    }
    if exhausted > 0 {
        tracing::info!(exhausted, ?retry_ceiling, "Failed pages past the retry ceiling");
    }
    tracing::info!(pending = report.pending_count(), "OCR reconciliation finished");

    Ok(report)
}
