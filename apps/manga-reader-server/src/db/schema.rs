//! Database schema initialization

use sqlx::SqlitePool;

use crate::error::Result;

/// Initialize the database schema
pub async fn initialize_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(SCHEMA_SQL)
        .execute(pool)
        .await?;

    Ok(())
}

const SCHEMA_SQL: &str = r#"
-- Pages table (one scanned image per row)
CREATE TABLE IF NOT EXISTS pages (
    id TEXT PRIMARY KEY,
    manga_id TEXT NOT NULL,
    page_number INTEGER NOT NULL,
    image_path TEXT NOT NULL,
    -- 'PENDING' | 'PROCESSING' | 'COMPLETED' | 'FAILED'
    ocr_status TEXT NOT NULL DEFAULT 'PENDING',
    ocr_started_at TEXT,
    ocr_completed_at TEXT,
    ocr_error TEXT,
    ocr_failure_count INTEGER NOT NULL DEFAULT 0,
    image_width INTEGER,
    image_height INTEGER,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),

    UNIQUE(manga_id, page_number)
);

CREATE INDEX IF NOT EXISTS idx_pages_manga_id ON pages(manga_id);
CREATE INDEX IF NOT EXISTS idx_pages_ocr_status ON pages(ocr_status);

-- Recognized text blocks (replaced wholesale on every successful OCR run)
CREATE TABLE IF NOT EXISTS text_blocks (
    id TEXT PRIMARY KEY,
    page_id TEXT NOT NULL REFERENCES pages(id) ON DELETE CASCADE,
    block_index INTEGER NOT NULL,
    x1 INTEGER NOT NULL,
    y1 INTEGER NOT NULL,
    x2 INTEGER NOT NULL,
    y2 INTEGER NOT NULL,
    text TEXT NOT NULL,
    -- JSON array of per-line strings
    text_lines TEXT NOT NULL DEFAULT '[]',
    confidence REAL NOT NULL DEFAULT 1.0,
    vertical INTEGER NOT NULL DEFAULT 0,
    line_count INTEGER NOT NULL DEFAULT 0,
    font_size REAL,
    width INTEGER NOT NULL,
    height INTEGER NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_text_blocks_page_id ON text_blocks(page_id);

-- One row per drained OCR run
CREATE TABLE IF NOT EXISTS ocr_completions (
    id TEXT PRIMARY KEY,
    total INTEGER NOT NULL,
    completed INTEGER NOT NULL,
    failed INTEGER NOT NULL,
    completed_at TEXT NOT NULL,
    -- 'unread' | 'dismissed'
    status TEXT NOT NULL DEFAULT 'unread'
);

CREATE INDEX IF NOT EXISTS idx_ocr_completions_status ON ocr_completions(status);
"#;
