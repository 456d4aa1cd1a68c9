//! OCR queue API routes
//!
//! Endpoints:
//! - GET  /api/v1/ocr/progress - Current run progress
//! - POST /api/v1/ocr/pause, /resume - Stop or restart dispatching
//! - GET  /api/v1/ocr/queue - Waiting jobs in dispatch order
//! - GET  /api/v1/ocr/failed - Pages whose last attempt failed
//! - POST /api/v1/ocr/failed/retry - Re-queue every failed page
//! - GET|PUT /api/v1/ocr/concurrency - Worker pool size
//! - POST /api/v1/ocr/pages/:id/view - Reader opened a page
//! - POST /api/v1/ocr/pages/:id/retry - Re-queue one failed page
//! - GET  /api/v1/ocr/pages/:id/blocks - Recognized text of a page
//! - GET  /api/v1/ocr/completions - Unread run summaries
//! - POST /api/v1/ocr/completions/:id/dismiss - Mark a summary read
//! - GET  /api/v1/ocr/events - Server-sent progress events

use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;

use crate::db::{CompletionRecord, CompletionRepository, OcrStatus, Page, PageRepository};
use crate::error::{AppError, Result};
use crate::ocr::{AddOutcome, OcrEvent, ProgressSnapshot, QueueJob, TextBlock};
use crate::state::AppState;

/// Create the OCR router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/progress", get(get_progress))
        .route("/pause", post(pause))
        .route("/resume", post(resume))
        .route("/queue", get(list_queue))
        .route("/failed", get(list_failed))
        .route("/failed/retry", post(retry_all_failed))
        .route("/concurrency", get(get_concurrency).put(set_concurrency))
        .route("/pages/:id/view", post(view_page))
        .route("/pages/:id/retry", post(retry_page))
        .route("/pages/:id/blocks", get(page_blocks))
        .route("/completions", get(list_completions))
        .route("/completions/:id/dismiss", post(dismiss_completion))
        .route("/events", get(events))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConcurrencyResponse {
    concurrency: usize,
    max_concurrency: usize,
}

#[derive(Debug, Deserialize)]
struct SetConcurrencyRequest {
    concurrency: i64,
}

/// Outcome of a request to queue a page. `outcome` is null when nothing
/// was queued because the page is finished or failed.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueuePageResponse {
    page_id: String,
    outcome: Option<AddOutcome>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RetryAllResponse {
    retried: usize,
}

async fn get_progress(State(state): State<AppState>) -> Json<ProgressSnapshot> {
    Json(state.scheduler().progress())
}

async fn pause(State(state): State<AppState>) -> Json<ProgressSnapshot> {
    state.scheduler().pause();
    Json(state.scheduler().progress())
}

async fn resume(State(state): State<AppState>) -> Json<ProgressSnapshot> {
    state.scheduler().resume();
    Json(state.scheduler().progress())
}

async fn list_queue(State(state): State<AppState>) -> Json<Vec<QueueJob>> {
    Json(state.scheduler().queued_jobs())
}

async fn list_failed(State(state): State<AppState>) -> Result<Json<Vec<Page>>> {
    let repo = PageRepository::new(state.db());
    let pages = repo.list_by_status(OcrStatus::Failed).await?;
    Ok(Json(pages))
}

async fn retry_all_failed(State(state): State<AppState>) -> Result<Json<RetryAllResponse>> {
    let retried = state.scheduler().retry_failed().await?;
    Ok(Json(RetryAllResponse { retried }))
}

async fn get_concurrency(State(state): State<AppState>) -> Json<ConcurrencyResponse> {
    Json(ConcurrencyResponse {
        concurrency: state.scheduler().concurrency(),
        max_concurrency: state.scheduler().max_concurrency(),
    })
}

async fn set_concurrency(
    State(state): State<AppState>,
    Json(request): Json<SetConcurrencyRequest>,
) -> Result<Json<ConcurrencyResponse>> {
    let concurrency = state.scheduler().set_concurrency(request.concurrency)?;
    Ok(Json(ConcurrencyResponse {
        concurrency,
        max_concurrency: state.scheduler().max_concurrency(),
    }))
}

/// The reader opened a page: recognize it before the backlog
async fn view_page(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<QueuePageResponse>> {
    let page = find_page(&state, &id).await?;
    let outcome = state.scheduler().prioritize(&page);
    Ok(Json(QueuePageResponse { page_id: id, outcome }))
}

async fn retry_page(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<QueuePageResponse>)> {
    match state.scheduler().retry_page(&id).await? {
        Some(outcome) => Ok((
            StatusCode::ACCEPTED,
            Json(QueuePageResponse {
                page_id: id,
                outcome: Some(outcome),
            }),
        )),
        None => {
            let page = find_page(&state, &id).await?;
            Err(AppError::BadRequest(format!(
                "Page {} is {:?}, only failed pages can be retried",
                page.id, page.ocr_status
            )))
        }
    }
}

async fn page_blocks(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<TextBlock>>> {
    find_page(&state, &id).await?;
    let repo = PageRepository::new(state.db());
    let blocks = repo
        .text_blocks(&id)
        .await?
        .into_iter()
        .map(|block| block.into_text_block())
        .collect::<Result<Vec<_>>>()?;
    Ok(Json(blocks))
}

async fn list_completions(State(state): State<AppState>) -> Result<Json<Vec<CompletionRecord>>> {
    let repo = CompletionRepository::new(state.db());
    Ok(Json(repo.list_unread().await?))
}

async fn dismiss_completion(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    let repo = CompletionRepository::new(state.db());
    if repo.dismiss(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("Completion not found: {}", id)))
    }
}

/// Push progress and completion events. Each new observer first receives
/// the current snapshot.
async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let rx = state.events().subscribe();
    let initial = OcrEvent::OcrProgress(state.scheduler().progress());

    let updates = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => return Some((event, rx)),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "OCR event observer lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    let stream = stream::once(async move { initial })
        .chain(updates)
        .map(|event| Ok(to_sse_event(&event)));

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn to_sse_event(event: &OcrEvent) -> Event {
    match Event::default().event(event.name()).json_data(event) {
        Ok(sse) => sse,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode OCR event");
            Event::default().comment("unencodable event")
        }
    }
}

async fn find_page(state: &AppState, id: &str) -> Result<Page> {
    PageRepository::new(state.db())
        .get(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Page not found: {}", id)))
}
