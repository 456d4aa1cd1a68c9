//! OCR Scheduler
//!
//! Owns the job queue and a bounded pool of workers that push page images
//! through the inference service.
//!
//! All bookkeeping (queue order, the in-flight set, pause flag, concurrency
//! and run counters) lives in one [`SchedulerState`] behind a single mutex.
//! The lock is never held across an `.await`: a worker takes it to claim a
//! job, releases it for the slow part (file I/O, inference, database writes)
//! and takes it again to report the outcome. Workers are per-job tasks, so
//! lowering the concurrency simply stops new claims until enough jobs finish.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let scheduler = OcrScheduler::new(pool, client, broadcaster, SchedulerOptions::default());
//!
//! let report = recovery::reconcile(&pool, config.ocr.retry_ceiling).await?;
//! scheduler.enqueue_backlog(&report.pending);
//!
//! // Reader opened a page
//! scheduler.prioritize(&page);
//! ```

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::watch;

use super::client::InferenceClient;
use super::events::{Broadcaster, OcrEvent};
use super::progress::{CompletionSummary, JobOutcome, ProgressSnapshot, ProgressTracker};
use super::queue::{JobQueue, NewJob, Priority, PushOutcome, QueueJob};
use super::types::{InferenceError, QueueError};
use crate::config::OcrQueueConfig;
use crate::db::{CompletionRepository, OcrStatus, Page, PageRepository};
use crate::error::{AppError, Result};

/// Worker pool sizing
#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
    pub concurrency: usize,
    pub max_concurrency: usize,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::from(&OcrQueueConfig::default())
    }
}

impl From<&OcrQueueConfig> for SchedulerOptions {
    fn from(config: &OcrQueueConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            max_concurrency: config.max_concurrency,
        }
    }
}

/// Result of [`OcrScheduler::add_page`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AddOutcome {
    Queued,
    /// Already waiting at a lower tier, moved up
    Promoted,
    AlreadyQueued,
    /// Being processed right now; the request is dropped
    InFlight,
    /// Being processed right now; queued again at `High` once that run ends
    Deferred,
}

/// Number of waiting and running jobs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDepth {
    pub pending: usize,
    pub in_flight: usize,
}

/// Why a job failed
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Image file not found: {}", .0.display())]
    ImageMissing(PathBuf),

    #[error("Failed to read image: {0}")]
    ImageRead(#[from] std::io::Error),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error("Page store error: {0}")]
    Store(#[from] AppError),

    #[error("Page {0} no longer exists")]
    PageNotFound(String),

    #[error("Worker panicked: {0}")]
    WorkerPanicked(String),
}

struct SchedulerState {
    queue: JobQueue,
    in_flight: HashSet<String>,
    /// Running pages that were retried meanwhile
    requeue: HashSet<String>,
    paused: bool,
    concurrency: usize,
    tracker: ProgressTracker,
}

impl SchedulerState {
    fn depth(&self) -> QueueDepth {
        QueueDepth {
            pending: self.queue.len(),
            in_flight: self.in_flight.len(),
        }
    }

    fn snapshot(&self) -> ProgressSnapshot {
        self.tracker
            .snapshot(self.queue.len(), self.paused, self.concurrency)
    }
}

/// Cloneable handle to the OCR worker pool
#[derive(Clone)]
pub struct OcrScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    db: SqlitePool,
    client: Arc<dyn InferenceClient>,
    broadcaster: Arc<dyn Broadcaster>,
    max_concurrency: usize,
    state: Mutex<SchedulerState>,
    depth_tx: watch::Sender<QueueDepth>,
}

impl OcrScheduler {
    /// Create an idle scheduler. Jobs start flowing on the first `add_page`.
    pub fn new(
        db: SqlitePool,
        client: Arc<dyn InferenceClient>,
        broadcaster: Arc<dyn Broadcaster>,
        options: SchedulerOptions,
    ) -> Self {
        let max_concurrency = options.max_concurrency.max(1);
        let concurrency = options.concurrency.clamp(1, max_concurrency);
        let (depth_tx, _depth_rx) = watch::channel(QueueDepth::default());

        Self {
            inner: Arc::new(SchedulerInner {
                db,
                client,
                broadcaster,
                max_concurrency,
                state: Mutex::new(SchedulerState {
                    queue: JobQueue::new(),
                    in_flight: HashSet::new(),
                    requeue: HashSet::new(),
                    paused: false,
                    concurrency,
                    tracker: ProgressTracker::new(),
                }),
                depth_tx,
            }),
        }
    }

    // ========================================================================
    // Enqueueing
    // ========================================================================

    /// Queue a page for recognition.
    ///
    /// A page has at most one job, waiting or running. Asking again is a
    /// no-op, except that a `High` request promotes a waiting `Normal` job.
    /// The page's stored status is only touched once a worker picks it up.
    pub fn add_page(&self, job: NewJob) -> AddOutcome {
        self.add_jobs(std::iter::once(job), false)
            .pop()
            .unwrap_or(AddOutcome::AlreadyQueued)
    }

    /// Queue recovered pages at normal priority. Returns how many were new.
    pub fn enqueue_backlog(&self, pages: &[Page]) -> usize {
        let outcomes = self.add_jobs(pages.iter().map(NewJob::from), false);
        let queued = outcomes
            .iter()
            .filter(|o| **o == AddOutcome::Queued)
            .count();

        tracing::info!(queued, requested = pages.len(), "Enqueued OCR backlog");
        queued
    }

    /// The reader is looking at `page`: make sure it is recognized next.
    ///
    /// Finished and failed pages are left alone; failures are only retried
    /// on explicit request.
    pub fn prioritize(&self, page: &Page) -> Option<AddOutcome> {
        match page.ocr_status {
            OcrStatus::Completed | OcrStatus::Failed => None,
            OcrStatus::Pending | OcrStatus::Processing => {
                Some(self.add_page(NewJob::from(page).with_priority(Priority::High)))
            }
        }
    }

    /// With `requeue_running`, a page that is being processed is marked to
    /// run again instead of being dropped.
    fn add_jobs(
        &self,
        jobs: impl IntoIterator<Item = NewJob>,
        requeue_running: bool,
    ) -> Vec<AddOutcome> {
        let (outcomes, dispatched) = {
            let mut state = self.inner.state.lock();

            let outcomes: Vec<AddOutcome> = jobs
                .into_iter()
                .map(|job| {
                    if state.in_flight.contains(&job.page_id) {
                        if requeue_running {
                            state.requeue.insert(job.page_id);
                            return AddOutcome::Deferred;
                        }
                        return AddOutcome::InFlight;
                    }
                    match state.queue.push(job) {
                        PushOutcome::Inserted => {
                            state.tracker.on_enqueue();
                            AddOutcome::Queued
                        }
                        PushOutcome::Promoted => AddOutcome::Promoted,
                        PushOutcome::Unchanged => AddOutcome::AlreadyQueued,
                    }
                })
                .collect();

            let changed = outcomes
                .iter()
                .any(|o| matches!(o, AddOutcome::Queued | AddOutcome::Promoted));
            let dispatched = self.dispatch_locked(&mut state);
            if changed && dispatched.is_empty() {
                self.publish_snapshot(&state);
            }
            self.publish_depth(&state);

            (outcomes, dispatched)
        };

        self.spawn_workers(dispatched);
        outcomes
    }

    /// Promote a waiting job to `High`. Running or unknown pages are ignored.
    pub fn set_priority(&self, page_id: &str) -> bool {
        let mut state = self.inner.state.lock();
        let promoted = state.queue.promote(page_id, Priority::High);
        if promoted {
            tracing::debug!(page_id = %page_id, "Promoted OCR job");
            self.publish_snapshot(&state);
        }
        promoted
    }

    /// Drop a waiting job, e.g. because its page was deleted. A pending
    /// re-run of a running page is cancelled too; the running job is not.
    pub async fn remove_page(&self, page_id: &str) -> bool {
        let summary = {
            let mut state = self.inner.state.lock();
            let cancelled = state.requeue.remove(page_id);
            if state.queue.remove(page_id).is_none() {
                return cancelled;
            }
            state.tracker.on_removed();
            let pending = state.queue.len();
            let summary = state.tracker.settle(pending);
            self.publish_snapshot(&state);
            if summary.is_none() {
                self.publish_depth(&state);
            }
            summary
        };

        if let Some(summary) = summary {
            self.complete_run(summary).await;
        }
        true
    }

    // ========================================================================
    // Explicit retries
    // ========================================================================

    /// Reset one FAILED page and queue it at high priority.
    ///
    /// A worker records FAILED before it releases the page, so the page may
    /// still be running here; it is then re-queued when that run ends.
    pub async fn retry_page(&self, page_id: &str) -> Result<Option<AddOutcome>> {
        let repo = PageRepository::new(&self.inner.db);
        let Some(page) = repo.reset_failed_page(page_id).await? else {
            return Ok(None);
        };

        tracing::info!(page_id = %page_id, "Retrying failed OCR page");
        let job = NewJob::from(&page).with_priority(Priority::High);
        Ok(self.add_jobs(std::iter::once(job), true).pop())
    }

    /// Reset every FAILED page and queue them at high priority.
    /// Returns the number of pages re-queued.
    pub async fn retry_failed(&self) -> Result<usize> {
        let repo = PageRepository::new(&self.inner.db);
        let failed = repo.list_by_status(OcrStatus::Failed).await?;

        let mut reset = Vec::with_capacity(failed.len());
        for page in &failed {
            if let Some(page) = repo.reset_failed_page(&page.id).await? {
                reset.push(NewJob::from(&page).with_priority(Priority::High));
            }
        }

        let count = reset.len();
        self.add_jobs(reset, true);
        tracing::info!(count, "Retrying all failed OCR pages");
        Ok(count)
    }

    // ========================================================================
    // Controls
    // ========================================================================

    /// Stop dispatching new jobs. Running jobs finish normally.
    pub fn pause(&self) {
        let mut state = self.inner.state.lock();
        if state.paused {
            return;
        }
        state.paused = true;
        tracing::info!(pending = state.queue.len(), "OCR queue paused");
        self.publish_snapshot(&state);
    }

    pub fn resume(&self) {
        let dispatched = {
            let mut state = self.inner.state.lock();
            if !state.paused {
                return;
            }
            state.paused = false;
            tracing::info!(pending = state.queue.len(), "OCR queue resumed");
            let dispatched = self.dispatch_locked(&mut state);
            if dispatched.is_empty() {
                self.publish_snapshot(&state);
            }
            self.publish_depth(&state);
            dispatched
        };

        self.spawn_workers(dispatched);
    }

    /// Resize the worker pool.
    ///
    /// Values outside `1..=max_concurrency` are rejected and the current
    /// value is kept. Extra workers start at once; surplus ones are retired
    /// as their jobs finish.
    pub fn set_concurrency(&self, requested: i64) -> std::result::Result<usize, QueueError> {
        let max = self.inner.max_concurrency;
        let Some(concurrency) = usize::try_from(requested)
            .ok()
            .filter(|n| (1..=max).contains(n))
        else {
            tracing::warn!(requested, max, "Rejected OCR concurrency change");
            return Err(QueueError::InvalidConcurrency { requested, max });
        };

        let dispatched = {
            let mut state = self.inner.state.lock();
            let previous = state.concurrency;
            state.concurrency = concurrency;
            tracing::info!(previous, concurrency, "OCR concurrency changed");
            let dispatched = self.dispatch_locked(&mut state);
            if dispatched.is_empty() {
                self.publish_snapshot(&state);
            }
            self.publish_depth(&state);
            dispatched
        };

        self.spawn_workers(dispatched);
        Ok(concurrency)
    }

    pub fn concurrency(&self) -> usize {
        self.inner.state.lock().concurrency
    }

    pub fn max_concurrency(&self) -> usize {
        self.inner.max_concurrency
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.inner.state.lock().snapshot()
    }

    pub fn depth(&self) -> QueueDepth {
        *self.inner.depth_tx.borrow()
    }

    /// Waiting jobs in dispatch order
    pub fn queued_jobs(&self) -> Vec<QueueJob> {
        self.inner.state.lock().queue.jobs()
    }

    /// Resolves once nothing is waiting or running and the run's completion
    /// record has been written. Never resolves while paused with work queued.
    pub async fn drained(&self) {
        let mut rx = self.inner.depth_tx.subscribe();
        let _ = rx.wait_for(|d| d.pending == 0 && d.in_flight == 0).await;
    }

    /// Resolves once no job is running
    pub async fn workers_idle(&self) {
        let mut rx = self.inner.depth_tx.subscribe();
        let _ = rx.wait_for(|d| d.in_flight == 0).await;
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Claim as many jobs as the pool allows. Caller spawns them after
    /// releasing the lock.
    fn dispatch_locked(&self, state: &mut SchedulerState) -> Vec<QueueJob> {
        let mut claimed = Vec::new();

        while !state.paused && state.in_flight.len() < state.concurrency {
            let Some(job) = state.queue.pop() else {
                break;
            };

            let fresh = state.in_flight.insert(job.page_id.clone());
            debug_assert!(fresh, "page {} dispatched twice", job.page_id);
            state.tracker.on_dispatch(&job.manga_id, job.page_number);

            tracing::debug!(
                page_id = %job.page_id,
                manga_id = %job.manga_id,
                page_number = job.page_number,
                priority = ?job.priority,
                "Dispatching OCR job"
            );
            self.publish_snapshot(state);
            claimed.push(job);
        }

        debug_assert_eq!(state.in_flight.len(), state.tracker.in_flight());
        claimed
    }

    fn spawn_workers(&self, jobs: Vec<QueueJob>) {
        for job in jobs {
            let scheduler = self.clone();
            tokio::spawn(async move { scheduler.run_worker(job).await });
        }
    }

    async fn run_worker(self, job: QueueJob) {
        let started = Instant::now();

        // The job body runs as its own task so a panic surfaces as a
        // JoinError here instead of leaking an in-flight slot.
        let task = {
            let db = self.inner.db.clone();
            let client = self.inner.client.clone();
            let job = job.clone();
            tokio::spawn(async move { process_job(&db, client.as_ref(), &job).await })
        };
        let result = match task.await {
            Ok(result) => result,
            Err(e) => Err(JobError::WorkerPanicked(e.to_string())),
        };

        let outcome = match result {
            Ok(blocks) => {
                tracing::info!(
                    page_id = %job.page_id,
                    blocks,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "OCR completed"
                );
                JobOutcome::Completed
            }
            Err(e) => {
                tracing::warn!(page_id = %job.page_id, error = %e, "OCR failed");
                self.record_failure(&job, &e).await;
                JobOutcome::Failed
            }
        };

        self.finish(&job, outcome, started.elapsed()).await;
    }

    async fn record_failure(&self, job: &QueueJob, error: &JobError) {
        if matches!(error, JobError::PageNotFound(_)) {
            return;
        }

        let repo = PageRepository::new(&self.inner.db);
        if let Err(e) = repo.mark_failed(&job.page_id, &error.to_string()).await {
            tracing::error!(page_id = %job.page_id, error = %e, "Failed to record OCR failure");
        }
    }

    async fn finish(&self, job: &QueueJob, outcome: JobOutcome, elapsed: Duration) {
        let (summary, dispatched) = {
            let mut state = self.inner.state.lock();

            let was_running = state.in_flight.remove(&job.page_id);
            debug_assert!(was_running, "page {} finished but was not in flight", job.page_id);
            state.tracker.on_finish(outcome, elapsed);

            if state.requeue.remove(&job.page_id) {
                let rerun = NewJob {
                    page_id: job.page_id.clone(),
                    manga_id: job.manga_id.clone(),
                    page_number: job.page_number,
                    image_path: job.image_path.clone(),
                    priority: Priority::High,
                };
                if state.queue.push(rerun) == PushOutcome::Inserted {
                    state.tracker.on_enqueue();
                }
                tracing::debug!(page_id = %job.page_id, "Re-queued page retried while running");
            }

            let pending = state.queue.len();
            let summary = state.tracker.settle(pending);
            self.publish_snapshot(&state);

            let dispatched = self.dispatch_locked(&mut state);
            // Drain waiters are released after the completion record lands
            if summary.is_none() {
                self.publish_depth(&state);
            }
            (summary, dispatched)
        };

        self.spawn_workers(dispatched);

        if let Some(summary) = summary {
            self.complete_run(summary).await;
        }
    }

    async fn complete_run(&self, summary: CompletionSummary) {
        tracing::info!(
            total = summary.total,
            completed = summary.completed,
            failed = summary.failed,
            "OCR queue drained"
        );

        let repo = CompletionRepository::new(&self.inner.db);
        if let Err(e) = repo.create(&summary).await {
            tracing::error!(error = %e, "Failed to store OCR completion record");
        }
        self.inner
            .broadcaster
            .publish(OcrEvent::OcrQueueComplete(summary));

        let state = self.inner.state.lock();
        self.publish_depth(&state);
    }

    fn publish_snapshot(&self, state: &SchedulerState) {
        self.inner
            .broadcaster
            .publish(OcrEvent::OcrProgress(state.snapshot()));
    }

    fn publish_depth(&self, state: &SchedulerState) {
        self.inner.depth_tx.send_replace(state.depth());
    }
}

/// Run one job against the page store and the inference service.
/// Returns the number of recognized text blocks.
async fn process_job(
    db: &SqlitePool,
    client: &dyn InferenceClient,
    job: &QueueJob,
) -> std::result::Result<usize, JobError> {
    // A missing file must not leave the page looking like a crashed run
    if !tokio::fs::try_exists(&job.image_path).await.unwrap_or(false) {
        return Err(JobError::ImageMissing(job.image_path.clone()));
    }

    let repo = PageRepository::new(db);
    if !repo.mark_processing(&job.page_id).await? {
        return Err(JobError::PageNotFound(job.page_id.clone()));
    }

    let image = tokio::fs::read(&job.image_path).await?;
    let file_name = job.image_path.to_string_lossy().into_owned();
    let recognition = client.recognize(image, &file_name).await?;

    if !repo.mark_completed(&job.page_id, &recognition).await? {
        return Err(JobError::PageNotFound(job.page_id.clone()));
    }
    Ok(recognition.blocks.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{test_pool, NewPage};
    use crate::ocr::client::testing::ScriptedClient;
    use crate::ocr::events::ChannelBroadcaster;
    use tempfile::TempDir;

    struct Harness {
        scheduler: OcrScheduler,
        client: Arc<ScriptedClient>,
        broadcaster: ChannelBroadcaster,
        pool: SqlitePool,
        dir: TempDir,
    }

    async fn harness(client: ScriptedClient, concurrency: usize) -> Harness {
        let pool = test_pool().await;
        let client = Arc::new(client);
        let broadcaster = ChannelBroadcaster::new(1024);
        let scheduler = OcrScheduler::new(
            pool.clone(),
            client.clone(),
            Arc::new(broadcaster.clone()),
            SchedulerOptions {
                concurrency,
                max_concurrency: 4,
            },
        );

        Harness {
            scheduler,
            client,
            broadcaster,
            pool,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    impl Harness {
        /// Page whose image file contains its label
        async fn page(&self, label: &str, number: i64) -> Page {
            let path = self.dir.path().join(format!("{}.jpg", label));
            tokio::fs::write(&path, label).await.unwrap();
            self.page_at(path, number).await
        }

        async fn page_at(&self, path: PathBuf, number: i64) -> Page {
            PageRepository::new(&self.pool)
                .create(&NewPage {
                    manga_id: "manga-1".to_string(),
                    page_number: number,
                    image_path: path.to_string_lossy().into_owned(),
                })
                .await
                .unwrap()
        }

        async fn status(&self, page: &Page) -> Page {
            PageRepository::new(&self.pool)
                .get(&page.id)
                .await
                .unwrap()
                .unwrap()
        }

        async fn drained(&self) {
            tokio::time::timeout(Duration::from_secs(5), self.scheduler.drained())
                .await
                .expect("queue did not drain");
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    fn completions(rx: &mut tokio::sync::broadcast::Receiver<OcrEvent>) -> Vec<CompletionSummary> {
        let mut found = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let OcrEvent::OcrQueueComplete(summary) = event {
                found.push(summary);
            }
        }
        found
    }

    #[tokio::test]
    async fn test_promotion_while_first_page_runs() {
        let h = harness(ScriptedClient::gated(), 1).await;
        let mut pages = Vec::new();
        for (i, label) in ["p1", "p2", "p3", "p4", "p5"].iter().enumerate() {
            pages.push(h.page(label, i as i64 + 1).await);
        }

        for page in &pages {
            assert_eq!(h.scheduler.add_page(NewJob::from(page)), AddOutcome::Queued);
        }
        let client = h.client.clone();
        eventually(|| client.calls().len() == 1).await;

        assert!(h.scheduler.set_priority(&pages[3].id));
        assert!(!h.scheduler.set_priority(&pages[0].id), "running job cannot be promoted");

        h.client.release(5);
        h.drained().await;

        assert_eq!(h.client.calls(), vec!["p1", "p4", "p2", "p3", "p5"]);
        for page in &pages {
            assert_eq!(h.status(page).await.ocr_status, OcrStatus::Completed);
        }
    }

    #[tokio::test]
    async fn test_high_priority_jobs_dispatch_before_normal() {
        let h = harness(ScriptedClient::new(), 1).await;
        let n1 = h.page("n1", 1).await;
        let n2 = h.page("n2", 2).await;
        let h1 = h.page("h1", 3).await;

        h.scheduler.pause();
        h.scheduler.add_page(NewJob::from(&n1));
        h.scheduler.add_page(NewJob::from(&n2));
        h.scheduler
            .add_page(NewJob::from(&h1).with_priority(Priority::High));
        assert_eq!(
            h.scheduler.add_page(NewJob::from(&n2).with_priority(Priority::High)),
            AddOutcome::Promoted
        );
        h.scheduler.resume();
        h.drained().await;

        assert_eq!(h.client.calls(), vec!["h1", "n2", "n1"]);
    }

    #[tokio::test]
    async fn test_no_double_dispatch() {
        let h = harness(ScriptedClient::gated(), 2).await;
        let p1 = h.page("p1", 1).await;
        let p2 = h.page("p2", 2).await;

        h.scheduler.pause();
        h.scheduler.add_page(NewJob::from(&p2));
        assert_eq!(h.scheduler.add_page(NewJob::from(&p2)), AddOutcome::AlreadyQueued);
        h.scheduler.resume();

        let client = h.client.clone();
        eventually(|| client.calls().len() == 1).await;

        assert_eq!(h.scheduler.add_page(NewJob::from(&p2)), AddOutcome::InFlight);
        assert_eq!(
            h.scheduler.add_page(NewJob::from(&p2).with_priority(Priority::High)),
            AddOutcome::InFlight
        );
        assert_eq!(h.scheduler.add_page(NewJob::from(&p1)), AddOutcome::Queued);

        h.client.release(10);
        h.drained().await;

        let mut calls = h.client.calls();
        calls.sort();
        assert_eq!(calls, vec!["p1", "p2"]);
    }

    #[tokio::test]
    async fn test_pause_holds_jobs_until_resume() {
        let h = harness(ScriptedClient::new(), 2).await;
        let page = h.page("p1", 1).await;

        h.scheduler.pause();
        h.scheduler.pause();
        assert_eq!(h.scheduler.add_page(NewJob::from(&page)), AddOutcome::Queued);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.client.calls().is_empty());
        assert_eq!(h.scheduler.queued_jobs().len(), 1);
        assert_eq!(h.status(&page).await.ocr_status, OcrStatus::Pending);
        assert!(h.scheduler.progress().is_paused);

        h.scheduler.resume();
        h.scheduler.resume();
        h.drained().await;

        assert_eq!(h.client.calls(), vec!["p1"]);
        assert_eq!(h.status(&page).await.ocr_status, OcrStatus::Completed);
        assert!(!h.scheduler.progress().is_paused);
    }

    #[tokio::test]
    async fn test_invalid_concurrency_is_rejected() {
        let h = harness(ScriptedClient::new(), 2).await;

        assert!(h.scheduler.set_concurrency(0).is_err());
        assert!(h.scheduler.set_concurrency(-3).is_err());
        assert_eq!(
            h.scheduler.set_concurrency(5),
            Err(QueueError::InvalidConcurrency { requested: 5, max: 4 })
        );
        assert_eq!(h.scheduler.concurrency(), 2);

        assert_eq!(h.scheduler.set_concurrency(3), Ok(3));
        assert_eq!(h.scheduler.concurrency(), 3);
        assert_eq!(h.scheduler.max_concurrency(), 4);
    }

    #[tokio::test]
    async fn test_concurrency_bounds_running_jobs() {
        let h = harness(ScriptedClient::gated(), 2).await;
        for i in 0..5 {
            let page = h.page(&format!("p{}", i), i).await;
            h.scheduler.add_page(NewJob::from(&page));
        }

        let client = h.client.clone();
        eventually(|| client.calls().len() == 2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.client.calls().len(), 2);
        assert_eq!(h.scheduler.depth(), QueueDepth { pending: 3, in_flight: 2 });

        h.client.release(10);
        h.drained().await;
        assert_eq!(h.client.calls().len(), 5);
        assert!(h.client.peak_concurrency() <= 2);
    }

    #[tokio::test]
    async fn test_lowering_concurrency_waits_for_running_jobs() {
        let h = harness(ScriptedClient::gated(), 3).await;
        for i in 0..5 {
            let page = h.page(&format!("p{}", i), i).await;
            h.scheduler.add_page(NewJob::from(&page));
        }

        let client = h.client.clone();
        eventually(|| client.calls().len() == 3).await;
        assert_eq!(h.scheduler.set_concurrency(1).unwrap(), 1);

        // two jobs still running, above the new limit
        h.client.release(1);
        let scheduler = h.scheduler.clone();
        eventually(|| scheduler.depth().in_flight == 2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.client.calls().len(), 3);
        assert_eq!(h.scheduler.depth(), QueueDepth { pending: 2, in_flight: 2 });

        h.client.release(2);
        eventually(|| client.calls().len() == 4).await;
        h.client.reset_peak();

        h.client.release(10);
        h.drained().await;
        assert_eq!(h.client.calls().len(), 5);
        assert!(h.client.peak_concurrency() <= 1);
    }

    #[tokio::test]
    async fn test_raising_concurrency_starts_workers_immediately() {
        let h = harness(ScriptedClient::gated(), 1).await;
        for i in 0..3 {
            let page = h.page(&format!("p{}", i), i).await;
            h.scheduler.add_page(NewJob::from(&page));
        }

        let client = h.client.clone();
        eventually(|| client.calls().len() == 1).await;

        h.scheduler.set_concurrency(3).unwrap();
        eventually(|| client.calls().len() == 3).await;

        h.client.release(3);
        h.drained().await;
    }

    #[tokio::test]
    async fn test_completion_fires_once_per_drain() {
        let h = harness(ScriptedClient::new(), 2).await;
        let mut rx = h.broadcaster.subscribe();

        let labels = ["ok-1", "fail-2", "ok-3", "fail-4", "ok-5"];
        let mut pages = Vec::new();
        for (i, label) in labels.iter().enumerate() {
            pages.push(h.page(label, i as i64 + 1).await);
        }
        for page in &pages {
            h.scheduler.add_page(NewJob::from(page));
        }
        h.drained().await;

        let summaries = completions(&mut rx);
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].total, 5);
        assert_eq!(summaries[0].completed, 3);
        assert_eq!(summaries[0].failed, 2);

        let records = CompletionRepository::new(&h.pool).list_unread().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].completed + records[0].failed, 5);

        let failed = h.status(&pages[1]).await;
        assert_eq!(failed.ocr_status, OcrStatus::Failed);
        assert!(failed.ocr_error.unwrap().contains("cannot read fail-2"));
        assert!(PageRepository::new(&h.pool).text_blocks(&pages[1].id).await.unwrap().is_empty());

        let snapshot = h.scheduler.progress();
        assert_eq!(snapshot.total, 0);
        assert!(!snapshot.is_processing);
        assert!(snapshot.current_manga_id.is_none());
    }

    #[tokio::test]
    async fn test_missing_image_fails_without_processing() {
        let h = harness(ScriptedClient::new(), 1).await;
        let page = h.page_at(h.dir.path().join("gone.jpg"), 1).await;

        h.scheduler.add_page(NewJob::from(&page));
        h.drained().await;

        let stored = h.status(&page).await;
        assert_eq!(stored.ocr_status, OcrStatus::Failed);
        assert!(stored.ocr_started_at.is_none());
        assert!(h.client.calls().is_empty());
    }

    #[tokio::test]
    async fn test_retry_failed_requeues_at_high_priority() {
        let h = harness(ScriptedClient::new(), 1).await;
        let path = h.dir.path().join("late.jpg");
        let page = h.page_at(path.clone(), 1).await;

        h.scheduler.add_page(NewJob::from(&page));
        h.drained().await;
        assert_eq!(h.status(&page).await.ocr_status, OcrStatus::Failed);

        tokio::fs::write(&path, "late").await.unwrap();
        assert_eq!(h.scheduler.retry_failed().await.unwrap(), 1);
        h.drained().await;

        assert_eq!(h.status(&page).await.ocr_status, OcrStatus::Completed);
        assert_eq!(h.client.calls(), vec!["late"]);
        assert_eq!(CompletionRepository::new(&h.pool).count().await.unwrap(), 2);

        assert!(h.scheduler.retry_page(&page.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retry_while_running_requeues_after_the_run() {
        let h = harness(ScriptedClient::gated(), 1).await;
        let page = h.page("p1", 1).await;

        h.scheduler.add_page(NewJob::from(&page));
        let client = h.client.clone();
        eventually(|| client.calls().len() == 1).await;

        // the worker has recorded the failure but not yet released the page
        PageRepository::new(&h.pool)
            .mark_failed(&page.id, "timeout")
            .await
            .unwrap();
        assert_eq!(
            h.scheduler.retry_page(&page.id).await.unwrap(),
            Some(AddOutcome::Deferred)
        );
        assert_eq!(h.scheduler.depth(), QueueDepth { pending: 0, in_flight: 1 });

        h.client.release(2);
        h.drained().await;

        assert_eq!(h.client.calls(), vec!["p1", "p1"]);
        assert_eq!(h.status(&page).await.ocr_status, OcrStatus::Completed);
        assert_eq!(h.scheduler.depth(), QueueDepth { pending: 0, in_flight: 0 });
    }

    #[tokio::test]
    async fn test_prioritize_skips_finished_pages() {
        let h = harness(ScriptedClient::new(), 1).await;
        let page = h.page("p1", 1).await;

        h.scheduler.add_page(NewJob::from(&page));
        h.drained().await;

        let done = h.status(&page).await;
        assert_eq!(h.scheduler.prioritize(&done), None);
        assert_eq!(h.client.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_backlog_is_enqueued_once_at_normal_priority() {
        let h = harness(ScriptedClient::new(), 1).await;
        let pages = vec![h.page("b1", 1).await, h.page("b2", 2).await];

        h.scheduler.pause();
        assert_eq!(h.scheduler.enqueue_backlog(&pages), 2);
        assert_eq!(h.scheduler.enqueue_backlog(&pages), 0);

        let queued = h.scheduler.queued_jobs();
        assert_eq!(queued.len(), 2);
        assert!(queued.iter().all(|j| j.priority == Priority::Normal));
        assert_eq!(h.scheduler.progress().total, 2);

        h.scheduler.resume();
        h.drained().await;
        assert_eq!(h.client.calls(), vec!["b1", "b2"]);
    }

    #[tokio::test]
    async fn test_remove_last_waiting_job_closes_run() {
        let h = harness(ScriptedClient::new(), 1).await;
        let page = h.page("p1", 1).await;

        h.scheduler.pause();
        h.scheduler.add_page(NewJob::from(&page));
        assert!(h.scheduler.remove_page(&page.id).await);
        assert!(!h.scheduler.remove_page(&page.id).await);

        assert_eq!(h.scheduler.depth(), QueueDepth::default());
        assert!(!h.scheduler.progress().is_processing);
        assert_eq!(CompletionRepository::new(&h.pool).count().await.unwrap(), 0);
    }
}
