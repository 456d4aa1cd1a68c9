//! Run progress tracking
//!
//! A "run" starts with the first job enqueued while idle and ends when the
//! queue drains (nothing waiting, nothing in flight). [`ProgressTracker`] is
//! plain data; the scheduler keeps it under the same lock as the queue so the
//! drain check and the counter updates can never interleave.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Number of recent job durations used for the time estimate
const DURATION_WINDOW: usize = 10;

/// Point-in-time view of the current run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    /// Jobs enqueued during this run
    pub total: usize,
    /// Completed + failed
    pub processed: usize,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
    pub in_flight: usize,
    /// Manga of the most recently dispatched job
    pub current_manga_id: Option<String>,
    /// Page number of the most recently dispatched job
    pub current_page_number: Option<i64>,
    pub estimated_seconds_remaining: Option<u64>,
    pub is_processing: bool,
    pub is_paused: bool,
    pub concurrency: usize,
}

/// Totals of a drained run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionSummary {
    pub id: String,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub completed_at: DateTime<Utc>,
}

/// How a job ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed,
}

#[derive(Debug, Default)]
pub struct ProgressTracker {
    total: usize,
    completed: usize,
    failed: usize,
    in_flight: usize,
    current: Option<(String, i64)>,
    /// Kept across runs; the service speed does not reset with the queue
    durations: VecDeque<Duration>,
    active: bool,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn on_enqueue(&mut self) {
        self.total += 1;
        self.active = true;
    }

    /// A waiting job was dropped before dispatch
    pub fn on_removed(&mut self) {
        self.total = self.total.saturating_sub(1);
    }

    pub fn on_dispatch(&mut self, manga_id: &str, page_number: i64) {
        self.in_flight += 1;
        self.current = Some((manga_id.to_string(), page_number));
    }

    pub fn on_finish(&mut self, outcome: JobOutcome, elapsed: Duration) {
        self.in_flight = self.in_flight.saturating_sub(1);
        match outcome {
            JobOutcome::Completed => self.completed += 1,
            JobOutcome::Failed => self.failed += 1,
        }

        if self.durations.len() == DURATION_WINDOW {
            self.durations.pop_front();
        }
        self.durations.push_back(elapsed);
    }

    /// Close the run if it just drained.
    ///
    /// Returns the run summary exactly once per drain: the active flag flips
    /// to idle here and only `on_enqueue` sets it again. A run in which
    /// nothing was processed closes without a summary.
    pub fn settle(&mut self, pending: usize) -> Option<CompletionSummary> {
        if !self.active || pending > 0 || self.in_flight > 0 {
            return None;
        }

        self.active = false;
        let processed = self.completed + self.failed;
        let summary = (processed > 0).then(|| CompletionSummary {
            id: Uuid::new_v4().to_string(),
            total: self.total,
            completed: self.completed,
            failed: self.failed,
            completed_at: Utc::now(),
        });

        self.total = 0;
        self.completed = 0;
        self.failed = 0;
        self.current = None;

        summary
    }

    pub fn average_duration(&self) -> Option<Duration> {
        if self.durations.is_empty() {
            return None;
        }
        let sum: Duration = self.durations.iter().sum();
        Some(sum / self.durations.len() as u32)
    }

    /// Average job duration times the number of waiting jobs
    pub fn estimate_remaining(&self, pending: usize) -> Option<u64> {
        let average = self.average_duration()?;
        Some((average.as_secs_f64() * pending as f64).round() as u64)
    }

    pub fn snapshot(&self, pending: usize, paused: bool, concurrency: usize) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.total,
            processed: self.completed + self.failed,
            completed: self.completed,
            failed: self.failed,
            pending,
            in_flight: self.in_flight,
            current_manga_id: self.current.as_ref().map(|(manga, _)| manga.clone()),
            current_page_number: self.current.as_ref().map(|(_, page)| *page),
            estimated_seconds_remaining: self.estimate_remaining(pending),
            is_processing: self.active,
            is_paused: paused,
            concurrency,
        }
    }
}
