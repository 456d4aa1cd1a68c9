//! Application state management

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::config::Config;
use crate::ocr::{ChannelBroadcaster, InferenceClient, OcrScheduler, SchedulerOptions};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    db: SqlitePool,
    inference: Arc<dyn InferenceClient>,
    events: ChannelBroadcaster,
    scheduler: OcrScheduler,
}

impl AppState {
    /// Create a new application state
    ///
    /// The scheduler starts idle; callers reconcile and enqueue the backlog.
    pub fn new(config: &Config, db: SqlitePool, inference: Arc<dyn InferenceClient>) -> Self {
        let events = ChannelBroadcaster::default();
        let scheduler = OcrScheduler::new(
            db.clone(),
            inference.clone(),
            Arc::new(events.clone()),
            SchedulerOptions::from(&config.ocr),
        );

        Self {
            inner: Arc::new(AppStateInner {
                db,
                inference,
                events,
                scheduler,
            }),
        }
    }

    /// Get the database pool
    pub fn db(&self) -> &SqlitePool {
        &self.inner.db
    }

    /// Get the inference service client
    pub fn inference(&self) -> &Arc<dyn InferenceClient> {
        &self.inner.inference
    }

    /// Get the OCR event channel
    pub fn events(&self) -> &ChannelBroadcaster {
        &self.inner.events
    }

    /// Get the OCR scheduler
    pub fn scheduler(&self) -> &OcrScheduler {
        &self.inner.scheduler
    }
}
