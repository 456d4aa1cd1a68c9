//! OCR push events
//!
//! The scheduler reports through the narrow [`Broadcaster`] trait. The
//! server wires it to a `tokio::sync::broadcast` channel that the SSE route
//! subscribes to.

use serde::Serialize;
use tokio::sync::broadcast;

use super::progress::{CompletionSummary, ProgressSnapshot};

/// Default number of buffered events per subscriber
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Wire format: `{"type": "ocr-progress", "data": {...}}`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum OcrEvent {
    OcrProgress(ProgressSnapshot),
    OcrQueueComplete(CompletionSummary),
}

impl OcrEvent {
    /// SSE event name
    pub fn name(&self) -> &'static str {
        match self {
            Self::OcrProgress(_) => "ocr-progress",
            Self::OcrQueueComplete(_) => "ocr-queue-complete",
        }
    }
}

/// Sink for scheduler events.
///
/// `publish` is called while the scheduler lock is held and must not block.
pub trait Broadcaster: Send + Sync {
    fn publish(&self, event: OcrEvent);
}

/// Fan-out over a broadcast channel. Slow observers lag and skip events
/// rather than holding up the scheduler.
#[derive(Clone)]
pub struct ChannelBroadcaster {
    tx: broadcast::Sender<OcrEvent>,
}

impl Default for ChannelBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OcrEvent> {
        self.tx.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Broadcaster for ChannelBroadcaster {
    fn publish(&self, event: OcrEvent) {
        // Err only means nobody is listening
        let _ = self.tx.send(event);
    }
}
