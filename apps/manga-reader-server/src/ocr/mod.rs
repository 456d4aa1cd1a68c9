//! OCR Module
//!
//! Background text recognition for manga pages.
//!
//! - [`OcrScheduler`]: prioritized queue and bounded worker pool
//! - [`InferenceClient`]: the external detection/recognition service
//! - [`reconcile`]: startup repair of interrupted runs
//! - [`ProgressTracker`] / [`OcrEvent`]: run progress pushed to observers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use manga_reader_server::ocr::{ChannelBroadcaster, HttpInferenceClient, OcrScheduler};
//!
//! let client = HttpInferenceClient::new(&config.inference.base_url, None)?;
//! let broadcaster = ChannelBroadcaster::default();
//! let scheduler = OcrScheduler::new(
//!     pool.clone(),
//!     Arc::new(client),
//!     Arc::new(broadcaster.clone()),
//!     SchedulerOptions::from(&config.ocr),
//! );
//!
//! let report = reconcile(&pool, config.ocr.retry_ceiling).await?;
//! scheduler.enqueue_backlog(&report.pending);
//! ```

mod client;
mod events;
mod progress;
mod queue;
mod recovery;
mod scheduler;
mod types;

pub use client::*;
pub use events::*;
pub use progress::*;
pub use queue::*;
pub use recovery::*;
pub use scheduler::*;
pub use types::*;

#[cfg(test)]
pub(crate) use client::testing;
