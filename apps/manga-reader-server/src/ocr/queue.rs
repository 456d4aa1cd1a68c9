//! Tiered FIFO job queue
//!
//! Jobs wait in one FIFO per [`Priority`] tier. Tiers drain strictly in
//! declaration order of the enum, so every `High` job leaves before any
//! `Normal` one. The queue only knows about *waiting* jobs; in-flight
//! tracking belongs to the scheduler.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Dispatch tier of a job. Earlier variants are dispatched first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// The reader is looking at this page right now
    High,
    /// Background backlog
    Normal,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

/// Request to recognize one page
#[derive(Debug, Clone)]
pub struct NewJob {
    pub page_id: String,
    pub manga_id: String,
    pub page_number: i64,
    pub image_path: PathBuf,
    pub priority: Priority,
}

impl From<&crate::db::Page> for NewJob {
    fn from(page: &crate::db::Page) -> Self {
        Self {
            page_id: page.id.clone(),
            manga_id: page.manga_id.clone(),
            page_number: page.page_number,
            image_path: PathBuf::from(&page.image_path),
            priority: Priority::Normal,
        }
    }
}

impl NewJob {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// A job waiting in (or popped from) the queue
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueJob {
    pub page_id: String,
    pub manga_id: String,
    pub page_number: i64,
    pub image_path: PathBuf,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
}

/// Result of pushing a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Inserted,
    /// The page was already waiting in a lower tier and moved up
    Promoted,
    /// The page was already waiting at the same or a higher tier
    Unchanged,
}

#[derive(Debug, Default)]
pub struct JobQueue {
    tiers: BTreeMap<Priority, VecDeque<QueueJob>>,
    /// page id -> tier it currently waits in
    index: HashMap<String, Priority>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, page_id: &str) -> bool {
        self.index.contains_key(page_id)
    }

    pub fn priority_of(&self, page_id: &str) -> Option<Priority> {
        self.index.get(page_id).copied()
    }

    /// Insert a job, or promote the waiting job for the same page if the new
    /// request ranks higher.
    pub fn push(&mut self, job: NewJob) -> PushOutcome {
        if let Some(current) = self.priority_of(&job.page_id) {
            if job.priority < current {
                self.promote(&job.page_id, job.priority);
                return PushOutcome::Promoted;
            }
            return PushOutcome::Unchanged;
        }

        self.index.insert(job.page_id.clone(), job.priority);
        self.tiers.entry(job.priority).or_default().push_back(QueueJob {
            page_id: job.page_id,
            manga_id: job.manga_id,
            page_number: job.page_number,
            image_path: job.image_path,
            priority: job.priority,
            enqueued_at: Utc::now(),
        });
        PushOutcome::Inserted
    }

    /// Move a waiting job to the back of a higher tier.
    ///
    /// The job counts as newly arrived in its new tier. Returns false if the
    /// page is not waiting or already ranks at least as high.
    pub fn promote(&mut self, page_id: &str, to: Priority) -> bool {
        let Some(current) = self.priority_of(page_id) else {
            return false;
        };
        if to >= current {
            return false;
        }

        let Some(mut job) = self.take_from_tier(current, page_id) else {
            return false;
        };
        job.priority = to;
        job.enqueued_at = Utc::now();
        self.index.insert(job.page_id.clone(), to);
        self.tiers.entry(to).or_default().push_back(job);
        true
    }

    /// Pop the head of the highest non-empty tier
    pub fn pop(&mut self) -> Option<QueueJob> {
        let job = self
            .tiers
            .values_mut()
            .find(|tier| !tier.is_empty())
            .and_then(|tier| tier.pop_front())?;
        self.index.remove(&job.page_id);
        Some(job)
    }

    /// Drop a waiting job
    pub fn remove(&mut self, page_id: &str) -> Option<QueueJob> {
        let tier = self.index.remove(page_id)?;
        self.take_from_tier(tier, page_id)
    }

    /// Waiting jobs in dispatch order
    pub fn jobs(&self) -> Vec<QueueJob> {
        self.tiers.values().flatten().cloned().collect()
    }

    fn take_from_tier(&mut self, tier: Priority, page_id: &str) -> Option<QueueJob> {
        let jobs = self.tiers.get_mut(&tier)?;
        let position = jobs.iter().position(|j| j.page_id == page_id)?;
        jobs.remove(position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(page: &str, priority: Priority) -> NewJob {
        NewJob {
            page_id: page.to_string(),
            manga_id: "m1".to_string(),
            page_number: 1,
            image_path: PathBuf::from(format!("/tmp/{}.jpg", page)),
            priority,
        }
    }

    fn drain(queue: &mut JobQueue) -> Vec<String> {
        std::iter::from_fn(|| queue.pop()).map(|j| j.page_id).collect()
    }

    #[test]
    fn test_high_tier_dispatches_first() {
        let mut queue = JobQueue::new();
        queue.push(job("n1", Priority::Normal));
        queue.push(job("h1", Priority::High));
        queue.push(job("n2", Priority::Normal));
        queue.push(job("h2", Priority::High));

        assert_eq!(drain(&mut queue), vec!["h1", "h2", "n1", "n2"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_duplicate_push_is_unchanged() {
        let mut queue = JobQueue::new();
        assert_eq!(queue.push(job("p1", Priority::High)), PushOutcome::Inserted);
        assert_eq!(queue.push(job("p1", Priority::High)), PushOutcome::Unchanged);
        assert_eq!(queue.push(job("p1", Priority::Normal)), PushOutcome::Unchanged);

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.priority_of("p1"), Some(Priority::High));
    }

    #[test]
    fn test_high_push_promotes_normal_job() {
        let mut queue = JobQueue::new();
        queue.push(job("h1", Priority::High));
        queue.push(job("p1", Priority::Normal));
        queue.push(job("p2", Priority::Normal));

        assert_eq!(queue.push(job("p2", Priority::High)), PushOutcome::Promoted);
        assert_eq!(queue.len(), 3);
        assert_eq!(drain(&mut queue), vec!["h1", "p2", "p1"]);
    }

    #[test]
    fn test_promote_goes_to_back_of_high_tier() {
        let mut queue = JobQueue::new();
        queue.push(job("p1", Priority::Normal));
        queue.push(job("p2", Priority::Normal));
        queue.push(job("h1", Priority::High));

        assert!(queue.promote("p2", Priority::High));
        assert!(!queue.promote("p2", Priority::High));
        assert!(!queue.promote("missing", Priority::High));

        let jobs = queue.jobs();
        assert_eq!(jobs[1].page_id, "p2");
        assert_eq!(jobs[1].priority, Priority::High);
        assert_eq!(drain(&mut queue), vec!["h1", "p2", "p1"]);
    }

    #[test]
    fn test_remove_waiting_job() {
        let mut queue = JobQueue::new();
        queue.push(job("p1", Priority::Normal));
        queue.push(job("p2", Priority::Normal));

        assert_eq!(queue.remove("p1").map(|j| j.page_id), Some("p1".to_string()));
        assert!(queue.remove("p1").is_none());
        assert!(!queue.contains("p1"));
        assert_eq!(drain(&mut queue), vec!["p2"]);
    }
}
