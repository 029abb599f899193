//! Job queue abstraction for the broker audit jobs are handed to
//!
//! The broker is treated as an append-only work distributor: producers
//! enqueue, consumers reserve, then ack or release. Delivery is
//! at-least-once; consumers deduplicate by `job_id` if they need to.

use crate::error::{AuditError, Result};
use crate::types::AuditEvent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tokio::sync::Mutex;

/// Events carried by one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "events")]
pub enum JobPayload {
    Single(AuditEvent),
    Batch(Vec<AuditEvent>),
}

impl JobPayload {
    pub fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Batch(events) => events.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn events(&self) -> &[AuditEvent] {
        match self {
            Self::Single(event) => std::slice::from_ref(event),
            Self::Batch(events) => events,
        }
    }
}

/// A unit of work as handed to the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    /// Local tracking id (job-<uuid>), not the broker's id
    pub job_id: String,

    pub queue: String,

    pub payload: JobPayload,

    pub dispatched_at: DateTime<Utc>,

    /// Earliest time a consumer may reserve the job
    pub available_at: DateTime<Utc>,
}

/// A job reserved by a consumer, pending ack or release
#[derive(Debug, Clone)]
pub struct ReservedJob {
    /// Broker-assigned id used to ack or release
    pub receipt: String,

    pub job: QueuedJob,

    /// Number of times this job has been reserved
    pub deliveries: u32,
}

/// Core trait for queue backends
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job, returning the broker-assigned id
    async fn enqueue(&self, job: QueuedJob) -> Result<String>;

    /// Reserve the next available job on a queue
    async fn reserve(&self, queue: &str) -> Result<Option<ReservedJob>>;

    /// Confirm a reserved job was processed
    async fn ack(&self, queue: &str, receipt: &str) -> Result<()>;

    /// Return a reserved job to the queue for redelivery
    async fn release(&self, queue: &str, receipt: &str) -> Result<()>;

    /// Number of jobs waiting on a queue
    async fn size(&self, queue: &str) -> Result<usize>;

    /// Backend name (e.g., "memory", "redis")
    fn name(&self) -> &str;
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<(String, QueuedJob, u32)>,
    reserved: HashMap<String, (QueuedJob, u32)>,
}

/// In-memory queue for tests and single-process use
///
/// Supports fault injection so callers can exercise retry and
/// soft-failure paths.
#[derive(Default)]
pub struct MemoryJobQueue {
    queues: Mutex<HashMap<String, QueueState>>,
    sequence: AtomicU64,
    unavailable: AtomicBool,
    failures_remaining: AtomicU32,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a broker outage: every enqueue fails until cleared
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `n` enqueues with a connection error
    pub fn fail_next(&self, n: u32) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    /// Jobs waiting on a queue, oldest first
    pub async fn pending_jobs(&self, queue: &str) -> Vec<QueuedJob> {
        let queues = self.queues.lock().await;
        queues
            .get(queue)
            .map(|state| state.ready.iter().map(|(_, job, _)| job.clone()).collect())
            .unwrap_or_default()
    }

    fn injected_failure(&self, queue: &str) -> Option<AuditError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Some(AuditError::Dispatch {
                queue: queue.to_string(),
                reason: "broker unavailable".to_string(),
            });
        }
        let consumed = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        consumed.then(|| AuditError::Connection("connection reset by broker".to_string()))
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: QueuedJob) -> Result<String> {
        if let Some(err) = self.injected_failure(&job.queue) {
            return Err(err);
        }

        let receipt = format!("mem-{}", self.sequence.fetch_add(1, Ordering::SeqCst) + 1);
        let mut queues = self.queues.lock().await;
        queues
            .entry(job.queue.clone())
            .or_default()
            .ready
            .push_back((receipt.clone(), job, 0));
        Ok(receipt)
    }

    async fn reserve(&self, queue: &str) -> Result<Option<ReservedJob>> {
        let now = Utc::now();
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(None);
        };

        let Some(index) = state.ready.iter().position(|(_, job, _)| job.available_at <= now) else {
            return Ok(None);
        };
        let Some((receipt, job, deliveries)) = state.ready.remove(index) else {
            return Ok(None);
        };

        let deliveries = deliveries + 1;
        state.reserved.insert(receipt.clone(), (job.clone(), deliveries));
        Ok(Some(ReservedJob {
            receipt,
            job,
            deliveries,
        }))
    }

    async fn ack(&self, queue: &str, receipt: &str) -> Result<()> {
        let mut queues = self.queues.lock().await;
        queues
            .get_mut(queue)
            .and_then(|state| state.reserved.remove(receipt))
            .map(|_| ())
            .ok_or_else(|| AuditError::NotFound(format!("Reserved job {} on {}", receipt, queue)))
    }

    async fn release(&self, queue: &str, receipt: &str) -> Result<()> {
        let mut queues = self.queues.lock().await;
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| AuditError::NotFound(format!("Queue {}", queue)))?;
        let (job, deliveries) = state
            .reserved
            .remove(receipt)
            .ok_or_else(|| AuditError::NotFound(format!("Reserved job {} on {}", receipt, queue)))?;
        state.ready.push_back((receipt.to_string(), job, deliveries));
        Ok(())
    }

    async fn size(&self, queue: &str) -> Result<usize> {
        let queues = self.queues.lock().await;
        Ok(queues.get(queue).map(|state| state.ready.len()).unwrap_or(0))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(queue: &str, delay_secs: i64) -> QueuedJob {
        let now = Utc::now();
        QueuedJob {
            job_id: format!("job-{}", uuid::Uuid::new_v4()),
            queue: queue.to_string(),
            payload: JobPayload::Single(AuditEvent::new("login", "x")),
            dispatched_at: now,
            available_at: now + chrono::Duration::seconds(delay_secs),
        }
    }

    #[test]
    fn test_payload_len() {
        let single = JobPayload::Single(AuditEvent::new("a", "a"));
        let batch = JobPayload::Batch(vec![AuditEvent::new("a", "a"), AuditEvent::new("b", "b")]);
        assert_eq!(single.len(), 1);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.events()[1].event_type, "b");
        assert!(JobPayload::Batch(vec![]).is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_reserve_ack() {
        let queue = MemoryJobQueue::new();
        let queued = job("audit", 0);

        let receipt = queue.enqueue(queued.clone()).await.unwrap();
        assert_eq!(queue.size("audit").await.unwrap(), 1);

        let reserved = queue.reserve("audit").await.unwrap().unwrap();
        assert_eq!(reserved.receipt, receipt);
        assert_eq!(reserved.job, queued);
        assert_eq!(reserved.deliveries, 1);
        assert_eq!(queue.size("audit").await.unwrap(), 0);

        queue.ack("audit", &receipt).await.unwrap();
        assert!(queue.ack("audit", &receipt).await.is_err());
    }

    #[tokio::test]
    async fn test_release_redelivers() {
        let queue = MemoryJobQueue::new();
        queue.enqueue(job("audit", 0)).await.unwrap();

        let first = queue.reserve("audit").await.unwrap().unwrap();
        queue.release("audit", &first.receipt).await.unwrap();

        let second = queue.reserve("audit").await.unwrap().unwrap();
        assert_eq!(second.job.job_id, first.job.job_id);
        assert_eq!(second.deliveries, 2);
    }

    #[tokio::test]
    async fn test_delayed_job_not_reservable_yet() {
        let queue = MemoryJobQueue::new();
        queue.enqueue(job("audit", 3600)).await.unwrap();

        assert_eq!(queue.size("audit").await.unwrap(), 1);
        assert!(queue.reserve("audit").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_queue_is_empty() {
        let queue = MemoryJobQueue::new();
        assert_eq!(queue.size("nope").await.unwrap(), 0);
        assert!(queue.reserve("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let queue = MemoryJobQueue::new();

        queue.fail_next(2);
        assert!(matches!(queue.enqueue(job("audit", 0)).await, Err(AuditError::Connection(_))));
        assert!(queue.enqueue(job("audit", 0)).await.is_err());
        assert!(queue.enqueue(job("audit", 0)).await.is_ok());

        queue.set_unavailable(true);
        assert!(matches!(queue.enqueue(job("audit", 0)).await, Err(AuditError::Dispatch { .. })));
        queue.set_unavailable(false);
        assert!(queue.enqueue(job("audit", 0)).await.is_ok());
        assert_eq!(queue.size("audit").await.unwrap(), 2);
    }
}
