//! Asynchronous delivery of redacted audit events
//!
//! The dispatcher classifies events by priority, optionally batches them,
//! and hands them to a [`JobQueue`] through the [`RetryExecutor`]. Delivery
//! is a side effect of recording an event, never a precondition: broker
//! failures are logged and reported as `None` by the soft entry points.
//! A bucketed batch that fails to go out is put back in its bucket for the
//! next flush rather than dropped.
//!
//! Job ids (`job-<uuid>`) are local, ephemeral handles. The broker's own id
//! is kept next to them in the tracking table but nothing is persisted, so
//! `job_status` only knows about jobs dispatched by this process.

use crate::batch::{bucket_key, bucket_minute, BatchAccumulator, KvCache};
use crate::config::{DispatchConfig, HealthThresholds};
use crate::error::{AuditError, Result};
use crate::metrics::{evaluate_health, HealthReport, HealthStatus, MetricsAggregator, QueueStats};
use crate::queue::{JobPayload, JobQueue, QueuedJob};
use crate::retry::{RetryExecutor, RetryStats};
use crate::types::AuditEvent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Pick the queue for an event
///
/// High-priority type tags and risk levels at or above the threshold go to
/// the high-priority queue; everything else to the default queue.
pub fn route_queue<'a>(event_type: &str, risk_level: u8, config: &'a DispatchConfig) -> &'a str {
    let high_priority = risk_level >= config.high_risk_threshold
        || config.high_priority_types.iter().any(|t| t == event_type);
    if high_priority {
        &config.high_priority_queue
    } else {
        &config.default_queue
    }
}

/// Lifecycle of a dispatched job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Dispatched,
    Processing,
    Done,
    Failed,
}

/// Local tracking entry for a dispatched job
///
/// Entries keep their payload until pruned with `prune_jobs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchJob {
    pub job_id: String,
    pub queue: String,
    /// Id assigned by the broker on enqueue
    pub broker_id: String,
    pub payload: JobPayload,
    pub event_count: usize,
    pub dispatched_at: DateTime<Utc>,
    pub status: JobStatus,
    /// Handler error for failed jobs
    pub error: Option<String>,
}

/// What became of an event handed to `add_to_batch`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Waiting in its bucket for more events or the next flush
    Buffered,
    /// This append filled the bucket and the batch went out as this job
    Dispatched(String),
    /// The full batch could not be dispatched and is back in its bucket
    Requeued,
    /// The cache was unavailable, so the event went out on its own as this job
    Direct(String),
}

/// Consumer-side processing of one job
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &QueuedJob) -> Result<()>;
}

/// Routes, batches and enqueues audit events
pub struct Dispatcher {
    config: DispatchConfig,
    thresholds: HealthThresholds,
    queue: Arc<dyn JobQueue>,
    accumulator: BatchAccumulator,
    retry: RetryExecutor,
    metrics: MetricsAggregator,

    /// job_id → tracking entry
    jobs: DashMap<String, DispatchJob>,

    /// Bucket keys that may hold events → the minute they belong to
    buckets: DashMap<String, DateTime<Utc>>,
}

impl Dispatcher {
    pub fn new(
        config: DispatchConfig,
        thresholds: HealthThresholds,
        queue: Arc<dyn JobQueue>,
        cache: Arc<dyn KvCache>,
        retry: RetryExecutor,
    ) -> Self {
        let accumulator = BatchAccumulator::new(cache, config.batch_size);
        Self {
            config,
            thresholds,
            queue,
            accumulator,
            retry,
            metrics: MetricsAggregator::new(),
            jobs: DashMap::new(),
            buckets: DashMap::new(),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Queue an event would be routed to
    pub fn route(&self, event: &AuditEvent) -> &str {
        route_queue(&event.event_type, event.risk_level, &self.config)
    }

    /// Enqueue one event, returning the local job id or the dispatch error
    pub async fn try_log_async(
        &self,
        event: &AuditEvent,
        queue: Option<&str>,
        delay: Option<Duration>,
    ) -> Result<String> {
        let queue = queue.unwrap_or_else(|| self.route(event)).to_string();
        self.enqueue(&queue, JobPayload::Single(event.clone()), delay)
            .await
    }

    /// Enqueue one event; failures are logged and yield `None`
    pub async fn log_async(
        &self,
        event: &AuditEvent,
        queue: Option<&str>,
        delay: Option<Duration>,
    ) -> Option<String> {
        match self.try_log_async(event, queue, delay).await {
            Ok(job_id) => Some(job_id),
            Err(e) => {
                tracing::warn!(event_id = %event.id, error = %e, "Audit event dispatch failed");
                None
            }
        }
    }

    /// Enqueue events in chunks of `batch_chunk_size`, one job per chunk
    ///
    /// Returns one slot per chunk, in order; a chunk that could not be
    /// dispatched yields `None`.
    pub async fn log_batch_async(
        &self,
        events: &[AuditEvent],
        queue: Option<&str>,
    ) -> Vec<Option<String>> {
        let queue = queue.unwrap_or(self.config.batch_queue.as_str());
        let sends = events
            .chunks(self.config.batch_chunk_size.max(1))
            .map(|chunk| self.dispatch_batch(queue, chunk.to_vec()));
        futures::future::join_all(sends).await
    }

    /// Append an event to the current minute's bucket
    ///
    /// If the cache is unavailable the event is dispatched on its own. An
    /// error means the event reached neither a bucket nor the broker.
    pub async fn add_to_batch(&self, event: &AuditEvent) -> Result<BatchOutcome> {
        let now = Utc::now();
        let key = bucket_key(&self.config.bucket_prefix, now);
        self.buckets.insert(key.clone(), bucket_minute(now));

        match self.accumulator.append(&key, event).await {
            Ok(Some(batch)) => {
                tracing::info!(bucket = %key, events = batch.len(), "Batch bucket full, flushing");
                self.deliver_or_restore(&key, batch).await
            }
            Ok(None) => Ok(BatchOutcome::Buffered),
            Err(e) => {
                tracing::warn!(
                    bucket = %key,
                    event_id = %event.id,
                    error = %e,
                    "Batch accumulation failed, dispatching event directly"
                );
                self.try_log_async(event, None, None).await.map(BatchOutcome::Direct)
            }
        }
    }

    /// Drain every tracked bucket and dispatch what it held
    ///
    /// Callers run this periodically (every `batch_wait_secs`); the
    /// dispatcher schedules nothing itself.
    pub async fn flush_batch(&self) -> Vec<String> {
        // Producers only write the current minute's key; anything two
        // minutes old that drains empty can be forgotten.
        let stale_before = bucket_minute(Utc::now()) - chrono::Duration::minutes(1);
        let tracked: Vec<(String, DateTime<Utc>)> = self
            .buckets
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();

        let mut batches = Vec::new();
        for (key, minute) in tracked {
            match self.accumulator.drain(&key).await {
                Ok(events) if events.is_empty() => {
                    if minute < stale_before {
                        self.buckets.remove_if(&key, |_, m| *m < stale_before);
                    }
                }
                Ok(events) => batches.push((key, events)),
                Err(e) => {
                    tracing::warn!(bucket = %key, error = %e, "Failed to drain batch bucket");
                }
            }
        }

        if batches.is_empty() {
            return Vec::new();
        }

        let events: usize = batches.iter().map(|(_, batch)| batch.len()).sum();
        let sends = batches
            .into_iter()
            .map(|(key, batch)| async move { self.deliver_or_restore(&key, batch).await });
        let mut job_ids = Vec::new();
        let mut requeued = 0;
        for outcome in futures::future::join_all(sends).await {
            match outcome {
                Ok(BatchOutcome::Dispatched(job_id)) => job_ids.push(job_id),
                Ok(_) => requeued += 1,
                // logged by deliver_or_restore
                Err(_) => {}
            }
        }

        tracing::info!(jobs = job_ids.len(), requeued, events, "Batch buckets flushed");
        job_ids
    }

    /// Events waiting in tracked buckets
    pub async fn pending_batch_events(&self) -> Result<usize> {
        let keys: Vec<String> = self.buckets.iter().map(|e| e.key().clone()).collect();
        let mut pending = 0;
        for key in keys {
            pending += self.accumulator.pending(&key).await?;
        }
        Ok(pending)
    }

    /// Per-queue depth and counters for the configured and observed queues
    pub async fn get_queue_stats(&self) -> QueueStats {
        let mut names = vec![
            self.config.default_queue.clone(),
            self.config.high_priority_queue.clone(),
            self.config.batch_queue.clone(),
        ];
        for queue in self.metrics.known_queues() {
            if !names.contains(&queue) {
                names.push(queue);
            }
        }

        let mut depths = Vec::with_capacity(names.len());
        for name in names {
            let depth = match self.queue.size(&name).await {
                Ok(depth) => Some(depth),
                Err(e) => {
                    tracing::warn!(queue = %name, error = %e, "Failed to read queue depth");
                    None
                }
            };
            depths.push((name, depth));
        }

        self.metrics.snapshot(depths)
    }

    pub async fn monitor_queue_health(&self) -> HealthReport {
        let report = evaluate_health(self.get_queue_stats().await, &self.thresholds);
        match report.status {
            HealthStatus::Healthy => {
                tracing::debug!("Audit queues healthy");
            }
            status => {
                tracing::warn!(status = %status, issues = ?report.issues, "Audit queues degraded");
            }
        }
        report
    }

    /// Reserve and process one job from `queue`
    ///
    /// Acks on success; on handler failure the job is released for
    /// redelivery. Returns `None` when nothing was available.
    pub async fn process_next(&self, queue: &str, handler: &dyn JobHandler) -> Result<Option<JobStatus>> {
        let Some(reserved) = self.queue.reserve(queue).await? else {
            return Ok(None);
        };
        let job_id = reserved.job.job_id.clone();
        self.set_status(&job_id, JobStatus::Processing, None);

        let started = Instant::now();
        match handler.handle(&reserved.job).await {
            Ok(()) => {
                self.queue.ack(queue, &reserved.receipt).await?;
                self.metrics.record_processed(queue, started.elapsed());
                self.set_status(&job_id, JobStatus::Done, None);
                tracing::debug!(job_id = %job_id, queue = %queue, "Audit job processed");
                Ok(Some(JobStatus::Done))
            }
            Err(e) => {
                self.metrics.record_failed(queue, started.elapsed());
                self.set_status(&job_id, JobStatus::Failed, Some(e.to_string()));
                tracing::warn!(
                    job_id = %job_id,
                    queue = %queue,
                    deliveries = reserved.deliveries,
                    error = %e,
                    "Audit job failed, releasing for redelivery"
                );
                self.queue.release(queue, &reserved.receipt).await?;
                Ok(Some(JobStatus::Failed))
            }
        }
    }

    pub fn job_status(&self, job_id: &str) -> Option<JobStatus> {
        self.jobs.get(job_id).map(|job| job.status)
    }

    pub fn job(&self, job_id: &str) -> Option<DispatchJob> {
        self.jobs.get(job_id).map(|job| job.clone())
    }

    /// Forget finished jobs dispatched before `before`, returning how many
    pub fn prune_jobs(&self, before: DateTime<Utc>) -> usize {
        let len = self.jobs.len();
        self.jobs.retain(|_, job| {
            !(matches!(job.status, JobStatus::Done | JobStatus::Failed) && job.dispatched_at < before)
        });
        len.saturating_sub(self.jobs.len())
    }

    pub fn retry_stats(&self) -> RetryStats {
        self.retry.stats()
    }

    /// Send a drained bucket; on failure put its events back under `key`
    async fn deliver_or_restore(&self, key: &str, batch: Vec<AuditEvent>) -> Result<BatchOutcome> {
        let queue = self.config.batch_queue.as_str();
        let count = batch.len();
        let dispatch_error = match self.enqueue(queue, JobPayload::Batch(batch.clone()), None).await {
            Ok(job_id) => return Ok(BatchOutcome::Dispatched(job_id)),
            Err(e) => e,
        };

        match self.accumulator.restore(key, batch).await {
            Ok(()) => {
                tracing::warn!(
                    bucket = %key,
                    queue = %queue,
                    events = count,
                    error = %dispatch_error,
                    "Audit batch dispatch failed, events restored to bucket"
                );
                Ok(BatchOutcome::Requeued)
            }
            Err(e) => {
                tracing::error!(
                    bucket = %key,
                    queue = %queue,
                    events = count,
                    dispatch_error = %dispatch_error,
                    error = %e,
                    "Audit batch lost, dispatch and bucket restore both failed"
                );
                Err(AuditError::Dispatch {
                    queue: queue.to_string(),
                    reason: format!("{} events undelivered and not restored: {}", count, e),
                })
            }
        }
    }

    async fn dispatch_batch(&self, queue: &str, events: Vec<AuditEvent>) -> Option<String> {
        let count = events.len();
        match self.enqueue(queue, JobPayload::Batch(events), None).await {
            Ok(job_id) => Some(job_id),
            Err(e) => {
                tracing::error!(queue = %queue, events = count, error = %e, "Audit batch dispatch failed");
                None
            }
        }
    }

    async fn enqueue(&self, queue: &str, payload: JobPayload, delay: Option<Duration>) -> Result<String> {
        let now = Utc::now();
        let delay = match delay {
            Some(delay) => chrono::Duration::from_std(delay)
                .map_err(|e| AuditError::Validation(format!("Invalid dispatch delay: {}", e)))?,
            None => chrono::Duration::zero(),
        };
        let job = QueuedJob {
            job_id: format!("job-{}", uuid::Uuid::new_v4()),
            queue: queue.to_string(),
            payload,
            dispatched_at: now,
            available_at: now + delay,
        };
        let job_id = job.job_id.clone();
        let event_count = job.payload.len();

        let started = Instant::now();
        let broker = self.queue.clone();
        let result = self
            .retry
            .execute_with_retry(
                || {
                    let broker = broker.clone();
                    let job = job.clone();
                    async move { broker.enqueue(job).await }
                },
                None,
            )
            .await;

        let broker_id = match result {
            Ok(id) => id,
            Err(e) => {
                self.metrics.record_dispatch_failure(queue);
                return Err(match e {
                    err @ AuditError::Dispatch { .. } => err,
                    other => AuditError::Dispatch {
                        queue: queue.to_string(),
                        reason: other.to_string(),
                    },
                });
            }
        };

        self.metrics.record_dispatch(queue, started.elapsed());
        self.jobs.insert(
            job_id.clone(),
            DispatchJob {
                job_id: job_id.clone(),
                queue: queue.to_string(),
                broker_id: broker_id.clone(),
                payload: job.payload,
                event_count,
                dispatched_at: now,
                status: JobStatus::Dispatched,
                error: None,
            },
        );

        tracing::debug!(
            job_id = %job_id,
            broker_id = %broker_id,
            queue = %queue,
            events = event_count,
            "Audit job dispatched"
        );
        Ok(job_id)
    }

    fn set_status(&self, job_id: &str, status: JobStatus, error: Option<String>) {
        if let Some(mut job) = self.jobs.get_mut(job_id) {
            job.status = status;
            job.error = error;
        }
    }
}
