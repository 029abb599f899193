//! Dispatch metrics and queue health
//!
//! Counters here are eventually consistent atomics. They are kept apart
//! from the batch accumulator, which needs strict compare-and-swap.

use crate::config::HealthThresholds;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Incrementally updated arithmetic mean
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningMean {
    pub count: u64,
    pub mean: f64,
}

impl RunningMean {
    pub fn record(&mut self, sample: f64) {
        self.count += 1;
        self.mean += (sample - self.mean) / self.count as f64;
    }
}

#[derive(Debug, Default)]
struct QueueCounters {
    dispatched: AtomicU64,
    dispatch_failed: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
}

/// Per-queue counters and timing means
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    queues: DashMap<String, QueueCounters>,
    dispatch_ms: Mutex<RunningMean>,
    processing_ms: Mutex<RunningMean>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A job was accepted by the broker
    pub fn record_dispatch(&self, queue: &str, elapsed: Duration) {
        self.counter(queue, |c| &c.dispatched);
        update_mean(&self.dispatch_ms, elapsed);
    }

    /// The broker rejected a job after retries
    pub fn record_dispatch_failure(&self, queue: &str) {
        self.counter(queue, |c| &c.dispatch_failed);
    }

    pub fn record_processed(&self, queue: &str, elapsed: Duration) {
        self.counter(queue, |c| &c.processed);
        update_mean(&self.processing_ms, elapsed);
    }

    pub fn record_failed(&self, queue: &str, elapsed: Duration) {
        self.counter(queue, |c| &c.failed);
        update_mean(&self.processing_ms, elapsed);
    }

    /// Queues that have recorded at least one event
    pub fn known_queues(&self) -> Vec<String> {
        self.queues.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Assemble stats for the given queues and their broker depths
    ///
    /// `None` depth means the broker could not be asked.
    pub fn snapshot(&self, depths: Vec<(String, Option<usize>)>) -> QueueStats {
        let mut queues = Vec::with_capacity(depths.len());
        for (queue, depth) in depths {
            let (dispatched, dispatch_failed, processed, failed) = match self.queues.get(&queue) {
                Some(c) => (
                    c.dispatched.load(Ordering::Relaxed),
                    c.dispatch_failed.load(Ordering::Relaxed),
                    c.processed.load(Ordering::Relaxed),
                    c.failed.load(Ordering::Relaxed),
                ),
                None => (0, 0, 0, 0),
            };
            queues.push(QueueStat {
                queue,
                depth,
                dispatched,
                dispatch_failed,
                processed,
                failed,
            });
        }

        let total_dispatched = queues.iter().map(|q| q.dispatched).sum();
        let total_processed: u64 = queues.iter().map(|q| q.processed).sum();
        let total_failed: u64 = queues.iter().map(|q| q.failed).sum();
        let finished = total_processed + total_failed;
        let success_rate = if finished == 0 {
            100.0
        } else {
            total_processed as f64 / finished as f64 * 100.0
        };

        QueueStats {
            queues,
            total_dispatched,
            total_processed,
            total_failed,
            avg_dispatch_ms: read_mean(&self.dispatch_ms).mean,
            avg_processing_ms: read_mean(&self.processing_ms).mean,
            success_rate,
            collected_at: Utc::now(),
        }
    }

    fn counter(&self, queue: &str, field: impl Fn(&QueueCounters) -> &AtomicU64) {
        if let Some(counters) = self.queues.get(queue) {
            field(counters.value()).fetch_add(1, Ordering::Relaxed);
            return;
        }
        let counters = self.queues.entry(queue.to_string()).or_default();
        field(&*counters).fetch_add(1, Ordering::Relaxed);
    }
}

fn update_mean(mean: &Mutex<RunningMean>, elapsed: Duration) {
    let mut guard = mean.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    guard.record(elapsed.as_secs_f64() * 1000.0);
}

fn read_mean(mean: &Mutex<RunningMean>) -> RunningMean {
    *mean.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Counters for one queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStat {
    pub queue: String,
    pub depth: Option<usize>,
    pub dispatched: u64,
    pub dispatch_failed: u64,
    pub processed: u64,
    pub failed: u64,
}

/// Snapshot returned by `get_queue_stats`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queues: Vec<QueueStat>,
    pub total_dispatched: u64,
    pub total_processed: u64,
    pub total_failed: u64,
    pub avg_dispatch_ms: f64,
    pub avg_processing_ms: f64,
    /// Percent of finished jobs that succeeded (100 when none finished)
    pub success_rate: f64,
    pub collected_at: DateTime<Utc>,
}

/// Overall queue health, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
    pub stats: QueueStats,
}

/// Derive a health report from a stats snapshot
pub fn evaluate_health(stats: QueueStats, thresholds: &HealthThresholds) -> HealthReport {
    let mut status = HealthStatus::Healthy;
    let mut issues = Vec::new();
    let mut recommendations = Vec::new();

    for queue in &stats.queues {
        match queue.depth {
            Some(depth) if depth > thresholds.queue_depth_warning => {
                status = status.max(HealthStatus::Warning);
                issues.push(format!(
                    "Queue '{}' has {} pending jobs (threshold {})",
                    queue.queue, depth, thresholds.queue_depth_warning
                ));
                recommendations.push(format!(
                    "Add workers for queue '{}' or check for a stalled consumer",
                    queue.queue
                ));
            }
            None => {
                status = status.max(HealthStatus::Warning);
                issues.push(format!("Depth of queue '{}' is unavailable", queue.queue));
                recommendations.push("Check broker connectivity".to_string());
            }
            _ => {}
        }
    }

    if stats.success_rate < thresholds.success_rate_critical {
        status = HealthStatus::Critical;
        issues.push(format!(
            "Job success rate is {:.1}% (threshold {:.1}%)",
            stats.success_rate, thresholds.success_rate_critical
        ));
        recommendations.push("Inspect failed jobs and handler errors".to_string());
    }

    if stats.avg_processing_ms > thresholds.processing_time_critical_ms {
        status = HealthStatus::Critical;
        issues.push(format!(
            "Average processing time is {:.0}ms (critical threshold {:.0}ms)",
            stats.avg_processing_ms, thresholds.processing_time_critical_ms
        ));
        recommendations.push("Profile job handlers and downstream dependencies".to_string());
    } else if stats.avg_processing_ms > thresholds.processing_time_warning_ms {
        status = status.max(HealthStatus::Warning);
        issues.push(format!(
            "Average processing time is {:.0}ms (warning threshold {:.0}ms)",
            stats.avg_processing_ms, thresholds.processing_time_warning_ms
        ));
        recommendations.push("Consider smaller batches or more workers".to_string());
    }

    HealthReport {
        status,
        issues,
        recommendations,
        stats,
    }
}
