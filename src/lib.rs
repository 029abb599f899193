//! # a3s-audit
//!
//! Tamper-evident, asynchronously dispatched audit trail for the A3S ecosystem.
//!
//! ## Overview
//!
//! `a3s-audit` signs every audit record at write time, ships a redacted copy
//! to a job queue, and later re-verifies stored records to detect drift.
//! Queue, cache and store backends are pluggable traits with in-memory
//! implementations for tests and single-process use.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use a3s_audit::{
//!     AuditConfig, AuditEvent, AuditPipeline, MemoryJobQueue, MemoryKvCache,
//!     MemoryRecordStore, StaticSecret,
//! };
//!
//! # async fn example() -> a3s_audit::Result<()> {
//! let pipeline = AuditPipeline::new(
//!     AuditConfig::default(),
//!     &StaticSecret::new("change-me"),
//!     Arc::new(MemoryRecordStore::new()),
//!     Arc::new(MemoryJobQueue::new()),
//!     Arc::new(MemoryKvCache::new()),
//! )?;
//!
//! let outcome = pipeline
//!     .record(AuditEvent::new("login", "User signed in").with_actor("user-42"))
//!     .await?;
//! assert!(pipeline.signer().verify(&outcome.record));
//!
//! let report = pipeline.auditor().perform_integrity_check(None, None).await?;
//! println!("checked {} records: {:?}", report.total_checked, report.status);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **IntegritySigner**: canonical JSON + HMAC-SHA256 signatures (`v1:<hex>`)
//! - **Redactor**: masks sensitive keys and scrubs sensitive value patterns
//! - **RetryExecutor**: exponential backoff with jitter over a closed failure taxonomy
//! - **Dispatcher**: priority routing, chunked and bucketed batching, queue health
//! - **IntegrityAuditor**: paged re-verification and privileged re-signing

pub mod auditor;
pub mod batch;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod redact;
pub mod retry;
pub mod signer;
pub mod store;
pub mod types;

// Re-export core types
pub use auditor::{
    AllowList, AuditReport, CorruptedRecord, CorruptionReason, IntegrityAuditor,
    OperatorAuthority, RemediationGrant, ReportStatus, SignatureRegeneration,
};
pub use batch::{BatchAccumulator, KvCache, MemoryKvCache, Versioned};
pub use config::{
    AuditConfig, AuditorConfig, DispatchConfig, EnvSecret, HealthThresholds, PatternRule,
    RedactionConfig, RetryConfig, SecretSource, SignerConfig, StaticSecret,
};
pub use dispatch::{route_queue, BatchOutcome, DispatchJob, Dispatcher, JobHandler, JobStatus};
pub use error::{AuditError, Result};
pub use metrics::{HealthReport, HealthStatus, QueueStat, QueueStats};
pub use pipeline::{AuditPipeline, RecordOutcome};
pub use queue::{JobPayload, JobQueue, MemoryJobQueue, QueuedJob, ReservedJob};
pub use redact::Redactor;
pub use retry::{Classify, FailureClass, RetryExecutor, RetryStats};
pub use signer::{FieldChange, IntegritySigner, Signable};
pub use store::{MemoryRecordStore, PageCursor, RecordStore};
pub use types::{AuditEvent, DateRange, RequestContext, SignedRecord};
