//! End-to-end audit pipeline
//!
//! `AuditPipeline` wires the components together for the common write
//! path: seal and persist the record of truth, then dispatch a redacted
//! copy. Persistence errors propagate; dispatch is best effort.

use crate::auditor::{AllowList, IntegrityAuditor};
use crate::batch::KvCache;
use crate::config::{AuditConfig, SecretSource};
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::queue::JobQueue;
use crate::redact::Redactor;
use crate::retry::RetryExecutor;
use crate::signer::IntegritySigner;
use crate::store::RecordStore;
use crate::types::{AuditEvent, SignedRecord};
use std::sync::Arc;

/// What `record` produced
#[derive(Debug, Clone)]
pub struct RecordOutcome {
    /// The persisted, signed record
    pub record: SignedRecord,
    /// Local job id of the redacted copy, if dispatch succeeded
    pub job_id: Option<String>,
}

pub struct AuditPipeline {
    signer: Arc<IntegritySigner>,
    redactor: Redactor,
    dispatcher: Dispatcher,
    auditor: IntegrityAuditor,
    store: Arc<dyn RecordStore>,
}

impl AuditPipeline {
    /// Build every component from one configuration
    ///
    /// Fails if the configuration is invalid or the secret is unavailable.
    pub fn new(
        config: AuditConfig,
        secret: &dyn SecretSource,
        store: Arc<dyn RecordStore>,
        queue: Arc<dyn JobQueue>,
        cache: Arc<dyn KvCache>,
    ) -> Result<Self> {
        config.validate()?;

        let signer = Arc::new(IntegritySigner::from_source(secret, config.signer)?);
        let redactor = Redactor::new(&config.redaction)?;
        let dispatcher = Dispatcher::new(
            config.dispatch,
            config.health,
            queue,
            cache,
            RetryExecutor::new(config.retry),
        );
        let authority = Arc::new(AllowList::new(config.auditor.remediation_operators.iter().cloned()));
        let auditor = IntegrityAuditor::new(signer.clone(), store.clone(), authority, config.auditor);

        tracing::info!(
            store = store.name(),
            signature_version = signer.version(),
            "Audit pipeline initialized"
        );

        Ok(Self {
            signer,
            redactor,
            dispatcher,
            auditor,
            store,
        })
    }

    /// Seal and persist an event, then dispatch its redacted copy
    pub async fn record(&self, event: AuditEvent) -> Result<RecordOutcome> {
        let record = self.signer.seal(event)?;
        self.store.insert(record.clone()).await?;

        let outward = self.redactor.redact_event(&record.event);
        let job_id = self.dispatcher.log_async(&outward, None, None).await;

        Ok(RecordOutcome { record, job_id })
    }

    /// Like `record`, but the redacted copy goes through batch buckets
    ///
    /// Dispatch stays best effort: a copy that reached neither a bucket nor
    /// the broker is logged, and the persisted record is still returned.
    pub async fn record_batched(&self, event: AuditEvent) -> Result<SignedRecord> {
        let record = self.signer.seal(event)?;
        self.store.insert(record.clone()).await?;

        let outward = self.redactor.redact_event(&record.event);
        if let Err(e) = self.dispatcher.add_to_batch(&outward).await {
            tracing::warn!(event_id = %record.event.id, error = %e, "Batched dispatch failed");
        }

        Ok(record)
    }

    pub fn signer(&self) -> &IntegritySigner {
        &self.signer
    }

    pub fn redactor(&self) -> &Redactor {
        &self.redactor
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn auditor(&self) -> &IntegrityAuditor {
        &self.auditor
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }
}
