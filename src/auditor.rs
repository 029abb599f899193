//! Bulk re-verification of stored audit records
//!
//! The auditor pages through the record store, recomputes every signature
//! and reports drift. A single bad record never aborts a scan; a store
//! failure does, since a partial scan must not look clean.
//!
//! Re-signing a record is remediation, not routine work: it requires a
//! [`RemediationGrant`] whose operator the auditor's own
//! [`OperatorAuthority`] still recognizes, and always leaves a signed trail
//! entry behind.

use crate::config::AuditorConfig;
use crate::error::{AuditError, Result};
use crate::signer::IntegritySigner;
use crate::store::{PageCursor, RecordStore};
use crate::types::{AuditEvent, DateRange, SignedRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

/// Event type of the trail entry written by `regenerate_signature`
pub const SIGNATURE_REGENERATED: &str = "integrity.signature_regenerated";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    /// Every record in the window verified
    Clean,
    /// No mismatches, but some records carry no signature
    MissingSignatures,
    /// At least one record failed verification
    CorruptionDetected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum CorruptionReason {
    /// Stored signature differs from the recomputed one
    SignatureMismatch,
    /// Record could not be canonicalized
    Malformed(String),
}

/// Summary of one record that failed verification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorruptedRecord {
    pub id: String,
    pub event_type: String,
    pub created_at: DateTime<Utc>,
    pub actor_id: Option<String>,
    pub reason: CorruptionReason,
}

/// Result of an integrity scan
///
/// `valid + invalid + missing_signature == total_checked`; `errored` counts
/// the malformed records included in `invalid`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditReport {
    pub total_checked: usize,
    pub valid: usize,
    pub invalid: usize,
    pub missing_signature: usize,
    pub errored: usize,
    pub corrupted: Vec<CorruptedRecord>,
    /// Window actually scanned
    pub window: DateRange,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub status: ReportStatus,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.status == ReportStatus::Clean
    }
}

/// Decides which operators may re-sign records
pub trait OperatorAuthority: Send + Sync {
    fn is_privileged(&self, operator_id: &str) -> bool;
}

/// Fixed set of privileged operators
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    operators: HashSet<String>,
}

impl AllowList {
    pub fn new<I, S>(operators: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            operators: operators.into_iter().map(Into::into).collect(),
        }
    }
}

impl OperatorAuthority for AllowList {
    fn is_privileged(&self, operator_id: &str) -> bool {
        self.operators.contains(operator_id)
    }
}

/// Proof that an operator was authorized to re-sign records
///
/// Fields are private; the only way to obtain one is [`RemediationGrant::issue`].
/// A grant is not trusted on its own: `regenerate_signature` checks its
/// operator against the auditor's authority again.
#[derive(Debug, Clone)]
pub struct RemediationGrant {
    operator_id: String,
    reason: String,
    issued_at: DateTime<Utc>,
}

impl RemediationGrant {
    /// Issue a grant if `authority` recognizes the operator
    ///
    /// A reason is mandatory; it is written into the remediation trail.
    pub fn issue(
        authority: &dyn OperatorAuthority,
        operator_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<Self> {
        let operator_id = operator_id.into();
        let reason = reason.into();

        if reason.trim().is_empty() {
            return Err(AuditError::Validation(
                "Remediation requires a reason".to_string(),
            ));
        }
        if operator_id.trim().is_empty() || !authority.is_privileged(&operator_id) {
            tracing::warn!(
                target: "a3s_audit::remediation",
                operator = %operator_id,
                "Remediation grant refused"
            );
            return Err(AuditError::Authorization(format!(
                "Operator '{}' may not regenerate signatures",
                operator_id
            )));
        }

        Ok(Self {
            operator_id,
            reason,
            issued_at: Utc::now(),
        })
    }

    pub fn operator_id(&self) -> &str {
        &self.operator_id
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }
}

/// Outcome of a successful signature regeneration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureRegeneration {
    pub record_id: String,
    pub old_signature: Option<String>,
    pub new_signature: String,
    pub operator_id: String,
    pub reason: String,
    pub regenerated_at: DateTime<Utc>,
    /// Id of the trail entry recording this action
    pub trail_record_id: String,
}

/// Scans stored records and re-signs them under a grant
pub struct IntegrityAuditor {
    signer: Arc<IntegritySigner>,
    store: Arc<dyn RecordStore>,
    authority: Arc<dyn OperatorAuthority>,
    config: AuditorConfig,
}

impl IntegrityAuditor {
    pub fn new(
        signer: Arc<IntegritySigner>,
        store: Arc<dyn RecordStore>,
        authority: Arc<dyn OperatorAuthority>,
        config: AuditorConfig,
    ) -> Self {
        Self {
            signer,
            store,
            authority,
            config,
        }
    }

    /// Issue a grant against this auditor's authority
    pub fn issue_grant(
        &self,
        operator_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<RemediationGrant> {
        RemediationGrant::issue(self.authority.as_ref(), operator_id, reason)
    }

    /// Re-verify every record in `range` (all time when `None`)
    ///
    /// The upper bound is clamped to the scan start, so records written
    /// while the scan runs are left for the next one.
    pub async fn perform_integrity_check(
        &self,
        range: Option<DateRange>,
        batch_size: Option<usize>,
    ) -> Result<AuditReport> {
        let batch_size = batch_size.unwrap_or(self.config.batch_size);
        if batch_size == 0 {
            return Err(AuditError::Validation(
                "Integrity scan batch size must be >= 1".to_string(),
            ));
        }

        let started_at = Utc::now();
        let timer = Instant::now();
        let requested = range.unwrap_or_else(|| DateRange::new(DateTime::<Utc>::MIN_UTC, started_at));
        let window = DateRange::new(requested.start, requested.end.min(started_at));

        tracing::info!(
            store = self.store.name(),
            start = %window.start,
            end = %window.end,
            batch_size,
            "Integrity scan started"
        );

        let mut total_checked = 0;
        let mut valid = 0;
        let mut missing_signature = 0;
        let mut errored = 0;
        let mut corrupted = Vec::new();
        let mut cursor: Option<PageCursor> = None;

        loop {
            let page = self.store.page(&window, cursor.as_ref(), batch_size).await?;
            let Some(last) = page.last() else {
                break;
            };
            cursor = Some(PageCursor::after(last));
            let full_page = page.len() == batch_size;

            for record in &page {
                total_checked += 1;
                if !record.has_signature() {
                    missing_signature += 1;
                    continue;
                }
                match self.signer.try_verify(record) {
                    Ok(true) => valid += 1,
                    Ok(false) => corrupted.push(corruption(record, CorruptionReason::SignatureMismatch)),
                    Err(e) => {
                        errored += 1;
                        corrupted.push(corruption(record, CorruptionReason::Malformed(e.to_string())));
                    }
                }
            }

            tracing::debug!(checked = total_checked, "Integrity scan page verified");
            if !full_page {
                break;
            }
        }

        for record in &corrupted {
            tracing::error!(
                record_id = %record.id,
                event_type = %record.event_type,
                created_at = %record.created_at,
                reason = ?record.reason,
                "Audit record failed integrity check"
            );
        }

        let invalid = corrupted.len();
        let status = if invalid > 0 {
            ReportStatus::CorruptionDetected
        } else if missing_signature > 0 {
            ReportStatus::MissingSignatures
        } else {
            ReportStatus::Clean
        };
        let elapsed_ms = timer.elapsed().as_millis() as u64;

        tracing::info!(
            total = total_checked,
            valid,
            invalid,
            missing = missing_signature,
            elapsed_ms,
            status = ?status,
            "Integrity scan complete"
        );

        Ok(AuditReport {
            total_checked,
            valid,
            invalid,
            missing_signature,
            errored,
            corrupted,
            window,
            started_at,
            elapsed_ms,
            status,
        })
    }

    /// Re-sign a record from its current contents
    ///
    /// A grant whose operator this auditor's authority does not recognize
    /// is refused with [`AuditError::Authorization`] before anything is
    /// read. Every later failure is reported as [`AuditError::Remediation`];
    /// if the new signature was stored but the trail entry could not be
    /// written, that is a failure too.
    pub async fn regenerate_signature(
        &self,
        record_id: &str,
        grant: &RemediationGrant,
    ) -> Result<SignatureRegeneration> {
        if !self.authority.is_privileged(&grant.operator_id) {
            tracing::warn!(
                target: "a3s_audit::remediation",
                record_id = %record_id,
                operator = %grant.operator_id,
                grant_issued_at = %grant.issued_at,
                "Signature regeneration refused, operator not recognized"
            );
            return Err(AuditError::Authorization(format!(
                "Operator '{}' may not regenerate signatures",
                grant.operator_id
            )));
        }

        let fail = |reason: String| {
            tracing::error!(
                target: "a3s_audit::remediation",
                record_id = %record_id,
                operator = %grant.operator_id,
                reason = %reason,
                "Signature regeneration failed"
            );
            AuditError::Remediation {
                record_id: record_id.to_string(),
                reason,
            }
        };

        let record = self
            .store
            .get(record_id)
            .await
            .map_err(|e| fail(format!("failed to load record: {}", e)))?
            .ok_or_else(|| fail("record not found".to_string()))?;

        let new_signature = self
            .signer
            .sign(&record)
            .map_err(|e| fail(format!("failed to sign record: {}", e)))?;

        self.store
            .update_signature(record_id, &new_signature, self.signer.version())
            .await
            .map_err(|e| fail(format!("failed to store signature: {}", e)))?;

        let regenerated_at = Utc::now();
        tracing::warn!(
            target: "a3s_audit::remediation",
            record_id = %record_id,
            operator = %grant.operator_id,
            reason = %grant.reason,
            old_signature = ?record.signature,
            new_signature = %new_signature,
            "Audit record signature regenerated"
        );

        let trail = AuditEvent::new(
            SIGNATURE_REGENERATED,
            format!("Signature regenerated for audit record {}", record_id),
        )
        .with_actor(grant.operator_id.clone())
        .with_subject("audit_record", record_id)
        .with_property("reason", json!(grant.reason))
        .with_property("old_signature", json!(record.signature))
        .with_property("new_signature", json!(new_signature))
        .with_property("grant_issued_at", json!(grant.issued_at))
        .with_risk_level(8)
        .at(regenerated_at);
        let trail_record_id = trail.id.clone();

        let sealed = self.signer.seal(trail).map_err(|e| {
            fail(format!("signature updated but trail entry could not be signed: {}", e))
        })?;
        self.store.insert(sealed).await.map_err(|e| {
            fail(format!("signature updated but trail entry could not be stored: {}", e))
        })?;

        Ok(SignatureRegeneration {
            record_id: record_id.to_string(),
            old_signature: record.signature,
            new_signature,
            operator_id: grant.operator_id.clone(),
            reason: grant.reason.clone(),
            regenerated_at,
            trail_record_id,
        })
    }
}

fn corruption(record: &SignedRecord, reason: CorruptionReason) -> CorruptedRecord {
    CorruptedRecord {
        id: record.event.id.clone(),
        event_type: record.event.event_type.clone(),
        created_at: record.event.created_at,
        actor_id: record.event.actor_id.clone(),
        reason,
    }
}
