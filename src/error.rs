//! Error types for a3s-audit

use thiserror::Error;

/// Errors that can occur in the audit pipeline
#[derive(Debug, Error)]
pub enum AuditError {
    /// Fatal configuration problem (missing signing secret, invalid pattern, ...)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A single record could not be verified
    ///
    /// Local to one record; batch and scan operations isolate it.
    #[error("Verification failed for record '{record_id}': {reason}")]
    Verification {
        record_id: String,
        reason: String,
    },

    /// Queue/broker unavailable or rejected the job
    #[error("Failed to dispatch to queue '{queue}': {reason}")]
    Dispatch {
        queue: String,
        reason: String,
    },

    /// Network-level failure talking to a collaborator
    #[error("Connection error: {0}")]
    Connection(String),

    /// Outbound HTTP call returned a failure status
    #[error("HTTP {status}: {reason}")]
    Http {
        status: u16,
        reason: String,
    },

    /// Datastore failure carrying the driver's error code
    #[error("Datastore error {code}: {reason}")]
    Datastore {
        code: String,
        reason: String,
    },

    /// Input rejected by validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Caller is not allowed to perform the operation
    #[error("Authorization error: {0}")]
    Authorization(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Record store failure
    #[error("Store error: {0}")]
    Store(String),

    /// Record or job not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Signature regeneration failed; must be surfaced to operators
    #[error("Remediation failed for record '{record_id}': {reason}")]
    Remediation {
        record_id: String,
        reason: String,
    },
}

/// Result type alias for audit operations
pub type Result<T> = std::result::Result<T, AuditError>;
