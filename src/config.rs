//! Pipeline configuration
//!
//! Every component receives its slice of [`AuditConfig`] at construction.
//! All fields have defaults, so a JSON file only needs the overrides.
//! The signing secret is never part of the file: it comes from a
//! [`SecretSource`].

use crate::error::{AuditError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration for the audit pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub signer: SignerConfig,
    pub redaction: RedactionConfig,
    pub retry: RetryConfig,
    pub dispatch: DispatchConfig,
    pub health: HealthThresholds,
    pub auditor: AuditorConfig,
}

impl AuditConfig {
    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            AuditError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: AuditConfig = serde_json::from_str(&json).map_err(|e| {
            AuditError::Config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;

        tracing::debug!(path = %path.display(), "Audit config loaded");
        Ok(config)
    }

    /// Reject values no component can run with
    pub fn validate(&self) -> Result<()> {
        if self.dispatch.batch_size == 0 {
            return Err(AuditError::Config("dispatch.batch_size must be >= 1".to_string()));
        }
        if self.dispatch.batch_chunk_size == 0 {
            return Err(AuditError::Config(
                "dispatch.batch_chunk_size must be >= 1".to_string(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(AuditError::Config(format!(
                "retry.multiplier must be >= 1.0, got {}",
                self.retry.multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            return Err(AuditError::Config(format!(
                "retry.jitter_ratio must be within 0.0..=1.0, got {}",
                self.retry.jitter_ratio
            )));
        }
        if self.auditor.batch_size == 0 {
            return Err(AuditError::Config("auditor.batch_size must be >= 1".to_string()));
        }
        if self.signer.version.is_empty() || self.signer.version.contains(':') {
            return Err(AuditError::Config(format!(
                "signer.version must be non-empty and contain no ':', got '{}'",
                self.signer.version
            )));
        }
        Ok(())
    }
}

/// Canonicalization and signing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignerConfig {
    /// Fields dropped from the canonical form
    pub excluded_fields: Vec<String>,

    /// Fields normalized to RFC 3339 UTC before signing, at any depth
    ///
    /// Unparseable values are rejected at the top level and left as-is when nested.
    pub timestamp_fields: Vec<String>,

    /// Appended to the master secret to derive the signing key
    pub key_namespace: String,

    /// Version tag prefixed to every signature
    pub version: String,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            excluded_fields: vec![
                "id".to_string(),
                "signature".to_string(),
                "signature_version".to_string(),
                "updated_at".to_string(),
            ],
            timestamp_fields: vec![
                "created_at".to_string(),
                "updated_at".to_string(),
                "occurred_at".to_string(),
            ],
            key_namespace: "integrity".to_string(),
            version: "v1".to_string(),
        }
    }
}

/// A named value pattern and the token that replaces its matches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternRule {
    pub name: String,
    pub pattern: String,
    pub replacement: String,
}

impl PatternRule {
    pub fn new(
        name: impl Into<String>,
        pattern: impl Into<String>,
        replacement: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
            replacement: replacement.into(),
        }
    }
}

/// Redaction settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactionConfig {
    /// Keys containing any of these (case-insensitive) are masked
    pub sensitive_keywords: Vec<String>,

    /// Value patterns, applied in order
    pub sensitive_patterns: Vec<PatternRule>,

    pub mask_char: char,

    /// Prefix length left visible by `mask_value`
    pub visible_chars: usize,

    /// Replacement for masked non-string values
    pub placeholder: String,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        let keywords = [
            "password",
            "passwd",
            "token",
            "secret",
            "key",
            "credit_card",
            "card_number",
            "cvv",
            "ssn",
            "phone",
            "email",
            "ip_address",
            "session",
            "auth",
            "cookie",
        ];

        Self {
            sensitive_keywords: keywords.iter().map(|k| k.to_string()).collect(),
            sensitive_patterns: vec![
                PatternRule::new(
                    "jwt",
                    r"eyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+",
                    "[JWT]",
                ),
                PatternRule::new(
                    "email",
                    r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}",
                    "[EMAIL]",
                ),
                PatternRule::new("credit_card", r"\b(?:\d[ -]?){12,18}\d\b", "[CARD]"),
                PatternRule::new("ipv4", r"\b(?:\d{1,3}\.){3}\d{1,3}\b", "[IP]"),
                PatternRule::new(
                    "phone",
                    r"(?:\+\d{1,3}[\s.-]?)?\(?\d{3}\)?[\s.-]\d{3}[\s.-]\d{4}\b",
                    "[PHONE]",
                ),
                PatternRule::new("opaque_token", r"\b[A-Za-z0-9]{32,}\b", "[TOKEN]"),
            ],
            mask_char: '*',
            visible_chars: 4,
            placeholder: "[REDACTED]".to_string(),
        }
    }
}

/// Backoff settings for the retry executor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt (0 = no retries)
    pub max_retries: u32,

    /// Delay before the first retry
    pub base_delay_ms: u64,

    /// Cap for exponential growth
    pub max_delay_ms: u64,

    /// Growth factor per attempt
    pub multiplier: f64,

    /// Upper bound of uniform jitter, as a fraction of the delay
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter_ratio: 0.1,
        }
    }
}

impl RetryConfig {
    /// A config that never retries
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }
}

/// Routing and batching settings for the dispatcher
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub default_queue: String,
    pub high_priority_queue: String,
    pub batch_queue: String,

    /// Event types always routed to the high-priority queue
    pub high_priority_types: Vec<String>,

    /// Risk level at or above which events are high priority
    pub high_risk_threshold: u8,

    /// Bucket size that triggers an immediate flush
    pub batch_size: usize,

    /// Expected interval between caller-driven `flush_batch` calls
    pub batch_wait_secs: u64,

    /// Events per job in `log_batch_async`
    pub batch_chunk_size: usize,

    /// Cache key prefix for per-minute buckets
    pub bucket_prefix: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_queue: "audit".to_string(),
            high_priority_queue: "audit-high".to_string(),
            batch_queue: "audit-batch".to_string(),
            high_priority_types: vec![
                "security_incident".to_string(),
                "login_failed".to_string(),
                "permission_escalation".to_string(),
                "data_breach".to_string(),
                "unauthorized_access".to_string(),
            ],
            high_risk_threshold: 7,
            batch_size: 100,
            batch_wait_secs: 30,
            batch_chunk_size: 100,
            bucket_prefix: "audit_batch".to_string(),
        }
    }
}

/// Thresholds for `monitor_queue_health`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    pub queue_depth_warning: usize,

    /// Success rate (percent) below which health is critical
    pub success_rate_critical: f64,

    pub processing_time_warning_ms: f64,
    pub processing_time_critical_ms: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            queue_depth_warning: 1000,
            success_rate_critical: 95.0,
            processing_time_warning_ms: 5_000.0,
            processing_time_critical_ms: 15_000.0,
        }
    }
}

/// Integrity scan settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditorConfig {
    /// Records fetched per page
    pub batch_size: usize,

    /// Operators allowed to regenerate signatures (none by default)
    pub remediation_operators: Vec<String>,
}

impl Default for AuditorConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            remediation_operators: Vec::new(),
        }
    }
}

/// Where the master signing secret comes from
pub trait SecretSource: Send + Sync {
    /// Return the master secret, or a configuration error if unavailable
    fn signing_secret(&self) -> Result<String>;
}

/// Secret held in memory (tests, or injected by a secret manager client)
pub struct StaticSecret(String);

impl StaticSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }
}

impl SecretSource for StaticSecret {
    fn signing_secret(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Secret read from an environment variable
pub struct EnvSecret {
    var: String,
}

impl EnvSecret {
    pub const DEFAULT_VAR: &'static str = "A3S_AUDIT_SECRET";

    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvSecret {
    fn default() -> Self {
        Self::new(Self::DEFAULT_VAR)
    }
}

impl SecretSource for EnvSecret {
    fn signing_secret(&self) -> Result<String> {
        std::env::var(&self.var).map_err(|_| {
            AuditError::Config(format!(
                "Signing secret not set (environment variable {})",
                self.var
            ))
        })
    }
}
