//! Canonicalization and integrity signing for audit records
//!
//! Records are reduced to a canonical JSON form (excluded fields dropped,
//! timestamps normalized to RFC 3339 UTC, keys sorted at every depth) and
//! signed with HMAC-SHA256. The signing key is derived from the master
//! secret and a namespace (`"<secret>:integrity"`) so the same secret can
//! serve other purposes without key reuse.
//!
//! Signatures are `"<version>:<hex digest>"`; the version tag lets the
//! scheme change without breaking verification of older rows.

use crate::config::{SecretSource, SignerConfig};
use crate::error::{AuditError, Result};
use crate::types::{AuditEvent, RequestContext, SignedRecord};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use serde_json::{Map, Value};
use sha2::Sha256;
use std::collections::HashMap;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Fields compared by tamper detection
pub const CRITICAL_FIELDS: &[&str] = &[
    "type",
    "description",
    "actor_id",
    "subject_type",
    "subject_id",
    "created_at",
];

/// Anything that can be canonicalized and signed
pub trait Signable {
    /// Identifier used to key batch results
    fn record_id(&self) -> &str;

    /// Signature currently stored with the record
    fn stored_signature(&self) -> Option<&str>;

    /// The record as a JSON object
    fn to_fields(&self) -> Result<Map<String, Value>>;
}

impl Signable for SignedRecord {
    fn record_id(&self) -> &str {
        &self.event.id
    }

    fn stored_signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    fn to_fields(&self) -> Result<Map<String, Value>> {
        into_object(serde_json::to_value(self)?, self.record_id())
    }
}

impl Signable for AuditEvent {
    fn record_id(&self) -> &str {
        &self.id
    }

    fn stored_signature(&self) -> Option<&str> {
        None
    }

    fn to_fields(&self) -> Result<Map<String, Value>> {
        into_object(serde_json::to_value(self)?, &self.id)
    }
}

/// Raw rows, e.g. straight from a store driver
impl Signable for Value {
    fn record_id(&self) -> &str {
        self.get("id").and_then(Value::as_str).unwrap_or_default()
    }

    fn stored_signature(&self) -> Option<&str> {
        self.get("signature").and_then(Value::as_str)
    }

    fn to_fields(&self) -> Result<Map<String, Value>> {
        into_object(self.clone(), self.record_id())
    }
}

fn into_object(value: Value, record_id: &str) -> Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(AuditError::Verification {
            record_id: record_id.to_string(),
            reason: format!("expected a JSON object, got {}", json_kind(&other)),
        }),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A critical field whose value differs from the original snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub field: String,
    pub old: Value,
    pub new: Value,
}

/// HMAC-SHA256 signer for audit records
pub struct IntegritySigner {
    /// Derived key: `<secret>:<namespace>`
    key: Vec<u8>,
    config: SignerConfig,
}

impl std::fmt::Debug for IntegritySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegritySigner")
            .field("version", &self.config.version)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl IntegritySigner {
    /// Create a signer from a master secret
    ///
    /// An empty secret is a fatal configuration error: no signer exists
    /// without a key.
    pub fn new(secret: &str, config: SignerConfig) -> Result<Self> {
        if secret.trim().is_empty() {
            return Err(AuditError::Config(
                "Signing secret is missing or empty".to_string(),
            ));
        }
        if config.version.is_empty() || config.version.contains(':') {
            return Err(AuditError::Config(format!(
                "Invalid signature version tag '{}'",
                config.version
            )));
        }

        let key = format!("{}:{}", secret, config.key_namespace).into_bytes();
        Ok(Self { key, config })
    }

    /// Create a signer with the secret fetched from a secret source
    pub fn from_source(source: &dyn SecretSource, config: SignerConfig) -> Result<Self> {
        let secret = source.signing_secret()?;
        Self::new(&secret, config)
    }

    /// Version tag written into new signatures
    pub fn version(&self) -> &str {
        &self.config.version
    }

    /// Canonical string the signature is computed over
    pub fn canonicalize<T: Signable + ?Sized>(&self, record: &T) -> Result<String> {
        let mut fields = record.to_fields()?;
        for excluded in &self.config.excluded_fields {
            fields.remove(excluded);
        }
        self.normalize_timestamps(&mut fields, record.record_id())?;

        let canonical = sort_keys(Value::Object(fields));
        serde_json::to_string(&canonical).map_err(Into::into)
    }

    /// Compute the signature for a record
    pub fn sign<T: Signable + ?Sized>(&self, record: &T) -> Result<String> {
        let canonical = self.canonicalize(record)?;
        Ok(format!("{}:{}", self.config.version, self.digest(&canonical)?))
    }

    /// Stamp an event with its signature at write time
    pub fn seal(&self, event: AuditEvent) -> Result<SignedRecord> {
        let signature = self.sign(&event)?;
        tracing::debug!(event_id = %event.id, event_type = %event.event_type, "Audit record sealed");
        Ok(SignedRecord {
            event,
            signature: Some(signature),
            signature_version: Some(self.config.version.clone()),
        })
    }

    /// Verify a record's stored signature
    ///
    /// Missing or empty signatures, unknown versions, and malformed
    /// records are all invalid.
    pub fn verify<T: Signable + ?Sized>(&self, record: &T) -> bool {
        match self.try_verify(record) {
            Ok(valid) => valid,
            Err(e) => {
                tracing::warn!(
                    record_id = %record.record_id(),
                    error = %e,
                    "Record could not be verified"
                );
                false
            }
        }
    }

    /// Verify, surfacing malformed data as an error instead of `false`
    pub fn try_verify<T: Signable + ?Sized>(&self, record: &T) -> Result<bool> {
        let stored = match record.stored_signature() {
            Some(s) if !s.is_empty() => s,
            _ => return Ok(false),
        };

        let version = stored.split_once(':').map(|(v, _)| v);
        if version != Some(self.config.version.as_str()) {
            tracing::debug!(
                record_id = %record.record_id(),
                version = ?version,
                "Unknown signature version"
            );
            return Ok(false);
        }

        let expected = self.sign(record)?;
        Ok(expected.as_bytes().ct_eq(stored.as_bytes()).into())
    }

    /// Verify many records; a malformed record is marked invalid without
    /// affecting the rest
    pub fn batch_verify<'a, T, I>(&self, records: I) -> HashMap<String, bool>
    where
        T: Signable + ?Sized + 'a,
        I: IntoIterator<Item = &'a T>,
    {
        records
            .into_iter()
            .map(|record| (record.record_id().to_string(), self.verify(record)))
            .collect()
    }

    /// Critical fields whose values differ between `current` and `original`
    pub fn critical_field_changes<A, B>(&self, current: &A, original: &B) -> Result<Vec<FieldChange>>
    where
        A: Signable + ?Sized,
        B: Signable + ?Sized,
    {
        let mut current_fields = current.to_fields()?;
        let mut original_fields = original.to_fields()?;
        self.normalize_timestamps(&mut current_fields, current.record_id())?;
        self.normalize_timestamps(&mut original_fields, original.record_id())?;

        let changes = CRITICAL_FIELDS
            .iter()
            .filter_map(|field| {
                let old = original_fields.get(*field).cloned().unwrap_or(Value::Null);
                let new = current_fields.get(*field).cloned().unwrap_or(Value::Null);
                (old != new).then(|| FieldChange {
                    field: field.to_string(),
                    old,
                    new,
                })
            })
            .collect();

        Ok(changes)
    }

    /// Compare a record against its original snapshot and report changes
    /// to critical fields
    ///
    /// Records that cannot be compared are reported as tampered.
    pub fn detect_tampering<A, B>(&self, current: &A, original: &B, requester: &RequestContext) -> bool
    where
        A: Signable + ?Sized,
        B: Signable + ?Sized,
    {
        let changes = match self.critical_field_changes(current, original) {
            Ok(changes) => changes,
            Err(e) => {
                tracing::error!(
                    record_id = %current.record_id(),
                    error = %e,
                    "Tamper check failed, treating record as tampered"
                );
                return true;
            }
        };

        for change in &changes {
            tracing::warn!(
                record_id = %current.record_id(),
                field = %change.field,
                old = %change.old,
                new = %change.new,
                ip_address = ?requester.ip_address,
                user_agent = ?requester.user_agent,
                "Audit record tampering detected"
            );
        }

        !changes.is_empty()
    }

    fn digest(&self, canonical: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| AuditError::Config(format!("Invalid signing key: {}", e)))?;
        mac.update(canonical.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn normalize_timestamps(&self, fields: &mut Map<String, Value>, record_id: &str) -> Result<()> {
        for name in &self.config.timestamp_fields {
            if let Some(Value::String(raw)) = fields.get(name) {
                let normalized = normalize_timestamp(raw).ok_or_else(|| AuditError::Verification {
                    record_id: record_id.to_string(),
                    reason: format!("field '{}' is not a timestamp: '{}'", name, raw),
                })?;
                fields.insert(name.clone(), Value::String(normalized));
            }
        }
        for value in fields.values_mut() {
            self.normalize_nested(value);
        }
        Ok(())
    }

    // Nested timestamp fields (e.g. inside `properties`) are normalized when
    // they parse and signed verbatim otherwise; only top-level ones are strict.
    fn normalize_nested(&self, value: &mut Value) {
        match value {
            Value::Object(map) => {
                for (key, child) in map.iter_mut() {
                    match child {
                        Value::String(raw) if self.config.timestamp_fields.contains(key) => {
                            if let Some(normalized) = normalize_timestamp(raw) {
                                *raw = normalized;
                            }
                        }
                        other => self.normalize_nested(other),
                    }
                }
            }
            Value::Array(items) => items.iter_mut().for_each(|item| self.normalize_nested(item)),
            _ => {}
        }
    }
}

/// Normalize an RFC 3339 or SQL-style (`YYYY-MM-DD HH:MM:SS`, UTC) timestamp
fn normalize_timestamp(raw: &str) -> Option<String> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f").map(|naive| naive.and_utc())
        })
        .ok()?;
    Some(parsed.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

/// Rebuild objects with keys in lexicographic order at every depth
///
/// Insertion order is sorted too, so the result is canonical whether or
/// not serde_json preserves insertion order.
fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, sort_keys(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}
