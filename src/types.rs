//! Core record types for the a3s-audit pipeline
//!
//! Field names are snake_case: they are part of the canonical form that
//! signatures are computed over, so renaming a field invalidates every
//! stored signature.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A security-relevant action captured at the point it happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event identifier (evt-<uuid>)
    pub id: String,

    /// Event type tag (e.g., "login", "permission_escalation")
    #[serde(rename = "type")]
    pub event_type: String,

    /// Human-readable description of the action
    pub description: String,

    /// Who performed the action
    #[serde(default)]
    pub actor_id: Option<String>,

    /// Kind of entity the action targeted (e.g., "user", "role")
    #[serde(default)]
    pub subject_type: Option<String>,

    /// Identifier of the targeted entity
    #[serde(default)]
    pub subject_id: Option<String>,

    /// Arbitrary nested key/value data
    #[serde(default = "empty_object")]
    pub properties: serde_json::Value,

    /// Requester IP address
    #[serde(default)]
    pub ip_address: Option<String>,

    /// Requester user agent
    #[serde(default)]
    pub user_agent: Option<String>,

    /// Outcome of the action (e.g., "success", "denied")
    #[serde(default = "default_result")]
    pub result: String,

    /// Risk level, 0 (routine) to 10 (critical)
    #[serde(default)]
    pub risk_level: u8,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

fn default_result() -> String {
    "success".to_string()
}

impl AuditEvent {
    /// Create a new event with auto-generated id and timestamps
    pub fn new(event_type: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: format!("evt-{}", uuid::Uuid::new_v4()),
            event_type: event_type.into(),
            description: description.into(),
            actor_id: None,
            subject_type: None,
            subject_id: None,
            properties: empty_object(),
            ip_address: None,
            user_agent: None,
            result: default_result(),
            risk_level: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn with_subject(mut self, subject_type: impl Into<String>, subject_id: impl Into<String>) -> Self {
        self.subject_type = Some(subject_type.into());
        self.subject_id = Some(subject_id.into());
        self
    }

    /// Add a top-level property
    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        if !self.properties.is_object() {
            self.properties = empty_object();
        }
        if let Some(map) = self.properties.as_object_mut() {
            map.insert(key.into(), value);
        }
        self
    }

    /// Replace all properties
    pub fn with_properties(mut self, properties: serde_json::Value) -> Self {
        self.properties = properties;
        self
    }

    /// Set the risk level, clamped to 10
    pub fn with_risk_level(mut self, risk_level: u8) -> Self {
        self.risk_level = risk_level.min(10);
        self
    }

    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = result.into();
        self
    }

    /// Attach requester details
    pub fn with_request(mut self, request: &RequestContext) -> Self {
        self.ip_address = request.ip_address.clone();
        self.user_agent = request.user_agent.clone();
        self
    }

    /// Override the creation timestamp
    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self.updated_at = created_at;
        self
    }
}

/// An event stamped with an integrity signature
///
/// Produced by [`IntegritySigner::seal`](crate::signer::IntegritySigner::seal);
/// the signature is always derived from the event fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedRecord {
    #[serde(flatten)]
    pub event: AuditEvent,

    /// `<version>:<hex digest>`, absent for legacy rows
    #[serde(default)]
    pub signature: Option<String>,

    /// Version tag of the signing scheme
    #[serde(default)]
    pub signature_version: Option<String>,
}

impl SignedRecord {
    /// Wrap an event that has no signature yet (legacy or imported rows)
    pub fn unsigned(event: AuditEvent) -> Self {
        Self {
            event,
            signature: None,
            signature_version: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.event.id
    }

    /// Whether a non-empty signature is stored
    pub fn has_signature(&self) -> bool {
        self.signature.as_deref().is_some_and(|s| !s.is_empty())
    }
}

/// Requester details attached to tamper reports and events
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestContext {
    pub fn new(ip_address: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            ip_address: Some(ip_address.into()),
            user_agent: Some(user_agent.into()),
        }
    }
}

/// Inclusive time window for integrity scans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ts: &DateTime<Utc>) -> bool {
        *ts >= self.start && *ts <= self.end
    }
}
