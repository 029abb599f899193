//! Redaction of sensitive values in outbound event copies
//!
//! Two independent rules apply:
//!
//! - **keys**: any map key containing a sensitive keyword has its value
//!   masked, whatever the value looks like
//! - **values**: any string matching a sensitive pattern (JWT, email,
//!   card-like digit groups, IPv4, phone, long opaque token) has the match
//!   replaced by a fixed token
//!
//! Redaction is idempotent: masking preserves length and prefix, the
//! replacement tokens match none of the patterns, and value patterns are
//! applied until the text stops changing.

use crate::config::{PatternRule, RedactionConfig};
use crate::error::{AuditError, Result};
use crate::types::AuditEvent;
use regex::Regex;
use serde_json::{Map, Value};

/// Every pass that changes the text consumes matched characters, so real
/// input settles in two or three passes
const MAX_SCRUB_PASSES: usize = 8;

/// Masks sensitive keys and scrubs sensitive value patterns
#[derive(Debug, Clone)]
pub struct Redactor {
    /// Lower-cased keywords
    keywords: Vec<String>,
    patterns: Vec<(String, Regex, String)>,
    mask_char: char,
    visible_chars: usize,
    placeholder: String,
}

impl Redactor {
    /// Build a redactor, compiling every configured pattern
    pub fn new(config: &RedactionConfig) -> Result<Self> {
        let mut redactor = Self {
            keywords: Vec::new(),
            patterns: Vec::new(),
            mask_char: config.mask_char,
            visible_chars: config.visible_chars,
            placeholder: config.placeholder.clone(),
        };
        redactor.add_keywords(config.sensitive_keywords.iter().map(String::as_str));
        for rule in &config.sensitive_patterns {
            redactor.add_pattern(rule.clone())?;
        }
        Ok(redactor)
    }

    /// Add sensitive key keywords (matched case-insensitively as substrings)
    pub fn add_keywords<'a>(&mut self, keywords: impl IntoIterator<Item = &'a str>) {
        for keyword in keywords {
            let keyword = keyword.trim().to_lowercase();
            if !keyword.is_empty() && !self.keywords.contains(&keyword) {
                self.keywords.push(keyword);
            }
        }
    }

    /// Add a value pattern, applied after the existing ones
    pub fn add_pattern(&mut self, rule: PatternRule) -> Result<()> {
        let regex = Regex::new(&rule.pattern)
            .map_err(|e| AuditError::Config(format!("Invalid redaction pattern '{}': {}", rule.name, e)))?;
        if regex.is_match(&rule.replacement) {
            return Err(AuditError::Config(format!(
                "Replacement '{}' for pattern '{}' matches its own pattern",
                rule.replacement, rule.name
            )));
        }
        self.patterns.push((rule.name, regex, rule.replacement));
        Ok(())
    }

    /// Change the mask character
    pub fn with_mask_char(mut self, mask_char: char) -> Self {
        self.mask_char = mask_char;
        self
    }

    /// Whether a key names sensitive data
    pub fn is_sensitive_key(&self, key: &str) -> bool {
        let key = key.to_lowercase();
        self.keywords.iter().any(|k| key.contains(k.as_str()))
    }

    /// Redact a property map, recursing into nested objects and arrays
    pub fn filter_properties(&self, properties: &Map<String, Value>) -> Map<String, Value> {
        properties
            .iter()
            .map(|(key, value)| {
                let redacted = if self.is_sensitive_key(key) {
                    self.mask_sensitive(value)
                } else {
                    self.filter_value(value)
                };
                (key.clone(), redacted)
            })
            .collect()
    }

    /// Redact any JSON value
    pub fn filter_value(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(self.filter_properties(map)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.filter_value(v)).collect()),
            Value::String(s) => Value::String(self.scrub(s)),
            other => other.clone(),
        }
    }

    /// Replace every pattern match in free text
    ///
    /// A replacement can expose a match for an earlier pattern (a `[PHONE]`
    /// token creates the word boundary an IPv4 match needs), so passes repeat
    /// until the text stops changing.
    pub fn scrub(&self, text: &str) -> String {
        let mut result = text.to_string();
        for _ in 0..MAX_SCRUB_PASSES {
            let mut changed = false;
            for (_, regex, replacement) in &self.patterns {
                if regex.is_match(&result) {
                    let next = regex.replace_all(&result, regex::NoExpand(replacement)).into_owned();
                    changed |= next != result;
                    result = next;
                }
            }
            if !changed {
                break;
            }
        }
        result
    }

    /// Mask a value using the configured prefix length
    pub fn mask(&self, value: &Value) -> Value {
        self.mask_value(value, self.visible_chars)
    }

    /// Keep `visible_chars` leading characters and mask the rest
    ///
    /// Strings no longer than the prefix are masked entirely; non-string
    /// values become the placeholder.
    pub fn mask_value(&self, value: &Value, visible_chars: usize) -> Value {
        match value {
            Value::String(s) if *s == self.placeholder => value.clone(),
            Value::String(s) => Value::String(mask_str(s, visible_chars, self.mask_char)),
            _ => Value::String(self.placeholder.clone()),
        }
    }

    /// Copy of an event safe to send outside the trust boundary
    pub fn redact_event(&self, event: &AuditEvent) -> AuditEvent {
        let mut copy = event.clone();
        copy.description = self.scrub(&event.description);
        copy.properties = match &event.properties {
            Value::Object(map) => Value::Object(self.filter_properties(map)),
            other => self.filter_value(other),
        };
        copy.ip_address = event
            .ip_address
            .as_deref()
            .map(|ip| mask_str(ip, self.visible_chars, self.mask_char));
        copy
    }

    /// Names of the active value patterns, in application order
    pub fn pattern_names(&self) -> Vec<&str> {
        self.patterns.iter().map(|(name, _, _)| name.as_str()).collect()
    }

    // Containers under a sensitive key are masked leaf by leaf so the
    // shape survives.
    fn mask_sensitive(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.mask_sensitive(v)))
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.mask_sensitive(v)).collect()),
            Value::Null => Value::Null,
            other => self.mask(other),
        }
    }
}

fn mask_str(s: &str, visible_chars: usize, mask_char: char) -> String {
    let len = s.chars().count();
    if len <= visible_chars {
        return std::iter::repeat(mask_char).take(len).collect();
    }
    s.chars()
        .take(visible_chars)
        .chain(std::iter::repeat(mask_char).take(len - visible_chars))
        .collect()
}
