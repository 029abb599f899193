//! Per-minute batch buckets backed by a key-value cache
//!
//! Appending to a bucket is a read-modify-write (read, append, compare
//! size, maybe flush). Concurrent producers would lose events with a plain
//! get-then-put, so every write goes through the cache's
//! compare-and-swap and is retried on conflict.

use crate::error::{AuditError, Result};
use crate::types::AuditEvent;
use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Upper bound on CAS rounds before giving up on a contended key
const MAX_CAS_ROUNDS: u32 = 1_000;

/// A cached value and the version it was written at
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned {
    pub value: Value,
    pub version: u64,
}

/// Key-value cache collaborator
#[async_trait]
pub trait KvCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Versioned>>;

    /// Unconditional write, returning the new version
    async fn put(&self, key: &str, value: Value) -> Result<u64>;

    /// Remove a key, returning whether it existed
    async fn forget(&self, key: &str) -> Result<bool>;

    /// Write `value` (or delete when `None`) only if the key is currently at
    /// `expected` (`None` = absent). Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Option<Value>,
    ) -> Result<bool>;
}

/// In-memory cache; each key is guarded by its shard lock
#[derive(Default)]
pub struct MemoryKvCache {
    entries: DashMap<String, Versioned>,
    /// Versions are never reused, even across delete and re-create
    next_version: AtomicU64,
}

impl MemoryKvCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl KvCache for MemoryKvCache {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn put(&self, key: &str, value: Value) -> Result<u64> {
        let version = self.bump();
        self.entries.insert(key.to_string(), Versioned { value, version });
        Ok(version)
    }

    async fn forget(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Option<Value>,
    ) -> Result<bool> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if expected != Some(entry.get().version) {
                    return Ok(false);
                }
                match value {
                    Some(value) => {
                        let version = self.bump();
                        entry.insert(Versioned { value, version });
                    }
                    None => {
                        entry.remove();
                    }
                }
                Ok(true)
            }
            Entry::Vacant(entry) => {
                if expected.is_some() {
                    return Ok(false);
                }
                if let Some(value) = value {
                    let version = self.bump();
                    entry.insert(Versioned { value, version });
                }
                Ok(true)
            }
        }
    }
}

/// Bucket key for the minute containing `at`
pub fn bucket_key(prefix: &str, at: DateTime<Utc>) -> String {
    format!("{}:{}", prefix, at.format("%Y%m%d%H%M"))
}

/// Start of the minute containing `at`
pub fn bucket_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    at.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(at)
}

/// Accumulates events in cache buckets until they reach the batch size
pub struct BatchAccumulator {
    cache: Arc<dyn KvCache>,
    batch_size: usize,
}

impl BatchAccumulator {
    pub fn new(cache: Arc<dyn KvCache>, batch_size: usize) -> Self {
        Self {
            cache,
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Atomically append an event to a bucket
    ///
    /// Returns the full batch when this append reached the batch size; the
    /// bucket is emptied in the same swap. Only a [`restore`](Self::restore)
    /// can leave more than `batch_size` events behind, and the next append
    /// takes them all.
    pub async fn append(&self, key: &str, event: &AuditEvent) -> Result<Option<Vec<AuditEvent>>> {
        for _ in 0..MAX_CAS_ROUNDS {
            let (mut events, version) = self.load(key).await?;
            events.push(event.clone());

            if events.len() >= self.batch_size {
                if self.cache.compare_and_swap(key, version, None).await? {
                    return Ok(Some(events));
                }
            } else {
                let value = serde_json::to_value(&events)?;
                if self.cache.compare_and_swap(key, version, Some(value)).await? {
                    return Ok(None);
                }
            }
            tracing::trace!(bucket = %key, "Batch bucket CAS conflict, retrying");
        }

        Err(AuditError::Store(format!(
            "Batch bucket '{}' too contended after {} CAS rounds",
            key, MAX_CAS_ROUNDS
        )))
    }

    /// Atomically take every event in a bucket
    pub async fn drain(&self, key: &str) -> Result<Vec<AuditEvent>> {
        for _ in 0..MAX_CAS_ROUNDS {
            let (events, version) = self.load(key).await?;
            if version.is_none() {
                return Ok(Vec::new());
            }
            if self.cache.compare_and_swap(key, version, None).await? {
                return Ok(events);
            }
        }

        Err(AuditError::Store(format!(
            "Batch bucket '{}' too contended after {} CAS rounds",
            key, MAX_CAS_ROUNDS
        )))
    }

    /// Put events back at the front of a bucket after a failed dispatch
    pub async fn restore(&self, key: &str, events: Vec<AuditEvent>) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        for _ in 0..MAX_CAS_ROUNDS {
            let (current, version) = self.load(key).await?;
            let mut merged = events.clone();
            merged.extend(current);
            let value = serde_json::to_value(&merged)?;
            if self.cache.compare_and_swap(key, version, Some(value)).await? {
                return Ok(());
            }
        }

        Err(AuditError::Store(format!(
            "Batch bucket '{}' too contended after {} CAS rounds",
            key, MAX_CAS_ROUNDS
        )))
    }

    /// Number of events currently in a bucket
    pub async fn pending(&self, key: &str) -> Result<usize> {
        Ok(self.load(key).await?.0.len())
    }

    async fn load(&self, key: &str) -> Result<(Vec<AuditEvent>, Option<u64>)> {
        match self.cache.get(key).await? {
            Some(entry) => {
                let events: Vec<AuditEvent> = serde_json::from_value(entry.value)?;
                Ok((events, Some(entry.version)))
            }
            None => Ok((Vec::new(), None)),
        }
    }
}
