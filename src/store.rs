//! Persistent store of signed audit records
//!
//! The store is the record of truth the integrity auditor scans. Paging is
//! keyset based on `(created_at, id)` so a scan stays stable while new
//! records are written.

use crate::error::{AuditError, Result};
use crate::types::{DateRange, SignedRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// Position after the last record of a page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCursor {
    pub created_at: DateTime<Utc>,
    pub id: String,
}

impl PageCursor {
    pub fn after(record: &SignedRecord) -> Self {
        Self {
            created_at: record.event.created_at,
            id: record.event.id.clone(),
        }
    }
}

/// Core trait for record store backends
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a record, replacing any record with the same id
    async fn insert(&self, record: SignedRecord) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<SignedRecord>>;

    /// Records in `range` ordered by `(created_at, id)`, strictly after
    /// `after` when given
    async fn page(
        &self,
        range: &DateRange,
        after: Option<&PageCursor>,
        limit: usize,
    ) -> Result<Vec<SignedRecord>>;

    /// Overwrite the stored signature of one record
    async fn update_signature(&self, id: &str, signature: &str, version: &str) -> Result<()>;

    /// Number of records, optionally restricted to a window
    async fn count(&self, range: Option<&DateRange>) -> Result<usize>;

    /// Backend name (e.g., "memory", "postgres")
    fn name(&self) -> &str;
}

#[derive(Default)]
struct Records {
    ordered: BTreeMap<(DateTime<Utc>, String), SignedRecord>,
    /// id → created_at
    index: HashMap<String, DateTime<Utc>>,
}

impl Records {
    fn put(&mut self, record: SignedRecord) {
        let id = record.event.id.clone();
        if let Some(previous) = self.index.insert(id.clone(), record.event.created_at) {
            self.ordered.remove(&(previous, id.clone()));
        }
        self.ordered.insert((record.event.created_at, id), record);
    }

    fn take(&mut self, id: &str) -> Option<SignedRecord> {
        let created_at = self.index.remove(id)?;
        self.ordered.remove(&(created_at, id.to_string()))
    }
}

/// In-memory store for tests and single-process use
#[derive(Default)]
pub struct MemoryRecordStore {
    records: RwLock<Records>,
    unavailable: AtomicBool,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a datastore outage on every operation
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Change a stored record in place, bypassing signing
    ///
    /// Models a direct write to the underlying table.
    pub async fn modify_raw<F>(&self, id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut SignedRecord) + Send,
    {
        let mut records = self.records.write().await;
        let mut record = records
            .take(id)
            .ok_or_else(|| AuditError::NotFound(format!("Audit record {}", id)))?;
        f(&mut record);
        records.put(record);
        Ok(())
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AuditError::Datastore {
                code: "2006".to_string(),
                reason: "server has gone away".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn insert(&self, record: SignedRecord) -> Result<()> {
        self.check_available()?;
        self.records.write().await.put(record);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<SignedRecord>> {
        self.check_available()?;
        let records = self.records.read().await;
        Ok(records
            .index
            .get(id)
            .and_then(|created_at| records.ordered.get(&(*created_at, id.to_string())))
            .cloned())
    }

    async fn page(
        &self,
        range: &DateRange,
        after: Option<&PageCursor>,
        limit: usize,
    ) -> Result<Vec<SignedRecord>> {
        self.check_available()?;
        let lower = match after {
            Some(cursor) => Bound::Excluded((cursor.created_at, cursor.id.clone())),
            None => Bound::Included((range.start, String::new())),
        };

        let records = self.records.read().await;
        Ok(records
            .ordered
            .range((lower, Bound::Unbounded))
            .filter(|((created_at, _), _)| *created_at >= range.start)
            .take_while(|((created_at, _), _)| *created_at <= range.end)
            .take(limit)
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn update_signature(&self, id: &str, signature: &str, version: &str) -> Result<()> {
        self.check_available()?;
        let mut records = self.records.write().await;
        let created_at = *records
            .index
            .get(id)
            .ok_or_else(|| AuditError::NotFound(format!("Audit record {}", id)))?;
        if let Some(record) = records.ordered.get_mut(&(created_at, id.to_string())) {
            record.signature = Some(signature.to_string());
            record.signature_version = Some(version.to_string());
            record.event.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn count(&self, range: Option<&DateRange>) -> Result<usize> {
        self.check_available()?;
        let records = self.records.read().await;
        Ok(match range {
            Some(range) => records
                .ordered
                .keys()
                .filter(|(created_at, _)| range.contains(created_at))
                .count(),
            None => records.ordered.len(),
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AuditEvent;

    fn record_at(minute: u32, description: &str) -> SignedRecord {
        let at: DateTime<Utc> = format!("2024-01-01T00:{:02}:00Z", minute).parse().unwrap();
        SignedRecord::unsigned(AuditEvent::new("login", description).at(at))
    }

    fn all_time() -> DateRange {
        DateRange::new(DateTime::<Utc>::MIN_UTC, DateTime::<Utc>::MAX_UTC)
    }

    #[tokio::test]
    async fn test_insert_get_upsert() {
        let store = MemoryRecordStore::new();
        let mut record = record_at(1, "first");
        store.insert(record.clone()).await.unwrap();

        assert_eq!(store.get(record.id()).await.unwrap().unwrap(), record);
        assert!(store.get("missing").await.unwrap().is_none());

        record.event = record.event.clone().at("2024-01-01T00:30:00Z".parse().unwrap());
        store.insert(record.clone()).await.unwrap();
        assert_eq!(store.count(None).await.unwrap(), 1);
        assert_eq!(
            store.get(record.id()).await.unwrap().unwrap().event.created_at,
            record.event.created_at
        );
    }

    #[tokio::test]
    async fn test_keyset_paging_visits_every_record_once() {
        let store = MemoryRecordStore::new();
        for i in 0..10 {
            // Two records per minute so ties on created_at are broken by id
            store.insert(record_at(i / 2, &i.to_string())).await.unwrap();
        }

        let range = all_time();
        let mut seen = Vec::new();
        let mut cursor: Option<PageCursor> = None;
        loop {
            let page = store.page(&range, cursor.as_ref(), 3).await.unwrap();
            if page.is_empty() {
                break;
            }
            cursor = page.last().map(PageCursor::after);
            seen.extend(page.into_iter().map(|r| r.event.id));
        }

        assert_eq!(seen.len(), 10);
        let mut unique = seen.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 10);
    }

    #[tokio::test]
    async fn test_page_respects_window() {
        let store = MemoryRecordStore::new();
        for minute in [1, 5, 10, 20] {
            store.insert(record_at(minute, "x")).await.unwrap();
        }
        let range = DateRange::new(
            "2024-01-01T00:05:00Z".parse().unwrap(),
            "2024-01-01T00:10:00Z".parse().unwrap(),
        );

        let page = store.page(&range, None, 100).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(store.count(Some(&range)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_update_signature() {
        let store = MemoryRecordStore::new();
        let record = record_at(1, "x");
        store.insert(record.clone()).await.unwrap();

        store.update_signature(record.id(), "v1:abc", "v1").await.unwrap();
        let updated = store.get(record.id()).await.unwrap().unwrap();
        assert_eq!(updated.signature.as_deref(), Some("v1:abc"));
        assert_eq!(updated.signature_version.as_deref(), Some("v1"));

        assert!(matches!(
            store.update_signature("missing", "v1:abc", "v1").await,
            Err(AuditError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_modify_raw_and_outage() {
        let store = MemoryRecordStore::new();
        let record = record_at(1, "x");
        store.insert(record.clone()).await.unwrap();

        store
            .modify_raw(record.id(), |r| r.event.description = "y".to_string())
            .await
            .unwrap();
        assert_eq!(store.get(record.id()).await.unwrap().unwrap().event.description, "y");

        store.set_unavailable(true);
        assert!(matches!(store.count(None).await, Err(AuditError::Datastore { .. })));
    }
}
