//! In-memory record store for tests and local development

use super::{Filter, Record, RecordStore, KEY_FIELD};
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// Failure injected into store calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreFault {
    Network,
    Remote(String),
}

impl StoreFault {
    fn to_error(&self, collection: &str) -> SyncError {
        match self {
            StoreFault::Network => {
                SyncError::Network(format!("injected network failure on `{collection}`"))
            }
            StoreFault::Remote(message) => SyncError::Remote(message.clone()),
        }
    }
}

/// Collections of JSON records kept in process memory.
///
/// Like the hosted service it stands in for, it does not enforce key
/// uniqueness: inserting the same key twice leaves two records.
#[derive(Default)]
pub struct InMemoryRecordStore {
    collections: DashMap<String, Vec<Record>>,
    /// (collection, key) faults; a `None` key fails every call on the collection
    faults: DashMap<(String, Option<String>), StoreFault>,
    latency: Option<Duration>,
    writes: AtomicU64,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call, so concurrent callers overlap
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make every call touching `key` in `collection` fail
    pub fn fail_key(&self, collection: &str, key: &str, fault: StoreFault) {
        self.faults
            .insert((collection.to_string(), Some(key.to_string())), fault);
    }

    /// Make every call on `collection` fail
    pub fn fail_collection(&self, collection: &str, fault: StoreFault) {
        self.faults.insert((collection.to_string(), None), fault);
    }

    pub fn clear_faults(&self) {
        self.faults.clear();
    }

    /// Copy of every record in `collection`, in insertion order
    pub fn snapshot(&self, collection: &str) -> Vec<Record> {
        self.collections
            .get(collection)
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    /// Number of successful insert and update calls
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    async fn enter(&self, collection: &str, key: Option<&str>) -> SyncResult<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(fault) = self.faults.get(&(collection.to_string(), None)) {
            return Err(fault.to_error(collection));
        }
        if let Some(key) = key {
            if let Some(fault) = self.faults.get(&(collection.to_string(), Some(key.to_string()))) {
                return Err(fault.to_error(collection));
            }
        }
        Ok(())
    }
}

fn record_key(record: &Record) -> Option<&str> {
    record.get(KEY_FIELD).and_then(Value::as_str)
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn get(&self, collection: &str, key: &str) -> SyncResult<Record> {
        self.enter(collection, Some(key)).await?;

        self.collections
            .get(collection)
            .and_then(|records| {
                records
                    .iter()
                    .find(|record| record_key(record) == Some(key))
                    .cloned()
            })
            .ok_or_else(|| SyncError::not_found(collection, key))
    }

    async fn list(&self, collection: &str, filter: &Filter) -> SyncResult<Vec<Record>> {
        let key = filter.value_of(KEY_FIELD).and_then(Value::as_str);
        self.enter(collection, key).await?;

        Ok(self
            .collections
            .get(collection)
            .map(|records| {
                records
                    .iter()
                    .filter(|record| filter.matches(record))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert(&self, collection: &str, mut fields: Record) -> SyncResult<Record> {
        let key = record_key(&fields)
            .map(str::to_string)
            .ok_or_else(|| {
                SyncError::InvalidOperation(format!("insert into `{collection}` without a key"))
            })?;
        self.enter(collection, Some(&key)).await?;

        fields
            .entry("id")
            .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));

        self.collections
            .entry(collection.to_string())
            .or_default()
            .push(fields.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);

        Ok(fields)
    }

    async fn update(
        &self,
        collection: &str,
        filter: &Filter,
        fields: Record,
    ) -> SyncResult<Vec<Record>> {
        let key = filter.value_of(KEY_FIELD).and_then(Value::as_str);
        self.enter(collection, key).await?;

        let Some(mut records) = self.collections.get_mut(collection) else {
            return Ok(Vec::new());
        };

        let mut updated = Vec::new();
        for record in records.iter_mut().filter(|record| filter.matches(record)) {
            for (field, value) in &fields {
                record.insert(field.clone(), value.clone());
            }
            updated.push(record.clone());
        }
        drop(records);

        if !updated.is_empty() {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => Record::new(),
        }
    }

    #[tokio::test]
    async fn test_insert_then_get() {
        let store = InMemoryRecordStore::new();
        let inserted = store
            .insert("identity", record(json!({ "key": "T-1", "displayName": "Ana" })))
            .await
            .unwrap();
        assert!(inserted.contains_key("id"));

        let fetched = store.get("identity", "T-1").await.unwrap();
        assert_eq!(fetched["displayName"], json!("Ana"));
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = InMemoryRecordStore::new();
        let err = store.get("identity", "nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_insert_requires_key() {
        let store = InMemoryRecordStore::new();
        let result = store.insert("identity", record(json!({ "displayName": "Ana" }))).await;
        assert!(matches!(result, Err(SyncError::InvalidOperation(_))));
    }

    #[tokio::test]
    async fn test_upsert_is_partial() {
        let store = InMemoryRecordStore::new();
        store
            .insert("business", record(json!({ "key": "T-1", "displayName": "Ana", "dailyTarget": 42 })))
            .await
            .unwrap();

        let updated = store
            .upsert("business", "T-1", record(json!({ "displayName": "Ana C." })))
            .await
            .unwrap();
        assert_eq!(updated["displayName"], json!("Ana C."));
        assert_eq!(updated["dailyTarget"], json!(42));
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn test_update_touches_only_matching_rows() {
        let store = InMemoryRecordStore::new();
        let archived = store
            .insert("business", record(json!({ "key": "T-1", "displayName": "Old", "softDeleted": true })))
            .await
            .unwrap();
        let live = store
            .insert("business", record(json!({ "key": "T-1", "displayName": "Ana", "softDeleted": false })))
            .await
            .unwrap();

        let filter = Filter::by_key("T-1").eq("id", live["id"].clone());
        let updated = store
            .update("business", &filter, record(json!({ "displayName": "Ana C." })))
            .await
            .unwrap();
        assert_eq!(updated.len(), 1);

        let rows = store.snapshot("business");
        assert_eq!(rows[0], archived);
        assert_eq!(rows[1]["displayName"], json!("Ana C."));

        let none = store
            .update("business", &Filter::by_key("T-9"), record(json!({ "active": true })))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_upsert_missing_is_not_found() {
        let store = InMemoryRecordStore::new();
        store
            .insert("business", record(json!({ "key": "T-1" })))
            .await
            .unwrap();

        let err = store
            .upsert("business", "T-2", record(json!({ "active": true })))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_list_applies_filter() {
        let store = InMemoryRecordStore::new();
        for (key, active) in [("T-1", true), ("T-2", false), ("T-3", true)] {
            store
                .insert("identity", record(json!({ "key": key, "active": active })))
                .await
                .unwrap();
        }

        let active = store
            .list("identity", &Filter::new().eq("active", true))
            .await
            .unwrap();
        let keys: Vec<_> = active.iter().filter_map(record_key).collect();
        assert_eq!(keys, vec!["T-1", "T-3"]);
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let store = InMemoryRecordStore::new();
        store
            .insert("identity", record(json!({ "key": "T-1" })))
            .await
            .unwrap();

        store.fail_key("identity", "T-1", StoreFault::Network);
        assert!(matches!(
            store.get("identity", "T-1").await,
            Err(SyncError::Network(_))
        ));
        assert!(store.list("identity", &Filter::new()).await.is_ok());

        store.fail_collection("identity", StoreFault::Remote("quota exceeded".to_string()));
        assert!(matches!(
            store.list("identity", &Filter::new()).await,
            Err(SyncError::Remote(_))
        ));

        store.clear_faults();
        assert!(store.get("identity", "T-1").await.is_ok());
    }
}
