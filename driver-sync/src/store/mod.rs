//! Record store client interface
//!
//! The engine talks to the remote data service only through [`RecordStore`].
//! Records are JSON objects; every record carries its entity `key`.

pub mod memory;
pub mod rest;

pub use memory::{InMemoryRecordStore, StoreFault};
pub use rest::RestRecordStore;

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use serde_json::Value;

pub type Record = serde_json::Map<String, Value>;

/// Field holding the entity key in every collection
pub const KEY_FIELD: &str = "key";

/// Conjunction of field equality conditions
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<(String, Value)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_key(key: &str) -> Self {
        Self::new().eq(KEY_FIELD, key)
    }

    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions.push((field.to_string(), value.into()));
        self
    }

    pub fn conditions(&self) -> &[(String, Value)] {
        &self.conditions
    }

    /// Value the filter requires for `field`, if any
    pub fn value_of(&self, field: &str) -> Option<&Value> {
        self.conditions
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value)
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.conditions
            .iter()
            .all(|(field, expected)| record.get(field) == Some(expected))
    }
}

/// Key-addressable access to the remote record service
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fetch the record stored under `key`, or `SyncError::NotFound`
    async fn get(&self, collection: &str, key: &str) -> SyncResult<Record>;

    /// All records matching `filter`
    async fn list(&self, collection: &str, filter: &Filter) -> SyncResult<Vec<Record>>;

    /// Create a record; `fields` must include the key
    async fn insert(&self, collection: &str, fields: Record) -> SyncResult<Record>;

    /// Partially update every record matching `filter` and return them.
    /// Fields not present in `fields` keep their current values.
    async fn update(
        &self,
        collection: &str,
        filter: &Filter,
        fields: Record,
    ) -> SyncResult<Vec<Record>>;

    /// Partially update the record stored under `key`. Returns the updated
    /// record, or `SyncError::NotFound` when nothing is stored under `key`.
    async fn upsert(&self, collection: &str, key: &str, fields: Record) -> SyncResult<Record> {
        self.update(collection, &Filter::by_key(key), fields)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::not_found(collection, key))
    }
}
