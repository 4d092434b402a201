//! Identity → business record reconciliation
//!
//! Brings the business mirror of one driver into agreement with its identity
//! record for the forward allow-list only, creating the mirror when it does
//! not exist yet. The reverse direction copies a small allow-listed subset of
//! business-side fields back onto the identity record.
//!
//! No retries happen here; callers own the retry policy.

use crate::clock::Clock;
use crate::config::StoreConfig;
use crate::error::{SyncError, SyncResult};
use crate::records::{
    from_record, parse_flag, project_forward, project_reverse, to_record, BusinessRecord,
    IdentityRecord,
};
use crate::store::{Filter, Record, RecordStore, KEY_FIELD};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Created,
    Updated,
    /// Skipped because another reconciliation of the same key was in flight
    Noop,
    Failed,
}

/// Per-key result, returned to the caller and aggregated by bulk runs
#[derive(Debug)]
pub struct ReconciliationResult {
    pub key: String,
    pub outcome: ReconcileOutcome,
    pub error: Option<SyncError>,
}

impl ReconciliationResult {
    pub fn new(key: &str, outcome: ReconcileOutcome) -> Self {
        Self {
            key: key.to_string(),
            outcome,
            error: None,
        }
    }

    pub fn skipped(key: &str) -> Self {
        Self::new(key, ReconcileOutcome::Noop)
    }

    pub fn failed(key: &str, error: SyncError) -> Self {
        Self {
            key: key.to_string(),
            outcome: ReconcileOutcome::Failed,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome != ReconcileOutcome::Failed
    }
}

/// Collection names for the two record sets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collections {
    pub identity: String,
    pub business: String,
}

impl Default for Collections {
    fn default() -> Self {
        Self {
            identity: "identity".to_string(),
            business: "business".to_string(),
        }
    }
}

impl From<&StoreConfig> for Collections {
    fn from(config: &StoreConfig) -> Self {
        Self {
            identity: config.identity_collection.clone(),
            business: config.business_collection.clone(),
        }
    }
}

pub struct EntityReconciler {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    collections: Collections,
}

impl EntityReconciler {
    pub fn new(store: Arc<dyn RecordStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            collections: Collections::default(),
        }
    }

    pub fn with_collections(mut self, collections: Collections) -> Self {
        self.collections = collections;
        self
    }

    pub fn collections(&self) -> &Collections {
        &self.collections
    }

    /// Reconcile one entity. Store failures come back as a `Failed` result.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile(&self, key: &str) -> ReconciliationResult {
        match self.apply_forward(key).await {
            Ok(outcome) => {
                tracing::debug!(outcome = ?outcome, "Reconciled business record");
                ReconciliationResult::new(key, outcome)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Reconciliation failed");
                ReconciliationResult::failed(key, e)
            }
        }
    }

    async fn apply_forward(&self, key: &str) -> SyncResult<ReconcileOutcome> {
        let identity = self.fetch_identity(key).await?;
        let existing = self.fetch_business(key).await?;
        let patch = project_forward(&identity, self.clock.now());

        if let Some(existing) = existing {
            let filter = Self::live_row(key, &existing);
            let updated = self
                .store
                .update(&self.collections.business, &filter, to_record(&patch)?)
                .await?;
            if updated.is_empty() {
                return Err(SyncError::not_found(&self.collections.business, key));
            }
            Ok(ReconcileOutcome::Updated)
        } else {
            let business = BusinessRecord::from_patch(key, patch);
            self.store
                .insert(&self.collections.business, to_record(&business)?)
                .await?;
            Ok(ReconcileOutcome::Created)
        }
    }

    /// Address the live business row only, never its soft-deleted siblings
    fn live_row(key: &str, existing: &BusinessRecord) -> Filter {
        match &existing.id {
            Some(id) => Filter::by_key(key).eq("id", id.clone()),
            None => Filter::by_key(key).eq("softDeleted", false),
        }
    }

    /// Copy the reverse-syncable subset of `fields` onto the identity record.
    ///
    /// Returns `false` without writing when `fields` holds nothing syncable.
    #[tracing::instrument(skip(self, fields))]
    pub async fn reconcile_reverse(&self, key: &str, fields: &Record) -> SyncResult<bool> {
        let patch = project_reverse(fields)?;
        if patch.is_empty() {
            tracing::debug!("No reverse-syncable fields supplied");
            return Ok(false);
        }

        self.store
            .upsert(&self.collections.identity, key, to_record(&patch)?)
            .await?;

        tracing::info!("Applied business fields to identity record");
        Ok(true)
    }

    pub async fn fetch_identity(&self, key: &str) -> SyncResult<IdentityRecord> {
        let record = self.store.get(&self.collections.identity, key).await?;
        from_record(record)
    }

    /// The live (not soft-deleted) business record for `key`, if any
    pub async fn fetch_business(&self, key: &str) -> SyncResult<Option<BusinessRecord>> {
        let records = self
            .store
            .list(&self.collections.business, &Filter::by_key(key))
            .await?;

        for record in records {
            let soft_deleted = record
                .get("softDeleted")
                .and_then(parse_flag)
                .unwrap_or(false);
            if !soft_deleted {
                return from_record(record).map(Some);
            }
        }
        Ok(None)
    }

    /// Keys of every active identity record.
    ///
    /// Only the key and the flag are read here, so a malformed row still
    /// reaches `reconcile` and fails there on its own.
    pub async fn active_keys(&self) -> SyncResult<Vec<String>> {
        let records = self
            .store
            .list(&self.collections.identity, &Filter::new())
            .await?;

        Ok(records
            .iter()
            .filter(|record| {
                record
                    .get("active")
                    .and_then(parse_flag)
                    .unwrap_or(false)
            })
            .filter_map(|record| match record.get(KEY_FIELD).and_then(Value::as_str) {
                Some(key) => Some(key.to_string()),
                None => {
                    tracing::warn!(
                        collection = %self.collections.identity,
                        "Skipping identity row without a key"
                    );
                    None
                }
            })
            .collect())
    }
}
