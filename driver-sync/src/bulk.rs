//! Reconcile every active driver in one concurrent pass

use crate::error::SyncResult;
use crate::guard::GuardedReconciler;
use crate::reconciler::ReconciliationResult;
use futures::stream::{self, StreamExt};
use std::sync::Arc;

/// Aggregate of a bulk run
#[derive(Debug, Default)]
pub struct BulkReport {
    /// Keys whose outcome was not `Failed`
    pub successful: usize,
    pub total: usize,
    pub details: Vec<ReconciliationResult>,
}

impl BulkReport {
    pub fn failures(&self) -> impl Iterator<Item = &ReconciliationResult> {
        self.details.iter().filter(|result| !result.is_success())
    }
}

pub struct BulkCoordinator {
    reconciler: Arc<GuardedReconciler>,
    max_concurrency: Option<usize>,
}

impl BulkCoordinator {
    pub fn new(reconciler: Arc<GuardedReconciler>) -> Self {
        Self {
            reconciler,
            max_concurrency: None,
        }
    }

    /// Cap the number of reconciliations running at once
    pub fn with_max_concurrency(mut self, limit: Option<usize>) -> Self {
        self.max_concurrency = limit;
        self
    }

    /// Reconcile every active identity record.
    ///
    /// A failing key is recorded in the report and never stops the others;
    /// only a failure to list the identity records fails the whole run.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile_all(&self) -> SyncResult<BulkReport> {
        let keys = self.reconciler.inner().active_keys().await?;
        let total = keys.len();
        let limit = self.max_concurrency.unwrap_or(total).max(1);

        let reconciler = &self.reconciler;
        let details: Vec<ReconciliationResult> = stream::iter(keys)
            .map(|key| async move { reconciler.reconcile(&key).await })
            .buffer_unordered(limit)
            .collect()
            .await;

        let successful = details.iter().filter(|result| result.is_success()).count();

        if successful == total {
            tracing::info!(total, "Bulk reconciliation completed");
        } else {
            tracing::warn!(
                successful,
                failed = total - successful,
                total,
                "Bulk reconciliation completed with failures"
            );
        }

        Ok(BulkReport {
            successful,
            total,
            details,
        })
    }
}
