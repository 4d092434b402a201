//! Per-key, in-process mutual exclusion for reconciliation
//!
//! A second reconciliation of a key that is already in flight is dropped
//! (reported as `Noop`) instead of queued. Different keys never contend.

use crate::error::SyncResult;
use crate::reconciler::{EntityReconciler, ReconciliationResult};
use crate::store::Record;
use dashmap::DashSet;

/// Set of keys with an operation in flight
#[derive(Debug, Default)]
pub struct KeyedGuard {
    in_flight: DashSet<String>,
}

impl KeyedGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key`, or `None` if it is already claimed. The claim is released
    /// when the returned permit is dropped.
    pub fn try_acquire(&self, key: &str) -> Option<KeyPermit<'_>> {
        if !self.in_flight.insert(key.to_string()) {
            return None;
        }
        Some(KeyPermit {
            guard: self,
            key: key.to_string(),
        })
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.in_flight.contains(key)
    }

    pub fn held_count(&self) -> usize {
        self.in_flight.len()
    }
}

#[derive(Debug)]
pub struct KeyPermit<'a> {
    guard: &'a KeyedGuard,
    key: String,
}

impl Drop for KeyPermit<'_> {
    fn drop(&mut self) {
        self.guard.in_flight.remove(&self.key);
    }
}

/// [`EntityReconciler`] behind a [`KeyedGuard`]
pub struct GuardedReconciler {
    reconciler: EntityReconciler,
    guard: KeyedGuard,
}

impl GuardedReconciler {
    pub fn new(reconciler: EntityReconciler) -> Self {
        Self {
            reconciler,
            guard: KeyedGuard::new(),
        }
    }

    pub async fn reconcile(&self, key: &str) -> ReconciliationResult {
        let Some(_permit) = self.guard.try_acquire(key) else {
            tracing::debug!(key = %key, "Reconciliation already in flight, skipping");
            return ReconciliationResult::skipped(key);
        };

        self.reconciler.reconcile(key).await
    }

    pub async fn reconcile_reverse(&self, key: &str, fields: &Record) -> SyncResult<bool> {
        self.reconciler.reconcile_reverse(key, fields).await
    }

    pub fn inner(&self) -> &EntityReconciler {
        &self.reconciler
    }

    pub fn guard(&self) -> &KeyedGuard {
        &self.guard
    }
}
