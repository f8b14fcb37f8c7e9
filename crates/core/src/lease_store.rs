//! C1: lease store singletons — the one-time bootstrap marker and the
//! advisory init lock (spec §4.1, §3 "Lease store singletons").
//!
//! These are record-level operations against the same injected
//! [`LeaseStoreClient`] the lease manager (C2) uses; they are kept
//! separate because they operate on two fixed record ids
//! (`{prefix}.info`, `{prefix}.lock`) rather than per-partition leases.

use std::time::Duration;

use chrono::Utc;

use crate::error::LeaseManagerError;
use crate::store::{LeaseStoreClient, LeaseStoreError, StoreRecord};

pub struct LeaseStoreBootstrapGate<C: LeaseStoreClient> {
    client: C,
    lease_prefix: String,
}

impl<C: LeaseStoreClient> LeaseStoreBootstrapGate<C> {
    pub fn new(client: C, lease_prefix: impl Into<String>) -> Self {
        Self { client, lease_prefix: lease_prefix.into() }
    }

    fn info_id(&self) -> String {
        format!("{}.info", self.lease_prefix)
    }

    fn lock_id(&self) -> String {
        format!("{}.lock", self.lease_prefix)
    }

    /// True iff the store-marker exists.
    pub async fn is_initialized(&self) -> Result<bool, LeaseManagerError> {
        match self.client.read(&self.info_id()).await {
            Ok(record) => Ok(record.is_some()),
            Err(err) => Err(err.into()),
        }
    }

    /// Try to create the init-lock with the given TTL.
    ///
    /// `Ok(true)` on success, `Ok(false)` on conflict (someone else holds
    /// it), `Err` only for genuine transient/fatal store errors.
    pub async fn acquire_init_lock(&self, ttl: Duration) -> Result<bool, LeaseManagerError> {
        let record = StoreRecord::new(self.lock_id(), Utc::now());
        match self.client.create(record, Some(ttl)).await {
            Ok(_) => Ok(true),
            Err(LeaseStoreError::Conflict) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Create the store-marker. A pre-existing marker is success —
    /// idempotent under lock-TTL expiry races (spec §4.8).
    pub async fn mark_initialized(&self) -> Result<(), LeaseManagerError> {
        let record = StoreRecord::new(self.info_id(), Utc::now());
        match self.client.create(record, None).await {
            Ok(_) | Err(LeaseStoreError::Conflict) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Delete the init-lock. A missing lock is success.
    pub async fn release_init_lock(&self) -> Result<(), LeaseManagerError> {
        match self.client.delete(&self.lock_id()).await {
            Ok(()) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use changefeed_memstore::InMemoryLeaseStore;

    #[tokio::test]
    async fn not_initialized_until_marked() {
        let gate = LeaseStoreBootstrapGate::new(InMemoryLeaseStore::new(), "proc");
        assert!(!gate.is_initialized().await.unwrap());
        gate.mark_initialized().await.unwrap();
        assert!(gate.is_initialized().await.unwrap());
    }

    #[tokio::test]
    async fn mark_initialized_is_idempotent() {
        let gate = LeaseStoreBootstrapGate::new(InMemoryLeaseStore::new(), "proc");
        gate.mark_initialized().await.unwrap();
        gate.mark_initialized().await.unwrap();
        assert!(gate.is_initialized().await.unwrap());
    }

    #[tokio::test]
    async fn second_lock_acquire_is_denied() {
        let store = InMemoryLeaseStore::new();
        let gate_a = LeaseStoreBootstrapGate::new(store.clone(), "proc");
        let gate_b = LeaseStoreBootstrapGate::new(store, "proc");

        assert!(gate_a.acquire_init_lock(Duration::from_secs(30)).await.unwrap());
        assert!(!gate_b.acquire_init_lock(Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn release_missing_lock_is_success() {
        let gate = LeaseStoreBootstrapGate::new(InMemoryLeaseStore::new(), "proc");
        gate.release_init_lock().await.unwrap();
    }
}
