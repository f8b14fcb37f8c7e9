//! C2: lease manager — CRUD over per-partition lease records, ownership
//! transitions, and checkpointing (spec §4.2). Every operation is
//! at-most-once, guarded by the store's `etag` optimistic concurrency.

use std::collections::BTreeMap;

use chrono::Utc;

use changefeed_common::ids::{ContinuationToken, HostId, PartitionId};
use changefeed_common::model::Lease;

use crate::error::LeaseManagerError;
use crate::store::{LeaseStoreClient, LeaseStoreError, StoreRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(Lease),
    AlreadyExists,
}

pub struct LeaseManager<C: LeaseStoreClient> {
    client: C,
    lease_prefix: String,
}

impl<C: LeaseStoreClient> LeaseManager<C> {
    pub fn new(client: C, lease_prefix: impl Into<String>) -> Self {
        Self { client, lease_prefix: lease_prefix.into() }
    }

    fn record_id(&self, partition_id: &PartitionId) -> String {
        format!("{}..{}", self.lease_prefix, partition_id.as_str())
    }

    fn record_prefix(&self) -> String {
        format!("{}..", self.lease_prefix)
    }

    /// All partition leases in the collection, owned or not.
    pub async fn list_all(&self) -> Result<Vec<Lease>, LeaseManagerError> {
        let records = self.client.list_prefixed(&self.record_prefix()).await?;
        Ok(records.into_iter().map(record_to_lease).collect())
    }

    /// Every lease currently owned by `host`.
    pub async fn list_owned_by(&self, host: &HostId) -> Result<Vec<Lease>, LeaseManagerError> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|lease| lease.owner.as_ref() == Some(host))
            .collect())
    }

    /// Create a lease for `partition_id` seeded with `continuation_token`
    /// if one does not already exist.
    pub async fn create_if_absent(
        &self,
        partition_id: PartitionId,
        continuation_token: ContinuationToken,
    ) -> Result<CreateOutcome, LeaseManagerError> {
        let mut record = StoreRecord::new(self.record_id(&partition_id), Utc::now());
        record.continuation_token = continuation_token.as_str().to_string();
        match self.client.create(record, None).await {
            Ok(created) => Ok(CreateOutcome::Created(record_to_lease(created))),
            Err(LeaseStoreError::Conflict) => Ok(CreateOutcome::AlreadyExists),
            Err(err) => Err(err.into()),
        }
    }

    /// Acquire `lease` on behalf of `host`: set `owner = host`, bump
    /// `timestamp`, refresh `etag`.
    ///
    /// On an etag conflict, re-reads once and retries if the lease is
    /// still ownable by `host`; otherwise fails with `LeaseLost` (spec
    /// §4.2 "acquire" algorithm).
    pub async fn acquire(&self, lease: &Lease, host: &HostId) -> Result<Lease, LeaseManagerError> {
        self.acquire_inner(lease.clone(), host, true).await
    }

    async fn acquire_inner(
        &self,
        lease: Lease,
        host: &HostId,
        allow_retry: bool,
    ) -> Result<Lease, LeaseManagerError> {
        let now = Utc::now();
        let mut record = self.lease_to_record(&lease);
        record.owner = host.as_str().to_string();
        record.timestamp = now;

        match self.client.replace(record, lease.etag.clone()).await {
            Ok(replaced) => Ok(record_to_lease(replaced)),
            Err(LeaseStoreError::Conflict) if allow_retry => {
                let current = self.read_lease(&lease.partition_id).await?;
                if current.owner.is_none() || current.owner.as_ref() == Some(host) {
                    Box::pin(self.acquire_inner(current, host, false)).await
                } else {
                    Err(LeaseManagerError::LeaseLost)
                }
            }
            Err(LeaseStoreError::Conflict) => Err(LeaseManagerError::LeaseLost),
            Err(err) => Err(err.into()),
        }
    }

    /// Bump `timestamp` only if still owned by `host`.
    pub async fn renew(&self, lease: &Lease, host: &HostId) -> Result<Lease, LeaseManagerError> {
        if lease.owner.as_ref() != Some(host) {
            return Err(LeaseManagerError::LeaseLost);
        }
        let mut record = self.lease_to_record(lease);
        record.timestamp = Utc::now();
        match self.client.replace(record, lease.etag.clone()).await {
            Ok(replaced) => Ok(record_to_lease(replaced)),
            Err(LeaseStoreError::Conflict) => Err(LeaseManagerError::LeaseLost),
            Err(err) => Err(err.into()),
        }
    }

    /// Clear `owner`. Conflicts are tolerated: if someone else has
    /// already mutated the lease we were giving up anyway, there is
    /// nothing left to release.
    pub async fn release(&self, lease: &Lease) -> Result<(), LeaseManagerError> {
        let mut record = self.lease_to_record(lease);
        record.owner.clear();
        record.timestamp = Utc::now();
        match self.client.replace(record, lease.etag.clone()).await {
            Ok(_) | Err(LeaseStoreError::Conflict) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Advance the checkpointed continuation token. Never call this with
    /// a token older than the lease's current one — the caller (the
    /// processor) is responsible for that ordering (spec invariant 3).
    pub async fn checkpoint(
        &self,
        lease: &Lease,
        continuation_token: ContinuationToken,
    ) -> Result<Lease, LeaseManagerError> {
        let mut record = self.lease_to_record(lease);
        record.continuation_token = continuation_token.as_str().to_string();
        record.timestamp = Utc::now();
        match self.client.replace(record, lease.etag.clone()).await {
            Ok(replaced) => Ok(record_to_lease(replaced)),
            Err(LeaseStoreError::Conflict) => Err(LeaseManagerError::LeaseLost),
            Err(err) => Err(err.into()),
        }
    }

    /// Merge `kv` into the lease's property bag.
    pub async fn update_properties(
        &self,
        lease: &Lease,
        kv: BTreeMap<String, String>,
    ) -> Result<Lease, LeaseManagerError> {
        let mut record = self.lease_to_record(lease);
        record.properties.extend(kv);
        record.timestamp = Utc::now();
        match self.client.replace(record, lease.etag.clone()).await {
            Ok(replaced) => Ok(record_to_lease(replaced)),
            Err(LeaseStoreError::Conflict) => Err(LeaseManagerError::LeaseLost),
            Err(err) => Err(err.into()),
        }
    }

    /// Delete the lease record outright (parent retirement after a
    /// split). Deleting a lease that is already gone is success.
    pub async fn delete(&self, lease: &Lease) -> Result<(), LeaseManagerError> {
        match self.client.delete(&self.record_id(&lease.partition_id)).await {
            Ok(()) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn read_lease(&self, partition_id: &PartitionId) -> Result<Lease, LeaseManagerError> {
        match self.client.read(&self.record_id(partition_id)).await? {
            Some(record) => Ok(record_to_lease(record)),
            None => Err(LeaseManagerError::NotFound),
        }
    }

    fn lease_to_record(&self, lease: &Lease) -> StoreRecord {
        StoreRecord {
            id: self.record_id(&lease.partition_id),
            owner: lease.owner.as_ref().map(HostId::as_str).unwrap_or("").to_string(),
            continuation_token: lease.continuation_token.as_str().to_string(),
            timestamp: lease.timestamp,
            properties: lease.properties.clone(),
            etag: lease.etag.clone(),
        }
    }
}

fn record_to_lease(record: StoreRecord) -> Lease {
    let partition_id = record
        .id
        .rsplit_once("..")
        .map(|(_, id)| id)
        .unwrap_or(record.id.as_str())
        .into();
    Lease {
        partition_id,
        owner: if record.owner.is_empty() { None } else { Some(HostId::new(record.owner)) },
        continuation_token: ContinuationToken::new(record.continuation_token),
        timestamp: record.timestamp,
        properties: record.properties,
        etag: record.etag,
    }
}
