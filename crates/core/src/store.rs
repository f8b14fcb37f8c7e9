//! The injected lease-store client (spec §6): CRUD on named records in a
//! logical collection, with conditional create/replace, delete, and
//! read-by-id. The core never talks to a concrete database — every
//! record it persists is addressed only by its string `id`.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use changefeed_common::ids::Etag;

/// One record in the lease collection: either a per-partition lease, or
/// one of the two bootstrap singletons (`{prefix}.info`, `{prefix}.lock`).
/// The library only reads the reserved field names listed here — the
/// wire format beyond that is opaque to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreRecord {
    pub id: String,
    pub owner: String,
    pub continuation_token: String,
    pub timestamp: DateTime<Utc>,
    pub properties: BTreeMap<String, String>,
    pub etag: Etag,
}

impl StoreRecord {
    pub fn new(id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            owner: String::new(),
            continuation_token: String::new(),
            timestamp: now,
            properties: BTreeMap::new(),
            etag: Etag::new(String::new()),
        }
    }
}

#[derive(Debug, Error)]
pub enum LeaseStoreError {
    #[error("record not found")]
    NotFound,
    /// A conditional create found an existing record, or a conditional
    /// replace's `if_match` did not match the stored etag. The universal
    /// "someone else got here first" signal — spec §4.1 rationale.
    #[error("conflict: record already exists or etag is stale")]
    Conflict,
    #[error("transient store error: {0}")]
    Transient(String),
    #[error("fatal store error: {0}")]
    Fatal(String),
}

/// Injected client for the lease collection. Implementations are
/// expected to be cheap to clone/share (`Arc`-wrapped pooled clients),
/// thread-safe, and to retry nothing on the caller's behalf — all
/// retry/back-off policy lives in `changefeed-core`.
pub trait LeaseStoreClient: Send + Sync + 'static {
    /// Read a record by id. `Ok(None)` when it does not exist.
    fn read(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<Option<StoreRecord>, LeaseStoreError>> + Send;

    /// Conditionally create a record. Fails with `Conflict` if a record
    /// with the same id already exists. `ttl` expires the record after
    /// the given duration (used only for the bootstrap lock singleton).
    fn create(
        &self,
        record: StoreRecord,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<StoreRecord, LeaseStoreError>> + Send;

    /// Conditionally replace a record. Fails with `Conflict` if the
    /// stored etag no longer matches `if_match`. Returns the replaced
    /// record with its freshly minted etag.
    fn replace(
        &self,
        record: StoreRecord,
        if_match: Etag,
    ) -> impl Future<Output = Result<StoreRecord, LeaseStoreError>> + Send;

    /// Delete a record. Deleting a record that does not exist is success,
    /// matching the idempotent semantics spec §4.1/§4.2 require.
    fn delete(&self, id: &str) -> impl Future<Output = Result<(), LeaseStoreError>> + Send;

    /// List every record whose id starts with `prefix`, in an
    /// implementation-defined but stable order.
    fn list_prefixed(
        &self,
        prefix: &str,
    ) -> impl Future<Output = Result<Vec<StoreRecord>, LeaseStoreError>> + Send;
}
