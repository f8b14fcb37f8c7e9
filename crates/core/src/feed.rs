//! The injected feed-store client (spec §6): reads change batches,
//! enumerates partitions, and enumerates the children of a split parent.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use changefeed_common::ids::{ContinuationToken, PartitionId};
use changefeed_common::model::{ChangeRecord, PartitionRange};

/// Server-side signal accompanying a `read_changes` response (spec §4.4
/// error classification table).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedSignal {
    /// New records were returned (or the response was simply empty —
    /// callers distinguish the two by `batch.records.is_empty()`).
    Ok,
    /// No new records; the continuation token is unchanged.
    NotModified,
    /// Server-requested back-off before the next read.
    Throttled(Duration),
    /// The partition has been split or otherwise no longer exists.
    PartitionGone,
    /// Unrecoverable for this partition; the processor should abort.
    Fatal(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeBatch {
    pub records: Vec<ChangeRecord>,
    pub next_token: ContinuationToken,
    pub signal: FeedSignal,
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("transient feed error: {0}")]
    Transient(String),
    #[error("fatal feed error: {0}")]
    Fatal(String),
}

/// Injected client over the monitored store's change feed.
pub trait FeedStoreClient: Send + Sync + 'static {
    /// Enumerate the store's current partitions.
    fn list_partitions(
        &self,
    ) -> impl Future<Output = Result<Vec<PartitionRange>, FeedError>> + Send;

    /// Read the next batch for `partition_id`, resuming from
    /// `continuation_token` (or the beginning, if `None`).
    fn read_changes(
        &self,
        partition_id: &PartitionId,
        continuation_token: Option<&ContinuationToken>,
        max_item_count: u32,
    ) -> impl Future<Output = Result<ChangeBatch, FeedError>> + Send;

    /// Enumerate the children of a partition that has split.
    fn split_children(
        &self,
        partition_id: &PartitionId,
    ) -> impl Future<Output = Result<Vec<PartitionRange>, FeedError>> + Send;
}
