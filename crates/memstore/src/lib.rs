//! In-memory reference implementations of the two injected store clients
//! and a couple of test-double observers.
//!
//! Not an external interface of the processor — purely test/demo
//! scaffolding so `changefeed-core`'s unit tests and `changefeed-cli`'s
//! demo binary don't need a real database.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use changefeed_common::ids::{ContinuationToken, Etag, PartitionId};
use changefeed_common::model::{ChangeRecord, PartitionRange};
use changefeed_core::feed::{ChangeBatch, FeedError, FeedSignal, FeedStoreClient};
use changefeed_core::observer::{CloseReason, ObserverError, PartitionContext};
use changefeed_core::observer::Observer;
use changefeed_core::store::{LeaseStoreClient, LeaseStoreError, StoreRecord};

struct Entry {
    record: StoreRecord,
    expires_at: Option<Instant>,
}

/// A [`LeaseStoreClient`] backed by a `BTreeMap` guarded by a `Mutex`.
/// Cheap to clone — clones share the same underlying map, matching the
/// "cheap to share" contract the trait documents.
#[derive(Clone, Default)]
pub struct InMemoryLeaseStore {
    inner: Arc<Mutex<BTreeMap<String, Entry>>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn expire(guard: &mut BTreeMap<String, Entry>, id: &str) {
        let expired = guard
            .get(id)
            .and_then(|entry| entry.expires_at)
            .is_some_and(|at| Instant::now() >= at);
        if expired {
            guard.remove(id);
        }
    }

    fn expire_all(guard: &mut BTreeMap<String, Entry>) {
        let now = Instant::now();
        guard.retain(|_, entry| entry.expires_at.map_or(true, |at| now < at));
    }
}

impl LeaseStoreClient for InMemoryLeaseStore {
    async fn read(&self, id: &str) -> Result<Option<StoreRecord>, LeaseStoreError> {
        let mut guard = self.inner.lock().expect("lease store mutex poisoned");
        Self::expire(&mut guard, id);
        Ok(guard.get(id).map(|entry| entry.record.clone()))
    }

    async fn create(
        &self,
        mut record: StoreRecord,
        ttl: Option<Duration>,
    ) -> Result<StoreRecord, LeaseStoreError> {
        let mut guard = self.inner.lock().expect("lease store mutex poisoned");
        Self::expire(&mut guard, &record.id);
        if guard.contains_key(&record.id) {
            return Err(LeaseStoreError::Conflict);
        }
        record.etag = Etag::new(Uuid::new_v4().to_string());
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        guard.insert(record.id.clone(), Entry { record: record.clone(), expires_at });
        Ok(record)
    }

    async fn replace(
        &self,
        mut record: StoreRecord,
        if_match: Etag,
    ) -> Result<StoreRecord, LeaseStoreError> {
        let mut guard = self.inner.lock().expect("lease store mutex poisoned");
        Self::expire(&mut guard, &record.id);
        match guard.get(&record.id) {
            None => Err(LeaseStoreError::Conflict),
            Some(entry) if entry.record.etag != if_match => Err(LeaseStoreError::Conflict),
            Some(_) => {
                record.etag = Etag::new(Uuid::new_v4().to_string());
                guard.insert(record.id.clone(), Entry { record: record.clone(), expires_at: None });
                Ok(record)
            }
        }
    }

    async fn delete(&self, id: &str) -> Result<(), LeaseStoreError> {
        let mut guard = self.inner.lock().expect("lease store mutex poisoned");
        guard.remove(id);
        Ok(())
    }

    async fn list_prefixed(&self, prefix: &str) -> Result<Vec<StoreRecord>, LeaseStoreError> {
        let mut guard = self.inner.lock().expect("lease store mutex poisoned");
        Self::expire_all(&mut guard);
        Ok(guard
            .iter()
            .filter(|(id, _)| id.starts_with(prefix))
            .map(|(_, entry)| entry.record.clone())
            .collect())
    }
}

/// What an [`InMemoryFeedStore`] delivers for one partition's
/// `read_changes` calls.
enum FeedFixture {
    /// Always `NotModified`, forever. Used to drive cancellation tests.
    Idle,
    /// A fixed sequence of batch sizes, addressed by position rather
    /// than internal mutable state: the continuation token passed in
    /// *is* the position (empty ⇔ position 0), so a retried read with
    /// the same token always redelivers the same batch — exactly what
    /// the real server contract (and spec invariant 3) requires. Once
    /// every chunk has been delivered, the partition reports gone.
    Records { chunks: Vec<usize> },
}

impl FeedFixture {
    fn records(total: usize) -> Self {
        Self::Records { chunks: vec![total] }
    }
}

/// A [`FeedStoreClient`] fixture. Built with one of the `with_*`
/// constructors, each tailored to a single scenario.
pub struct InMemoryFeedStore {
    partitions: Vec<PartitionRange>,
    splits: BTreeMap<String, Vec<PartitionRange>>,
    fixtures: BTreeMap<String, FeedFixture>,
}

fn partition_range(id: &str) -> PartitionRange {
    PartitionRange { partition_id: PartitionId::new(id), min: String::new(), max: String::new() }
}

fn position_of(token: Option<&ContinuationToken>) -> usize {
    match token {
        None => 0,
        Some(token) if token.is_empty() => 0,
        Some(token) => token.as_str().parse().unwrap_or(0),
    }
}

impl InMemoryFeedStore {
    /// `n` partitions (`p-0`..`p-{n-1}`), none of which have change
    /// records or splits — used to exercise bulk lease creation.
    pub fn with_partitions(n: usize) -> Self {
        let partitions = (0..n).map(|i| partition_range(&format!("p-{i}"))).collect();
        Self { partitions, splits: BTreeMap::new(), fixtures: BTreeMap::new() }
    }

    /// A single partition `partition_id` whose `split_children` returns
    /// `child_ids`.
    pub fn with_split(partition_id: &str, child_ids: Vec<&str>) -> Self {
        let children = child_ids.iter().map(|id| partition_range(id)).collect();
        let mut splits = BTreeMap::new();
        splits.insert(partition_id.to_string(), children);
        Self { partitions: vec![partition_range(partition_id)], splits, fixtures: BTreeMap::new() }
    }

    /// A single partition that delivers exactly `count` records on its
    /// first read, then reports the partition gone.
    pub fn with_records(partition_id: &str, count: usize) -> Self {
        let mut fixtures = BTreeMap::new();
        fixtures.insert(partition_id.to_string(), FeedFixture::records(count));
        Self { partitions: vec![partition_range(partition_id)], splits: BTreeMap::new(), fixtures }
    }

    /// A single partition whose records are delivered across several
    /// successive batches (`chunk_sizes`, in order) instead of all at
    /// once — used to drive scenarios that observe progress mid-stream.
    pub fn with_chunked_records(partition_id: &str, chunk_sizes: Vec<usize>) -> Self {
        let mut fixtures = BTreeMap::new();
        fixtures.insert(partition_id.to_string(), FeedFixture::Records { chunks: chunk_sizes });
        Self { partitions: vec![partition_range(partition_id)], splits: BTreeMap::new(), fixtures }
    }

    /// Several partitions, each delivering its own total record count in
    /// one batch — used for multi-partition scenarios (S1, S3) where
    /// the totals across partitions add up to a known grand total.
    pub fn with_partition_totals(specs: &[(&str, usize)]) -> Self {
        let partitions = specs.iter().map(|(id, _)| partition_range(id)).collect();
        let fixtures =
            specs.iter().map(|(id, count)| ((*id).to_string(), FeedFixture::records(*count))).collect();
        Self { partitions, splits: BTreeMap::new(), fixtures }
    }

    /// Several partitions, each with its own chunked delivery schedule —
    /// the multi-partition generalization of [`Self::with_chunked_records`],
    /// used to observe partial progress across a fleet mid-stream (S4).
    pub fn with_partitions_chunked(specs: &[(&str, Vec<usize>)]) -> Self {
        let partitions = specs.iter().map(|(id, _)| partition_range(id)).collect();
        let fixtures = specs
            .iter()
            .map(|(id, chunks)| ((*id).to_string(), FeedFixture::Records { chunks: chunks.clone() }))
            .collect();
        Self { partitions, splits: BTreeMap::new(), fixtures }
    }

    /// A single partition that never has new records, used to drive a
    /// processor until it is cancelled.
    pub fn idle(partition_id: &str) -> Self {
        let mut fixtures = BTreeMap::new();
        fixtures.insert(partition_id.to_string(), FeedFixture::Idle);
        Self { partitions: vec![partition_range(partition_id)], splits: BTreeMap::new(), fixtures }
    }
}

impl FeedStoreClient for InMemoryFeedStore {
    async fn list_partitions(&self) -> Result<Vec<PartitionRange>, FeedError> {
        Ok(self.partitions.clone())
    }

    async fn read_changes(
        &self,
        partition_id: &PartitionId,
        continuation_token: Option<&ContinuationToken>,
        _max_item_count: u32,
    ) -> Result<ChangeBatch, FeedError> {
        match self.fixtures.get(partition_id.as_str()) {
            Some(FeedFixture::Idle) | None => Ok(ChangeBatch {
                records: Vec::new(),
                next_token: ContinuationToken::empty(),
                signal: FeedSignal::NotModified,
            }),
            Some(FeedFixture::Records { chunks }) => {
                let position = position_of(continuation_token);
                if position >= chunks.len() {
                    return Ok(ChangeBatch {
                        records: Vec::new(),
                        next_token: ContinuationToken::new(position.to_string()),
                        signal: FeedSignal::PartitionGone,
                    });
                }
                let count = chunks[position];
                let records = (0..count)
                    .map(|i| ChangeRecord {
                        payload: format!("record-{position}-{i}").into_bytes(),
                        continuation_token: ContinuationToken::new((position + 1).to_string()),
                    })
                    .collect();
                Ok(ChangeBatch {
                    records,
                    next_token: ContinuationToken::new((position + 1).to_string()),
                    signal: FeedSignal::Ok,
                })
            }
        }
    }

    async fn split_children(&self, partition_id: &PartitionId) -> Result<Vec<PartitionRange>, FeedError> {
        Ok(self.splits.get(partition_id.as_str()).cloned().unwrap_or_default())
    }
}

/// An [`Observer`] test double that just counts callbacks.
#[derive(Default)]
pub struct CountingObserver {
    pub opened: AtomicUsize,
    pub processed: AtomicUsize,
    pub closed: AtomicUsize,
}

impl Observer for CountingObserver {
    async fn open(&self, _ctx: &PartitionContext) {
        self.opened.fetch_add(1, Ordering::SeqCst);
    }

    async fn process_changes(
        &self,
        _ctx: &PartitionContext,
        batch: Vec<ChangeRecord>,
        _cancel: CancellationToken,
    ) -> Result<(), ObserverError> {
        self.processed.fetch_add(batch.len(), Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self, _ctx: &PartitionContext, _reason: CloseReason) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// An [`Observer`] test double whose `process_changes` always fails,
/// used to exercise `ProcessorExit::ObserverFailed`.
#[derive(Default)]
pub struct FailingObserver;

impl Observer for FailingObserver {
    async fn open(&self, _ctx: &PartitionContext) {}

    async fn process_changes(
        &self,
        _ctx: &PartitionContext,
        _batch: Vec<ChangeRecord>,
        _cancel: CancellationToken,
    ) -> Result<(), ObserverError> {
        Err(ObserverError("synthetic failure".to_string()))
    }

    async fn close(&self, _ctx: &PartitionContext, _reason: CloseReason) {}
}

/// An [`Observer`] test double whose `process_changes` fails the first
/// `failures_per_partition` times it is called *for a given partition*,
/// then succeeds on every subsequent call to that partition — used to
/// exercise at-least-once redelivery after a transient observer failure
/// without the redelivery of one partition masking progress on another.
pub struct FlakyObserver {
    failures_per_partition: usize,
    remaining: Mutex<BTreeMap<String, usize>>,
    pub processed: AtomicUsize,
}

impl FlakyObserver {
    pub fn new(failures_per_partition: usize) -> Self {
        Self {
            failures_per_partition,
            remaining: Mutex::new(BTreeMap::new()),
            processed: AtomicUsize::new(0),
        }
    }
}

impl Observer for FlakyObserver {
    async fn open(&self, _ctx: &PartitionContext) {}

    async fn process_changes(
        &self,
        ctx: &PartitionContext,
        batch: Vec<ChangeRecord>,
        _cancel: CancellationToken,
    ) -> Result<(), ObserverError> {
        let mut remaining = self.remaining.lock().expect("flaky observer mutex poisoned");
        let left = remaining.entry(ctx.partition_id.as_str().to_string()).or_insert(self.failures_per_partition);
        if *left > 0 {
            *left -= 1;
            return Err(ObserverError("transient failure".to_string()));
        }
        drop(remaining);
        self.processed.fetch_add(batch.len(), Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self, _ctx: &PartitionContext, _reason: CloseReason) {}
}
