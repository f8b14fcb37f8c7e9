//! C4: partition processor — the per-partition read loop (spec §4.4).
//!
//! ```text
//!  Reading ──(batch, ok)──► Dispatching ──(ack)──► Checkpointing ──► Reading
//!     │                        │                       │
//!     │                        │                       └─(etag fail)─► exit LeaseLost
//!     │                        └─(observer error)─► exit ObserverFailed
//!     └─(split detected)─► exit Split
//!     └─(cancel)─► exit Cancelled
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use changefeed_common::config::{CheckpointFrequency, ValidatedConfig};
use changefeed_common::ids::ContinuationToken;
use changefeed_common::model::Lease;

use crate::error::{backoff_with_jitter, ProcessorExit};
use crate::feed::{FeedSignal, FeedStoreClient};
use crate::lease_manager::LeaseManager;
use crate::observer::{CloseReason, Observer, PartitionContext};
use crate::store::LeaseStoreClient;

const BACKOFF_BASE: Duration = Duration::from_millis(250);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

pub struct PartitionProcessor<F: FeedStoreClient, O: Observer> {
    feed: Arc<F>,
    observer: Arc<O>,
    max_item_count: u32,
    poll_delay: Duration,
    checkpoint_frequency: CheckpointFrequency,
}

impl<F: FeedStoreClient, O: Observer> PartitionProcessor<F, O> {
    pub fn new(feed: Arc<F>, observer: Arc<O>, config: &ValidatedConfig) -> Self {
        Self {
            feed,
            observer,
            max_item_count: config.max_item_count,
            poll_delay: config.feed_poll_delay,
            checkpoint_frequency: config.checkpoint_frequency,
        }
    }

    /// Run the read loop for one owned `lease` until a terminal
    /// condition is reached. `lease_manager` is used only to checkpoint
    /// progress — ownership/renewal is the supervisor's job.
    pub async fn run<C: LeaseStoreClient>(
        &self,
        mut lease: Lease,
        lease_manager: Arc<LeaseManager<C>>,
        cancel: CancellationToken,
    ) -> ProcessorExit {
        let ctx = PartitionContext { partition_id: lease.partition_id.clone() };
        self.observer.open(&ctx).await;

        let mut current_token = lease.continuation_token.clone();
        let mut batches_since_checkpoint: u32 = 0;
        let mut last_checkpoint_at = Instant::now();
        let mut transient_attempt: u32 = 0;

        let exit = 'read_loop: loop {
            if cancel.is_cancelled() {
                break ProcessorExit::Cancelled;
            }

            let token_arg = if current_token.is_empty() { None } else { Some(&current_token) };
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'read_loop ProcessorExit::Cancelled,
                result = self.feed.read_changes(&lease.partition_id, token_arg, self.max_item_count) => result,
            };

            let batch = match read {
                Ok(batch) => batch,
                Err(err) => {
                    transient_attempt += 1;
                    warn!(partition_id = %lease.partition_id, error = %err, "feed read failed");
                    self.sleep_or_cancel(backoff_with_jitter(transient_attempt, BACKOFF_BASE, BACKOFF_MAX), &cancel).await;
                    continue 'read_loop;
                }
            };

            match &batch.signal {
                FeedSignal::PartitionGone => break ProcessorExit::Split,
                FeedSignal::Fatal(message) => break ProcessorExit::Fatal(message.clone()),
                FeedSignal::Throttled(delay) => {
                    self.sleep_or_cancel(*delay, &cancel).await;
                    continue 'read_loop;
                }
                FeedSignal::NotModified => {
                    self.sleep_or_cancel(self.poll_delay, &cancel).await;
                    continue 'read_loop;
                }
                FeedSignal::Ok => {}
            }

            transient_attempt = 0;

            if batch.records.is_empty() {
                current_token = batch.next_token;
                self.sleep_or_cancel(self.poll_delay, &cancel).await;
                continue 'read_loop;
            }

            if let Err(observer_err) =
                self.observer.process_changes(&ctx, batch.records, cancel.clone()).await
            {
                warn!(partition_id = %lease.partition_id, error = %observer_err, "observer failed");
                break ProcessorExit::ObserverFailed;
            }

            current_token = batch.next_token;
            batches_since_checkpoint += 1;

            if self.should_checkpoint(batches_since_checkpoint, last_checkpoint_at) {
                match lease_manager.checkpoint(&lease, current_token.clone()).await {
                    Ok(checkpointed) => {
                        lease = checkpointed;
                        batches_since_checkpoint = 0;
                        last_checkpoint_at = Instant::now();
                    }
                    Err(crate::error::LeaseManagerError::LeaseLost) => {
                        break ProcessorExit::LeaseLost;
                    }
                    Err(err) => {
                        warn!(partition_id = %lease.partition_id, error = %err, "checkpoint failed, will retry next cycle");
                    }
                }
            }
        };

        let close_reason = match &exit {
            ProcessorExit::Split => CloseReason::Split,
            ProcessorExit::LeaseLost => CloseReason::LeaseLost,
            ProcessorExit::ObserverFailed => CloseReason::ObserverFailed,
            ProcessorExit::Cancelled | ProcessorExit::Fatal(_) => CloseReason::Shutdown,
        };
        self.observer.close(&ctx, close_reason).await;

        exit
    }

    fn should_checkpoint(&self, batches_since_checkpoint: u32, last_checkpoint_at: Instant) -> bool {
        match self.checkpoint_frequency {
            CheckpointFrequency::EveryBatch => true,
            CheckpointFrequency::EveryNBatches(n) => batches_since_checkpoint >= n,
            CheckpointFrequency::EveryInterval(interval) => {
                last_checkpoint_at.elapsed() >= interval
            }
            CheckpointFrequency::Manual => false,
        }
    }

    async fn sleep_or_cancel(&self, duration: Duration, cancel: &CancellationToken) {
        if duration.is_zero() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = cancel.cancelled() => {}
        }
        debug!(?duration, "processor slept");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use changefeed_common::ids::PartitionId;
    use changefeed_memstore::{CountingObserver, InMemoryFeedStore, InMemoryLeaseStore};
    use std::sync::atomic::Ordering;

    fn config() -> ValidatedConfig {
        changefeed_common::config::ProcessorConfig {
            lease_prefix: "proc".to_string(),
            ..Default::default()
        }
        .validate()
        .unwrap()
    }

    #[tokio::test]
    async fn processes_all_records_in_a_single_partition() {
        let feed = Arc::new(InMemoryFeedStore::with_records("p-0", 10));
        let observer = Arc::new(CountingObserver::default());
        let processor = PartitionProcessor::new(feed, observer.clone(), &config());
        let lease_manager = Arc::new(LeaseManager::new(InMemoryLeaseStore::new(), "proc"));

        let lease = Lease {
            partition_id: PartitionId::new("p-0"),
            owner: Some(changefeed_common::ids::HostId::new("host-a")),
            continuation_token: ContinuationToken::empty(),
            timestamp: chrono::Utc::now(),
            properties: Default::default(),
            etag: changefeed_common::ids::Etag::new("e0"),
        };

        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let exit = tokio::time::timeout(Duration::from_secs(5), async move {
            let exit = processor.run(lease, lease_manager, cancel_clone.clone()).await;
            exit
        })
        .await;

        // InMemoryFeedStore::with_records exhausts after 10 records and then
        // reports PartitionGone so the test terminates deterministically.
        assert_eq!(exit.unwrap(), ProcessorExit::Split);
        assert_eq!(observer.processed.load(Ordering::SeqCst), 10);
        assert_eq!(observer.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop() {
        let feed = Arc::new(InMemoryFeedStore::idle("p-0"));
        let observer = Arc::new(CountingObserver::default());
        let processor = PartitionProcessor::new(feed, observer, &config());
        let lease_manager = Arc::new(LeaseManager::new(InMemoryLeaseStore::new(), "proc"));

        let lease = Lease {
            partition_id: PartitionId::new("p-0"),
            owner: Some(changefeed_common::ids::HostId::new("host-a")),
            continuation_token: ContinuationToken::empty(),
            timestamp: chrono::Utc::now(),
            properties: Default::default(),
            etag: changefeed_common::ids::Etag::new("e0"),
        };

        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let handle = tokio::spawn(async move { processor.run(lease, lease_manager, cancel_clone).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        let exit = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(exit, ProcessorExit::Cancelled);
    }
}
