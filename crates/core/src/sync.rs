//! C3: partition synchronizer — enumerates current partitions, creates
//! missing leases, and materializes child leases on a split (spec §4.3).

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use changefeed_common::ids::ContinuationToken;
use changefeed_common::model::PartitionRange;

use crate::error::LeaseManagerError;
use crate::feed::FeedStoreClient;
use crate::lease_manager::{CreateOutcome, LeaseManager};
use crate::store::LeaseStoreClient;

pub struct PartitionSynchronizer<F: FeedStoreClient> {
    feed: Arc<F>,
}

impl<F: FeedStoreClient> PartitionSynchronizer<F> {
    pub fn new(feed: Arc<F>) -> Self {
        Self { feed }
    }

    /// Query the monitored store for its current partitions.
    pub async fn list_partitions(&self) -> Result<Vec<PartitionRange>, LeaseManagerError> {
        self.feed.list_partitions().await.map_err(|err| LeaseManagerError::Transient(err.to_string()))
    }

    /// Create a lease for every current partition that doesn't have one
    /// yet, bounded by `degree_of_parallelism` concurrent creates.
    ///
    /// Tolerates concurrent runners: creation is conditional, so two
    /// hosts racing this end up with exactly one lease per partition
    /// (spec §4.3, tested by scenario S5).
    pub async fn create_missing_leases<C: LeaseStoreClient>(
        &self,
        lease_manager: &Arc<LeaseManager<C>>,
        degree_of_parallelism: usize,
    ) -> Result<usize, LeaseManagerError> {
        let partitions = self.list_partitions().await?;
        let semaphore = Arc::new(Semaphore::new(degree_of_parallelism.max(1)));
        let mut tasks = JoinSet::new();
        let mut created = 0usize;

        for partition in partitions {
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
            let lease_manager = lease_manager.clone();
            tasks.spawn(async move {
                let _permit = permit;
                lease_manager
                    .create_if_absent(partition.partition_id.clone(), ContinuationToken::empty())
                    .await
            });
        }

        while let Some(result) = tasks.join_next().await {
            match result.expect("create_missing_leases task panicked") {
                Ok(CreateOutcome::Created(_)) => created += 1,
                Ok(CreateOutcome::AlreadyExists) => {
                    debug!("lease already existed during bulk creation")
                }
                Err(err) => warn!(error = %err, "failed to create lease during bootstrap"),
            }
        }

        Ok(created)
    }

    /// Enumerate the children of a split parent and create a lease per
    /// child, each seeded with the parent's `continuation_token` (spec
    /// invariant 4). Deleting the parent lease is the caller's
    /// responsibility (the supervisor, after this returns).
    pub async fn split_parent<C: LeaseStoreClient>(
        &self,
        lease_manager: &LeaseManager<C>,
        parent: &changefeed_common::model::Lease,
    ) -> Result<Vec<changefeed_common::model::Lease>, LeaseManagerError> {
        let children = self
            .feed
            .split_children(&parent.partition_id)
            .await
            .map_err(|err| LeaseManagerError::Transient(err.to_string()))?;

        let mut child_leases = Vec::with_capacity(children.len());
        for child in children {
            let outcome = lease_manager
                .create_if_absent(child.partition_id.clone(), parent.continuation_token.clone())
                .await?;
            match outcome {
                CreateOutcome::Created(lease) => child_leases.push(lease),
                CreateOutcome::AlreadyExists => {
                    debug!(partition_id = %child.partition_id, "child lease already existed");
                }
            }
        }
        Ok(child_leases)
    }
}
