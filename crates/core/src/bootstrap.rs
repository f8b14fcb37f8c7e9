//! C8: bootstrap — elects exactly one host to seed the lease collection
//! on first startup, using the advisory init lock from C1 (spec §4.8).

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::LeaseManagerError;
use crate::feed::FeedStoreClient;
use crate::lease_manager::LeaseManager;
use crate::lease_store::LeaseStoreBootstrapGate;
use crate::store::LeaseStoreClient;
use crate::sync::PartitionSynchronizer;

pub struct Bootstrapper<C: LeaseStoreClient, F: FeedStoreClient> {
    gate: LeaseStoreBootstrapGate<C>,
    synchronizer: Arc<PartitionSynchronizer<F>>,
    lease_manager: Arc<LeaseManager<C>>,
    bootstrap_lock_ttl: Duration,
    bootstrap_retry_delay: Duration,
    degree_of_parallelism: usize,
}

impl<C: LeaseStoreClient, F: FeedStoreClient> Bootstrapper<C, F> {
    pub fn new(
        gate: LeaseStoreBootstrapGate<C>,
        synchronizer: Arc<PartitionSynchronizer<F>>,
        lease_manager: Arc<LeaseManager<C>>,
        bootstrap_lock_ttl: Duration,
        bootstrap_retry_delay: Duration,
        degree_of_parallelism: usize,
    ) -> Self {
        Self {
            gate,
            synchronizer,
            lease_manager,
            bootstrap_lock_ttl,
            bootstrap_retry_delay,
            degree_of_parallelism,
        }
    }

    /// Block until the lease collection is known to have one lease per
    /// partition. Exactly one racing host does the seeding; the rest
    /// poll `is_initialized` until it reports true. Returns early if
    /// `cancel` fires while waiting on a lock held by another host.
    pub async fn ensure_initialized(&self, cancel: CancellationToken) -> Result<(), LeaseManagerError> {
        loop {
            if self.gate.is_initialized().await? {
                return Ok(());
            }

            if self.gate.acquire_init_lock(self.bootstrap_lock_ttl).await? {
                info!("acquired bootstrap lock, seeding lease collection");
                let result = self
                    .synchronizer
                    .create_missing_leases(&self.lease_manager, self.degree_of_parallelism)
                    .await;
                match result {
                    Ok(created) => {
                        self.gate.mark_initialized().await?;
                        self.gate.release_init_lock().await?;
                        info!(created, "bootstrap complete");
                        return Ok(());
                    }
                    Err(err) => {
                        self.gate.release_init_lock().await?;
                        return Err(err);
                    }
                }
            }

            debug!("bootstrap lock held by another host, waiting");
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.bootstrap_retry_delay) => {}
            }
        }
    }
}
