//! The change-stream processor core: lease management, partition
//! supervision, load balancing, and bootstrap, parameterized over an
//! injected lease store, feed store, and observer (spec §4, §6).
//!
//! Nothing in this crate talks to a concrete database; `changefeed-cli`
//! and `changefeed-memstore` exist to exercise it end to end.

pub mod balancer;
pub mod bootstrap;
pub mod controller;
pub mod error;
pub mod feed;
pub mod health;
pub mod lease_manager;
pub mod lease_store;
pub mod observer;
pub mod processor;
pub mod store;
pub mod sync;
pub mod supervisor;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use changefeed_common::config::ValidatedConfig;
use changefeed_common::ids::HostId;

use crate::balancer::{BalancerTick, EqualPartitionsStrategy, LoadBalancingStrategy};
use crate::bootstrap::Bootstrapper;
use crate::controller::{ControllerEvent, PartitionController};
use crate::error::LeaseManagerError;
use crate::feed::FeedStoreClient;
use crate::health::{HealthEvent, HealthOperation, HealthSeverity, HealthSink};
use crate::lease_manager::LeaseManager;
use crate::lease_store::LeaseStoreBootstrapGate;
use crate::observer::Observer;
use crate::processor::PartitionProcessor;
use crate::store::LeaseStoreClient;
use crate::supervisor::PartitionSupervisor;
use crate::sync::PartitionSynchronizer;

/// Wires C1–C8 together into one host's run loop: bootstrap the lease
/// collection, then alternate balancing and draining supervision
/// outcomes until `shutdown` fires.
pub struct ChangeFeedProcessor<C: LeaseStoreClient + Clone, F: FeedStoreClient, O: Observer> {
    host: HostId,
    config: ValidatedConfig,
    lease_manager: Arc<LeaseManager<C>>,
    bootstrapper: Bootstrapper<C, F>,
    balancer: BalancerTick<C>,
    controller: PartitionController<C, F, O>,
    health: Arc<dyn HealthSink>,
}

impl<C: LeaseStoreClient + Clone, F: FeedStoreClient, O: Observer> ChangeFeedProcessor<C, F, O> {
    pub fn new(client: C, feed: Arc<F>, observer: Arc<O>, host: HostId, config: ValidatedConfig) -> Self {
        Self::with_strategy_and_health(
            client,
            feed,
            observer,
            host,
            config,
            Arc::new(EqualPartitionsStrategy),
            Arc::new(crate::health::TracingHealthSink::new(Duration::from_secs(900))),
        )
    }

    pub fn with_strategy_and_health(
        client: C,
        feed: Arc<F>,
        observer: Arc<O>,
        host: HostId,
        config: ValidatedConfig,
        strategy: Arc<dyn LoadBalancingStrategy>,
        health: Arc<dyn HealthSink>,
    ) -> Self {
        let lease_manager = Arc::new(LeaseManager::new(client.clone(), config.lease_prefix.clone()));
        let synchronizer = Arc::new(PartitionSynchronizer::new(feed.clone()));
        let gate = LeaseStoreBootstrapGate::new(client, config.lease_prefix.clone());

        let bootstrapper = Bootstrapper::new(
            gate,
            synchronizer.clone(),
            lease_manager.clone(),
            config.bootstrap_lock_ttl,
            config.bootstrap_retry_delay,
            config.degree_of_parallelism,
        );

        let partition_processor = Arc::new(PartitionProcessor::new(feed, observer, &config));
        let supervisor = Arc::new(PartitionSupervisor::new(
            lease_manager.clone(),
            synchronizer,
            partition_processor,
            host.clone(),
            config.lease_renew_interval,
            config.unhealthiness_duration,
            health.clone(),
        ));
        let controller = PartitionController::new(supervisor, health.clone());

        let balancer = BalancerTick::new(
            lease_manager.clone(),
            strategy,
            host.clone(),
            config.lease_expiration_interval,
            config.min_partition_count,
            config.max_partition_count,
            config.degree_of_parallelism,
        );

        Self { host, config, lease_manager, bootstrapper, balancer, controller, health }
    }

    /// Run until `shutdown` is cancelled, then release every lease this
    /// host holds before returning.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), LeaseManagerError> {
        self.bootstrapper.ensure_initialized(shutdown.clone()).await?;
        info!(host = %self.host, "bootstrap complete, entering balance loop");

        while !shutdown.is_cancelled() {
            for event in self.controller.tick() {
                self.handle_event(event);
            }

            match self.balancer.run().await {
                Ok(outcome) => {
                    for lease in outcome.acquired {
                        info!(host = %self.host, partition_id = %lease.partition_id, "acquired partition");
                        self.controller.add(lease);
                    }
                    for partition_id in outcome.released {
                        info!(host = %self.host, %partition_id, "balancer releasing partition to rebalance");
                        self.controller.remove(&partition_id);
                    }
                }
                Err(err) => {
                    self.health.record(HealthEvent {
                        severity: HealthSeverity::Warning,
                        operation: HealthOperation::AcquireLeaseFailure,
                        partition_id: None,
                        message: err.to_string(),
                    });
                    warn!(host = %self.host, error = %err, "balancer tick failed");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.lease_acquire_interval) => {}
            }
        }

        for event in self.controller.shutdown().await {
            self.handle_event(event);
        }
        Ok(())
    }

    fn handle_event(&mut self, event: ControllerEvent) {
        match event {
            ControllerEvent::Released(partition_id) => {
                info!(host = %self.host, %partition_id, "released partition, available for rebalancing");
            }
            ControllerEvent::Split { parent, children } => {
                info!(host = %self.host, %parent, children = children.len(), "partition split, adopting children");
                for child in children {
                    self.controller.add(child);
                }
            }
            ControllerEvent::Fatal { partition_id, message } => {
                warn!(host = %self.host, %partition_id, %message, "partition supervision failed fatally");
            }
        }
    }

    pub fn owned_partition_count(&self) -> usize {
        self.controller.len()
    }

    pub fn lease_manager(&self) -> &Arc<LeaseManager<C>> {
        &self.lease_manager
    }
}
