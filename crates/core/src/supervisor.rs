//! C5: supervisor — couples a lease renewal loop with one partition's
//! read loop (spec §4.5), and decides what happens to the lease once the
//! processor stops.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use changefeed_common::ids::HostId;
use changefeed_common::model::Lease;

use crate::error::{LeaseManagerError, ProcessorExit};
use crate::feed::FeedStoreClient;
use crate::health::{HealthEvent, HealthOperation, HealthSeverity, HealthSink};
use crate::lease_manager::LeaseManager;
use crate::observer::Observer;
use crate::processor::PartitionProcessor;
use crate::store::LeaseStoreClient;
use crate::sync::PartitionSynchronizer;

/// What the controller (C6) should do about a partition once its
/// supervisor returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisionOutcome {
    /// The lease was released (or lost) and can be picked up by any
    /// host, including this one, on the next balancing pass.
    Released,
    /// The partition split; `children` already have their own leases
    /// and should be added to the active set.
    Split { children: Vec<Lease> },
    /// The initial `acquire` failed for a reason other than the lease
    /// already being held (spec §4.6 `AcquireLeaseFailure`).
    AcquireFailed(String),
    /// Releasing the lease after the processor stopped failed (spec §4.6
    /// `ReleaseLeaseFailure`).
    ReleaseFailed(String),
    /// Unrecoverable; the caller should escalate (spec §7 "Fatal").
    Fatal(String),
}

/// Drives one partition from acquisition to exit.
pub struct PartitionSupervisor<C: LeaseStoreClient, F: FeedStoreClient, O: Observer> {
    lease_manager: Arc<LeaseManager<C>>,
    synchronizer: Arc<PartitionSynchronizer<F>>,
    processor: Arc<PartitionProcessor<F, O>>,
    host: HostId,
    lease_renew_interval: Duration,
    unhealthiness_duration: Duration,
    health: Arc<dyn HealthSink>,
}

impl<C: LeaseStoreClient, F: FeedStoreClient, O: Observer> PartitionSupervisor<C, F, O> {
    pub fn new(
        lease_manager: Arc<LeaseManager<C>>,
        synchronizer: Arc<PartitionSynchronizer<F>>,
        processor: Arc<PartitionProcessor<F, O>>,
        host: HostId,
        lease_renew_interval: Duration,
        unhealthiness_duration: Duration,
        health: Arc<dyn HealthSink>,
    ) -> Self {
        Self {
            lease_manager,
            synchronizer,
            processor,
            host,
            lease_renew_interval,
            unhealthiness_duration,
            health,
        }
    }

    /// Acquire `lease` on behalf of `self.host` and run it to
    /// completion. `shutdown` stops the processor and the renewal loop
    /// together; a renewal failure stops the processor on its own.
    pub async fn run(&self, lease: Lease, shutdown: CancellationToken) -> SupervisionOutcome {
        let acquired = match self.lease_manager.acquire(&lease, &self.host).await {
            Ok(acquired) => acquired,
            Err(LeaseManagerError::LeaseLost) => {
                debug!(partition_id = %lease.partition_id, "lease already taken before acquire");
                return SupervisionOutcome::Released;
            }
            Err(err) => {
                warn!(partition_id = %lease.partition_id, error = %err, "lease acquire failed");
                return SupervisionOutcome::AcquireFailed(err.to_string());
            }
        };

        let processor_cancel = shutdown.child_token();
        let renew_cancel = processor_cancel.clone();

        let processor = self.processor.clone();
        let lease_manager = self.lease_manager.clone();
        let processor_lease = acquired.clone();
        let mut processor_task = tokio::spawn(async move {
            processor.run(processor_lease, lease_manager, processor_cancel).await
        });

        let renewal = self.renewal_loop(acquired.clone(), renew_cancel.clone());
        tokio::pin!(renewal);

        let exit = tokio::select! {
            biased;
            exit = &mut processor_task => exit.expect("partition processor task panicked"),
            () = &mut renewal => {
                renew_cancel.cancel();
                processor_task.await.expect("partition processor task panicked")
            }
        };
        renew_cancel.cancel();

        self.resolve(acquired, exit).await
    }

    /// Renews the lease on `lease_renew_interval` until cancelled, until a
    /// renewal reports `LeaseLost`, or until renewal has failed
    /// continuously for `unhealthiness_duration` — in each of the latter
    /// two cases it cancels `cancel` itself so the coupled processor stops
    /// immediately (spec §4.5, §7 "after `UnhealthinessDuration` of
    /// sustained failure the containing supervisor escalates to
    /// `LeaseLost`").
    async fn renewal_loop(&self, mut lease: Lease, cancel: CancellationToken) {
        let mut failing_since: Option<Instant> = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.lease_renew_interval) => {}
            }

            match self.lease_manager.renew(&lease, &self.host).await {
                Ok(renewed) => {
                    lease = renewed;
                    failing_since = None;
                }
                Err(LeaseManagerError::LeaseLost) => {
                    warn!(partition_id = %lease.partition_id, "lease lost during renewal");
                    cancel.cancel();
                    return;
                }
                Err(err) => {
                    let since = *failing_since.get_or_insert_with(Instant::now);
                    let elapsed = since.elapsed();
                    if elapsed >= self.unhealthiness_duration {
                        self.health.record(HealthEvent {
                            severity: HealthSeverity::Error,
                            operation: HealthOperation::AcquireLeaseFailure,
                            partition_id: Some(lease.partition_id.clone()),
                            message: format!("lease renewal failing for {elapsed:?}: {err}"),
                        });
                        warn!(
                            partition_id = %lease.partition_id,
                            error = %err,
                            ?elapsed,
                            "lease renewal unhealthy, treating as lease lost"
                        );
                        cancel.cancel();
                        return;
                    }
                    warn!(partition_id = %lease.partition_id, error = %err, "lease renew failed, will retry");
                }
            }
        }
    }

    async fn resolve(&self, lease: Lease, exit: ProcessorExit) -> SupervisionOutcome {
        match exit {
            ProcessorExit::Split => match self.synchronizer.split_parent(&self.lease_manager, &lease).await {
                Ok(children) => {
                    if let Err(err) = self.lease_manager.delete(&lease).await {
                        warn!(partition_id = %lease.partition_id, error = %err, "failed to delete split parent lease");
                    }
                    info!(partition_id = %lease.partition_id, children = children.len(), "partition split");
                    SupervisionOutcome::Split { children }
                }
                Err(err) => SupervisionOutcome::Fatal(err.to_string()),
            },
            ProcessorExit::LeaseLost => SupervisionOutcome::Released,
            ProcessorExit::ObserverFailed | ProcessorExit::Cancelled => {
                match self.lease_manager.release(&lease).await {
                    Ok(()) => SupervisionOutcome::Released,
                    Err(err) => SupervisionOutcome::ReleaseFailed(err.to_string()),
                }
            }
            ProcessorExit::Fatal(message) => SupervisionOutcome::Fatal(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use changefeed_common::config::ProcessorConfig;
    use changefeed_common::ids::PartitionId;
    use changefeed_memstore::{CountingObserver, FailingObserver, InMemoryFeedStore, InMemoryLeaseStore};

    fn config() -> changefeed_common::config::ValidatedConfig {
        ProcessorConfig { lease_prefix: "proc".to_string(), ..Default::default() }.validate().unwrap()
    }

    fn test_health() -> Arc<dyn HealthSink> {
        Arc::new(crate::health::TracingHealthSink::new(Duration::from_secs(900)))
    }

    async fn seed_lease(lease_manager: &LeaseManager<InMemoryLeaseStore>, partition_id: &str) -> Lease {
        let crate::lease_manager::CreateOutcome::Created(lease) = lease_manager
            .create_if_absent(PartitionId::new(partition_id), Default::default())
            .await
            .unwrap()
        else {
            panic!("expected Created");
        };
        lease
    }

    #[tokio::test]
    async fn split_partition_produces_child_leases() {
        let store = InMemoryLeaseStore::new();
        let lease_manager = Arc::new(LeaseManager::new(store, "proc"));
        let lease = seed_lease(&lease_manager, "p-0").await;

        let feed = Arc::new(InMemoryFeedStore::with_split("p-0", vec!["p-0-a", "p-0-b"]));
        let synchronizer = Arc::new(PartitionSynchronizer::new(feed.clone()));
        let observer = Arc::new(CountingObserver::default());
        let processor = Arc::new(PartitionProcessor::new(feed, observer, &config()));

        let supervisor = PartitionSupervisor::new(
            lease_manager.clone(),
            synchronizer,
            processor,
            HostId::new("host-a"),
            Duration::from_millis(50),
            Duration::from_secs(900),
            test_health(),
        );

        let outcome = supervisor.run(lease, CancellationToken::new()).await;
        match outcome {
            SupervisionOutcome::Split { children } => assert_eq!(children.len(), 2),
            other => panic!("expected Split, got {other:?}"),
        }
        assert!(lease_manager.list_all().await.unwrap().iter().all(|l| l.partition_id.as_str() != "p-0"));
    }

    #[tokio::test]
    async fn observer_failure_releases_the_lease() {
        let store = InMemoryLeaseStore::new();
        let lease_manager = Arc::new(LeaseManager::new(store, "proc"));
        let lease = seed_lease(&lease_manager, "p-0").await;

        let feed = Arc::new(InMemoryFeedStore::with_records("p-0", 1));
        let synchronizer = Arc::new(PartitionSynchronizer::new(feed.clone()));
        let observer = Arc::new(FailingObserver);
        let processor = Arc::new(PartitionProcessor::new(feed, observer, &config()));

        let supervisor = PartitionSupervisor::new(
            lease_manager.clone(),
            synchronizer,
            processor,
            HostId::new("host-a"),
            Duration::from_millis(50),
            Duration::from_secs(900),
            test_health(),
        );

        let outcome = supervisor.run(lease, CancellationToken::new()).await;
        assert_eq!(outcome, SupervisionOutcome::Released);
        let leases = lease_manager.list_all().await.unwrap();
        assert_eq!(leases[0].owner, None);
    }

    #[tokio::test]
    async fn external_shutdown_releases_the_lease() {
        let store = InMemoryLeaseStore::new();
        let lease_manager = Arc::new(LeaseManager::new(store, "proc"));
        let lease = seed_lease(&lease_manager, "p-0").await;

        let feed = Arc::new(InMemoryFeedStore::idle("p-0"));
        let synchronizer = Arc::new(PartitionSynchronizer::new(feed.clone()));
        let observer = Arc::new(CountingObserver::default());
        let processor = Arc::new(PartitionProcessor::new(feed, observer, &config()));

        let supervisor = PartitionSupervisor::new(
            lease_manager.clone(),
            synchronizer,
            processor,
            HostId::new("host-a"),
            Duration::from_millis(50),
            Duration::from_secs(900),
            test_health(),
        );

        let shutdown = CancellationToken::new();
        let shutdown_clone = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            shutdown_clone.cancel();
        });

        let outcome = supervisor.run(lease, shutdown).await;
        assert_eq!(outcome, SupervisionOutcome::Released);
    }
}
