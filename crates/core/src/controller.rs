//! C6: controller — owns the set of actively-supervised partitions on
//! this host, and decorates supervision outcomes with health events
//! (spec §4.6).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use changefeed_common::ids::PartitionId;
use changefeed_common::model::Lease;

use crate::feed::FeedStoreClient;
use crate::health::{HealthEvent, HealthOperation, HealthSeverity, HealthSink};
use crate::observer::Observer;
use crate::store::LeaseStoreClient;
use crate::supervisor::{PartitionSupervisor, SupervisionOutcome};

/// What happened to a partition this host was supervising, surfaced
/// from [`PartitionController::tick`] for the caller (the bootstrap
/// loop / balancer) to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    /// The lease is free again; available for rebalancing.
    Released(PartitionId),
    /// The partition split. `children` already have their own leases
    /// and are not yet supervised by anyone.
    Split { parent: PartitionId, children: Vec<Lease> },
    /// Unrecoverable; escalated as a health event and surfaced here so
    /// the host can decide whether to keep running.
    Fatal { partition_id: PartitionId, message: String },
}

/// Owns the in-flight supervision task per partition this host
/// currently holds a lease for.
pub struct PartitionController<C: LeaseStoreClient, F: FeedStoreClient, O: Observer> {
    supervisor: Arc<PartitionSupervisor<C, F, O>>,
    health: Arc<dyn HealthSink>,
    shutdown: CancellationToken,
    tasks: JoinSet<(PartitionId, SupervisionOutcome)>,
    cancels: HashMap<PartitionId, CancellationToken>,
}

impl<C: LeaseStoreClient, F: FeedStoreClient, O: Observer> PartitionController<C, F, O> {
    pub fn new(supervisor: Arc<PartitionSupervisor<C, F, O>>, health: Arc<dyn HealthSink>) -> Self {
        Self {
            supervisor,
            health,
            shutdown: CancellationToken::new(),
            tasks: JoinSet::new(),
            cancels: HashMap::new(),
        }
    }

    /// Start supervising `lease`. No-op if this partition is already
    /// owned by this controller.
    pub fn add(&mut self, lease: Lease) {
        let partition_id = lease.partition_id.clone();
        if self.cancels.contains_key(&partition_id) {
            return;
        }
        let cancel = self.shutdown.child_token();
        self.cancels.insert(partition_id.clone(), cancel.clone());
        let supervisor = self.supervisor.clone();
        self.tasks.spawn(async move {
            let outcome = supervisor.run(lease, cancel).await;
            (partition_id, outcome)
        });
    }

    /// Signal the supervisor for `partition_id` to stop. The eventual
    /// [`ControllerEvent`] is observed on a later `tick`.
    pub fn remove(&mut self, partition_id: &PartitionId) {
        if let Some(cancel) = self.cancels.remove(partition_id) {
            cancel.cancel();
        }
    }

    /// Partitions this controller currently believes it owns (a task is
    /// running or has not yet been drained).
    pub fn owned_partitions(&self) -> Vec<PartitionId> {
        self.cancels.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.cancels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cancels.is_empty()
    }

    /// Drain every supervision task that has finished since the last
    /// call, translating outcomes into events and emitting health
    /// events for fatal ones. Never blocks.
    pub fn tick(&mut self) -> Vec<ControllerEvent> {
        let mut events = Vec::new();
        while let Some(result) = self.tasks.try_join_next() {
            let (partition_id, outcome) =
                result.expect("supervised partition task panicked");
            self.cancels.remove(&partition_id);
            events.push(self.translate(partition_id, outcome));
        }
        events
    }

    /// Cancel every running supervisor and wait for all of them to stop.
    pub async fn shutdown(mut self) -> Vec<ControllerEvent> {
        self.shutdown.cancel();
        let mut events = Vec::new();
        while let Some(result) = self.tasks.join_next().await {
            let (partition_id, outcome) = result.expect("supervised partition task panicked");
            events.push(self.translate(partition_id, outcome));
        }
        events
    }

    fn translate(&self, partition_id: PartitionId, outcome: SupervisionOutcome) -> ControllerEvent {
        match outcome {
            SupervisionOutcome::Released => ControllerEvent::Released(partition_id),
            SupervisionOutcome::Split { children } => {
                ControllerEvent::Split { parent: partition_id, children }
            }
            SupervisionOutcome::AcquireFailed(message) => {
                self.health.record(HealthEvent {
                    severity: HealthSeverity::Warning,
                    operation: HealthOperation::AcquireLeaseFailure,
                    partition_id: Some(partition_id.clone()),
                    message: message.clone(),
                });
                warn!(partition_id = %partition_id, %message, "failed to acquire lease for supervised partition");
                ControllerEvent::Fatal { partition_id, message }
            }
            SupervisionOutcome::ReleaseFailed(message) => {
                self.health.record(HealthEvent {
                    severity: HealthSeverity::Warning,
                    operation: HealthOperation::ReleaseLeaseFailure,
                    partition_id: Some(partition_id.clone()),
                    message: message.clone(),
                });
                warn!(partition_id = %partition_id, %message, "failed to release lease for supervised partition");
                ControllerEvent::Fatal { partition_id, message }
            }
            SupervisionOutcome::Fatal(message) => {
                self.health.record(HealthEvent {
                    severity: HealthSeverity::Error,
                    operation: HealthOperation::General,
                    partition_id: Some(partition_id.clone()),
                    message: message.clone(),
                });
                warn!(partition_id = %partition_id, %message, "partition supervision failed fatally");
                ControllerEvent::Fatal { partition_id, message }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use changefeed_common::config::ProcessorConfig;
    use changefeed_common::ids::HostId;
    use changefeed_memstore::{CountingObserver, InMemoryFeedStore, InMemoryLeaseStore};
    use std::time::Duration;

    use crate::lease_manager::{CreateOutcome, LeaseManager};
    use crate::processor::PartitionProcessor;
    use crate::sync::PartitionSynchronizer;

    fn config() -> changefeed_common::config::ValidatedConfig {
        ProcessorConfig { lease_prefix: "proc".to_string(), ..Default::default() }.validate().unwrap()
    }

    #[tokio::test]
    async fn shutdown_releases_every_owned_partition() {
        let lease_manager = Arc::new(LeaseManager::new(InMemoryLeaseStore::new(), "proc"));
        let feed = Arc::new(InMemoryFeedStore::idle("p-0"));
        let synchronizer = Arc::new(PartitionSynchronizer::new(feed.clone()));
        let observer = Arc::new(CountingObserver::default());
        let processor = Arc::new(PartitionProcessor::new(feed, observer, &config()));
        let health: Arc<dyn HealthSink> = Arc::new(crate::health::TracingHealthSink::new(Duration::from_secs(900)));
        let supervisor = Arc::new(PartitionSupervisor::new(
            lease_manager.clone(),
            synchronizer,
            processor,
            HostId::new("host-a"),
            Duration::from_millis(50),
            Duration::from_secs(900),
            health.clone(),
        ));

        let mut controller = PartitionController::new(supervisor, health);

        let CreateOutcome::Created(lease) = lease_manager
            .create_if_absent(changefeed_common::ids::PartitionId::new("p-0"), Default::default())
            .await
            .unwrap()
        else {
            panic!("expected Created");
        };

        controller.add(lease);
        assert_eq!(controller.len(), 1);

        let events = controller.shutdown().await;
        assert_eq!(events, vec![ControllerEvent::Released(changefeed_common::ids::PartitionId::new("p-0"))]);
    }
}
