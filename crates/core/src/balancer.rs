//! C7: load balancer — periodically decides which partitions this host
//! should acquire or give up so the fleet converges on an equal split
//! (spec §4.7).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use changefeed_common::ids::{HostId, PartitionId};
use changefeed_common::model::Lease;

use crate::error::LeaseManagerError;
use crate::lease_manager::LeaseManager;
use crate::store::LeaseStoreClient;

/// What a load-balancing tick decided `host` should do: acquire these
/// partitions, give up those. Either side may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BalancePlan {
    pub acquire: Vec<PartitionId>,
    pub release: Vec<PartitionId>,
}

/// Decides, given the full set of leases, which partitions `host` should
/// try to acquire or release next.
pub trait LoadBalancingStrategy: Send + Sync + 'static {
    fn plan(
        &self,
        all_leases: &[Lease],
        host: &HostId,
        now: DateTime<Utc>,
        lease_expiration_interval: Duration,
        min_partition_count: usize,
        max_partition_count: usize,
    ) -> BalancePlan;
}

/// Targets `ceil(partition_count / active_host_count)` leases per host,
/// clamped to `[min_partition_count, max_partition_count]`. Ties are
/// broken deterministically so two hosts computing the same snapshot
/// never both grab the same partition on purpose: unowned leases are
/// preferred over expired ones, expired leases are stolen from the
/// most-loaded owner first, and any remaining tie is broken by partition
/// id. When this host already holds more than its target, it gives up
/// its oldest-renewed leases first so the freed capacity is the
/// least-fresh work in flight.
pub struct EqualPartitionsStrategy;

impl EqualPartitionsStrategy {
    fn target_share(
        all_leases: &[Lease],
        host: &HostId,
        load: &BTreeMap<HostId, usize>,
        min_partition_count: usize,
        max_partition_count: usize,
    ) -> usize {
        let mut active_hosts: std::collections::BTreeSet<HostId> = load.keys().cloned().collect();
        active_hosts.insert(host.clone());
        let even_share = all_leases.len().div_ceil(active_hosts.len());
        even_share.clamp(min_partition_count, max_partition_count.max(min_partition_count))
    }
}

impl LoadBalancingStrategy for EqualPartitionsStrategy {
    fn plan(
        &self,
        all_leases: &[Lease],
        host: &HostId,
        now: DateTime<Utc>,
        lease_expiration_interval: Duration,
        min_partition_count: usize,
        max_partition_count: usize,
    ) -> BalancePlan {
        if all_leases.is_empty() {
            return BalancePlan::default();
        }

        let mut load: BTreeMap<HostId, usize> = BTreeMap::new();
        for lease in all_leases {
            if lease.is_owned(now, lease_expiration_interval) {
                *load.entry(lease.owner.clone().expect("is_owned implies owner")).or_insert(0) += 1;
            }
        }

        let target =
            Self::target_share(all_leases, host, &load, min_partition_count, max_partition_count);

        let mut owned_by_self: Vec<&Lease> = all_leases
            .iter()
            .filter(|lease| {
                lease.owner.as_ref() == Some(host) && lease.is_owned(now, lease_expiration_interval)
            })
            .collect();

        if owned_by_self.len() > target {
            let surplus = owned_by_self.len() - target;
            owned_by_self.sort_by_key(|lease| lease.timestamp);
            let release = owned_by_self
                .into_iter()
                .take(surplus)
                .map(|lease| lease.partition_id.clone())
                .collect();
            return BalancePlan { acquire: Vec::new(), release };
        }

        let deficit = target - owned_by_self.len();
        if deficit == 0 {
            return BalancePlan::default();
        }

        let mut candidates: Vec<&Lease> = all_leases
            .iter()
            .filter(|lease| {
                lease.owner.as_ref() != Some(host) && !lease.is_owned(now, lease_expiration_interval)
            })
            .collect();

        candidates.sort_by(|a, b| {
            let a_unowned = a.owner.is_none();
            let b_unowned = b.owner.is_none();
            let a_load = a.owner.as_ref().and_then(|o| load.get(o)).copied().unwrap_or(0);
            let b_load = b.owner.as_ref().and_then(|o| load.get(o)).copied().unwrap_or(0);
            b_unowned
                .cmp(&a_unowned)
                .then(b_load.cmp(&a_load))
                .then(a.partition_id.cmp(&b.partition_id))
        });

        let acquire =
            candidates.into_iter().take(deficit).map(|lease| lease.partition_id.clone()).collect();
        BalancePlan { acquire, release: Vec::new() }
    }
}

/// What one balancing tick resolved to: leases newly acquired (ready to
/// hand to the controller via `add`) and partitions this host should
/// give up (ready to hand to the controller via `remove`).
#[derive(Debug, Clone, Default)]
pub struct BalanceOutcome {
    pub acquired: Vec<Lease>,
    pub released: Vec<PartitionId>,
}

/// Drives [`LoadBalancingStrategy`] against the live lease collection.
/// Caller is responsible for invoking [`BalancerTick::run`] on
/// `lease_acquire_interval` and handing the outcome to the controller
/// (C6).
pub struct BalancerTick<C: LeaseStoreClient> {
    lease_manager: Arc<LeaseManager<C>>,
    strategy: Arc<dyn LoadBalancingStrategy>,
    host: HostId,
    lease_expiration_interval: Duration,
    min_partition_count: usize,
    max_partition_count: usize,
    max_acquires_per_tick: usize,
}

impl<C: LeaseStoreClient> BalancerTick<C> {
    pub fn new(
        lease_manager: Arc<LeaseManager<C>>,
        strategy: Arc<dyn LoadBalancingStrategy>,
        host: HostId,
        lease_expiration_interval: Duration,
        min_partition_count: usize,
        max_partition_count: usize,
        max_acquires_per_tick: usize,
    ) -> Self {
        Self {
            lease_manager,
            strategy,
            host,
            lease_expiration_interval,
            min_partition_count,
            max_partition_count,
            max_acquires_per_tick,
        }
    }

    /// One balancing pass: acquire as many selected partitions as
    /// `max_acquires_per_tick` allows (skipping ones lost to a racing
    /// host in the meantime) and report which partitions this host
    /// should release.
    pub async fn run(&self) -> Result<BalanceOutcome, LeaseManagerError> {
        let now = Utc::now();
        let all_leases = self.lease_manager.list_all().await?;
        let plan = self.strategy.plan(
            &all_leases,
            &self.host,
            now,
            self.lease_expiration_interval,
            self.min_partition_count,
            self.max_partition_count,
        );

        let mut acquired = Vec::new();
        for partition_id in plan.acquire.into_iter().take(self.max_acquires_per_tick) {
            let Some(lease) = all_leases.iter().find(|l| l.partition_id == partition_id) else {
                continue;
            };
            match self.lease_manager.acquire(lease, &self.host).await {
                Ok(lease) => acquired.push(lease),
                Err(LeaseManagerError::LeaseLost) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(BalanceOutcome { acquired, released: plan.release })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use changefeed_common::ids::Etag;
    use std::collections::BTreeMap as Properties;

    fn lease(partition_id: &str, owner: Option<&str>, timestamp: DateTime<Utc>) -> Lease {
        Lease {
            partition_id: PartitionId::new(partition_id),
            owner: owner.map(HostId::new),
            continuation_token: Default::default(),
            timestamp,
            properties: Properties::new(),
            etag: Etag::new("e"),
        }
    }

    const NO_BOUNDS: (usize, usize) = (0, usize::MAX);

    #[test]
    fn unowned_partitions_are_preferred_over_stealing() {
        let now = Utc::now();
        let leases = vec![lease("p-0", Some("host-a"), now), lease("p-1", None, now)];
        let plan = EqualPartitionsStrategy.plan(
            &leases,
            &HostId::new("host-b"),
            now,
            Duration::from_secs(60),
            NO_BOUNDS.0,
            NO_BOUNDS.1,
        );
        assert_eq!(plan.acquire, vec![PartitionId::new("p-1")]);
        assert!(plan.release.is_empty());
    }

    #[test]
    fn balanced_fleet_does_nothing() {
        let now = Utc::now();
        let leases = vec![lease("p-0", Some("host-a"), now), lease("p-1", Some("host-b"), now)];
        let plan = EqualPartitionsStrategy.plan(
            &leases,
            &HostId::new("host-a"),
            now,
            Duration::from_secs(60),
            NO_BOUNDS.0,
            NO_BOUNDS.1,
        );
        assert_eq!(plan, BalancePlan::default());
    }

    #[test]
    fn expired_lease_is_stolen_from_the_busiest_host() {
        let now = Utc::now();
        let stale = now - chrono::Duration::seconds(120);
        let leases = vec![
            lease("p-0", Some("host-a"), stale),
            lease("p-1", Some("host-a"), now),
            lease("p-2", Some("host-b"), now),
        ];
        let plan = EqualPartitionsStrategy.plan(
            &leases,
            &HostId::new("host-c"),
            now,
            Duration::from_secs(60),
            NO_BOUNDS.0,
            NO_BOUNDS.1,
        );
        assert_eq!(plan.acquire, vec![PartitionId::new("p-0")]);
    }

    #[test]
    fn ties_break_by_partition_id() {
        let now = Utc::now();
        let leases = vec![lease("p-1", None, now), lease("p-0", None, now)];
        let plan = EqualPartitionsStrategy.plan(
            &leases,
            &HostId::new("host-a"),
            now,
            Duration::from_secs(60),
            NO_BOUNDS.0,
            NO_BOUNDS.1,
        );
        assert_eq!(plan.acquire[0], PartitionId::new("p-0"));
    }

    #[test]
    fn max_partition_count_bounds_acquisition() {
        let now = Utc::now();
        let leases =
            vec![lease("p-0", None, now), lease("p-1", None, now), lease("p-2", None, now)];
        let plan = EqualPartitionsStrategy.plan(
            &leases,
            &HostId::new("host-a"),
            now,
            Duration::from_secs(60),
            0,
            2,
        );
        assert_eq!(plan.acquire.len(), 2);
    }

    #[test]
    fn over_max_partition_count_releases_the_oldest_leases_first() {
        let now = Utc::now();
        let old = now - chrono::Duration::seconds(5);
        let leases = vec![
            lease("p-0", Some("host-a"), old),
            lease("p-1", Some("host-a"), now),
            lease("p-2", Some("host-a"), now),
        ];
        let plan = EqualPartitionsStrategy.plan(
            &leases,
            &HostId::new("host-a"),
            now,
            Duration::from_secs(60),
            0,
            1,
        );
        assert_eq!(plan.acquire, Vec::new());
        assert_eq!(plan.release, vec![PartitionId::new("p-0")]);
    }

    #[test]
    fn min_partition_count_acquires_even_when_evenly_shared() {
        let now = Utc::now();
        let leases = vec![
            lease("p-0", Some("host-a"), now),
            lease("p-1", Some("host-b"), now),
            lease("p-2", None, now),
            lease("p-3", None, now),
        ];
        let plan = EqualPartitionsStrategy.plan(
            &leases,
            &HostId::new("host-a"),
            now,
            Duration::from_secs(60),
            3,
            usize::MAX,
        );
        assert_eq!(plan.acquire.len(), 2);
    }
}
