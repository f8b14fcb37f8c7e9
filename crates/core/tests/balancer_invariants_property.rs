//! Randomized fleet snapshots fed through `EqualPartitionsStrategy::plan`,
//! checking invariants the unit tests in `balancer.rs` only sample a
//! handful of fixed cases for.

use std::collections::BTreeMap;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use proptest::prelude::*;

use changefeed_common::ids::{Etag, HostId, PartitionId};
use changefeed_common::model::Lease;
use changefeed_core::balancer::{EqualPartitionsStrategy, LoadBalancingStrategy};

const HOSTS: &[&str] = &["host-a", "host-b", "host-c", "host-d"];
const EXPIRATION: StdDuration = StdDuration::from_secs(60);

fn lease_strategy(partition_index: usize) -> impl Strategy<Value = (usize, Option<usize>, i64)> {
    (
        Just(partition_index),
        proptest::option::of(0..HOSTS.len()),
        -120i64..120,
    )
}

fn fleet_strategy(partition_count: usize) -> impl Strategy<Value = Vec<(usize, Option<usize>, i64)>> {
    (0..partition_count).map(lease_strategy).collect::<Vec<_>>()
}

fn build_leases(raw: &[(usize, Option<usize>, i64)], now: DateTime<Utc>) -> Vec<Lease> {
    raw.iter()
        .map(|&(partition_index, owner_index, age_seconds)| Lease {
            partition_id: PartitionId::new(format!("p-{partition_index}")),
            owner: owner_index.map(|idx| HostId::new(HOSTS[idx])),
            continuation_token: Default::default(),
            timestamp: now - chrono::Duration::seconds(age_seconds),
            properties: BTreeMap::new(),
            etag: Etag::new("e"),
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 256, .. ProptestConfig::default() })]

    /// A plan never tells the host to both acquire and release the same
    /// partition in the same tick.
    #[test]
    fn acquire_and_release_never_overlap(
        raw in fleet_strategy(6),
        host_index in 0..HOSTS.len(),
        min_partition_count in 0usize..4,
        max_spread in 0usize..6,
    ) {
        let now = Utc::now();
        let leases = build_leases(&raw, now);
        let host = HostId::new(HOSTS[host_index]);
        let max_partition_count = min_partition_count + max_spread;

        let plan = EqualPartitionsStrategy.plan(
            &leases, &host, now, EXPIRATION, min_partition_count, max_partition_count,
        );

        for acquired in &plan.acquire {
            prop_assert!(!plan.release.contains(acquired));
        }
    }

    /// The plan never recommends acquiring a partition the host already
    /// owns live, and never recommends releasing one it doesn't.
    #[test]
    fn plan_only_touches_partitions_consistent_with_current_ownership(
        raw in fleet_strategy(6),
        host_index in 0..HOSTS.len(),
        min_partition_count in 0usize..4,
        max_spread in 0usize..6,
    ) {
        let now = Utc::now();
        let leases = build_leases(&raw, now);
        let host = HostId::new(HOSTS[host_index]);
        let max_partition_count = min_partition_count + max_spread;

        let plan = EqualPartitionsStrategy.plan(
            &leases, &host, now, EXPIRATION, min_partition_count, max_partition_count,
        );

        let owned_by_host: Vec<&PartitionId> = leases
            .iter()
            .filter(|lease| lease.owner.as_ref() == Some(&host) && lease.is_owned(now, EXPIRATION))
            .map(|lease| &lease.partition_id)
            .collect();

        for acquired in &plan.acquire {
            prop_assert!(!owned_by_host.contains(&acquired));
        }
        for released in &plan.release {
            prop_assert!(owned_by_host.contains(&released));
        }
    }

    /// Calling `plan` twice on the same snapshot is deterministic: no
    /// hidden clock or hash-order dependency leaks into the decision.
    #[test]
    fn plan_is_deterministic(
        raw in fleet_strategy(8),
        host_index in 0..HOSTS.len(),
        min_partition_count in 0usize..4,
        max_spread in 0usize..6,
    ) {
        let now = Utc::now();
        let leases = build_leases(&raw, now);
        let host = HostId::new(HOSTS[host_index]);
        let max_partition_count = min_partition_count + max_spread;

        let first = EqualPartitionsStrategy.plan(
            &leases, &host, now, EXPIRATION, min_partition_count, max_partition_count,
        );
        let second = EqualPartitionsStrategy.plan(
            &leases, &host, now, EXPIRATION, min_partition_count, max_partition_count,
        );

        prop_assert_eq!(first, second);
    }

    /// A host already at or above its target share is never told to
    /// acquire more partitions.
    #[test]
    fn never_acquires_past_an_already_met_target(
        raw in fleet_strategy(6),
        host_index in 0..HOSTS.len(),
        max_partition_count in 1usize..4,
    ) {
        let now = Utc::now();
        let leases = build_leases(&raw, now);
        let host = HostId::new(HOSTS[host_index]);

        let owned_by_host = leases
            .iter()
            .filter(|lease| lease.owner.as_ref() == Some(&host) && lease.is_owned(now, EXPIRATION))
            .count();

        let plan = EqualPartitionsStrategy.plan(
            &leases, &host, now, EXPIRATION, 0, max_partition_count,
        );

        if owned_by_host >= max_partition_count {
            prop_assert!(plan.acquire.is_empty());
        }
    }
}
