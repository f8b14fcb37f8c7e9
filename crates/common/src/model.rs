//! The data model from spec §3: partitions, change records, and leases.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::ids::{ContinuationToken, Etag, HostId, PartitionId};

/// A partition's key range: inclusive `min`, exclusive `max`, over
/// whatever hash or token space the monitored store uses. Splits replace
/// one parent range with two or more children that exactly cover it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRange {
    pub partition_id: PartitionId,
    pub min: String,
    pub max: String,
}

/// A single change document plus the cursor that resumes immediately
/// after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    pub payload: Vec<u8>,
    pub continuation_token: ContinuationToken,
}

/// A durable lease record, uniquely keyed by `(lease_prefix, partition_id)`.
///
/// See spec invariants 1–4: ownership is derived from `owner` and
/// `timestamp`, never stored as a separate boolean, so [`Lease::is_owned`]
/// is the single source of truth every component must use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub partition_id: PartitionId,
    pub owner: Option<HostId>,
    pub continuation_token: ContinuationToken,
    pub timestamp: DateTime<Utc>,
    pub properties: BTreeMap<String, String>,
    pub etag: Etag,
}

impl Lease {
    /// `owner != None` and the lease has not crossed `expiration`.
    pub fn is_owned(&self, now: DateTime<Utc>, expiration: Duration) -> bool {
        self.owner.is_some() && !self.is_expired(now, expiration)
    }

    /// `now - timestamp >= expiration`. A lease with no owner is always
    /// considered expired (there is nothing to steal from).
    pub fn is_expired(&self, now: DateTime<Utc>, expiration: Duration) -> bool {
        if self.owner.is_none() {
            return true;
        }
        let age = now.signed_duration_since(self.timestamp);
        match chrono::Duration::from_std(expiration) {
            Ok(expiration) => age >= expiration,
            Err(_) => true,
        }
    }

    /// Ownable by `host`: either unowned/expired, or already owned by
    /// `host` (the acquire-retry-once case in spec §4.2).
    pub fn is_ownable_by(&self, host: &HostId, now: DateTime<Utc>, expiration: Duration) -> bool {
        match &self.owner {
            None => true,
            Some(owner) => owner == host || self.is_expired(now, expiration),
        }
    }
}

/// How often the processor (C4) advances the lease's `continuation_token`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFrequency {
    /// Checkpoint after every acknowledged batch.
    EveryBatch,
    /// Checkpoint after every `n`th acknowledged batch.
    EveryNBatches(u32),
    /// Checkpoint at most once per interval, on the next acknowledged
    /// batch after the interval elapses.
    EveryInterval(Duration),
    /// Never checkpoint automatically; the observer is expected to do it
    /// out of band. The processor still tracks the latest acknowledged
    /// token in memory so a later automatic checkpoint (e.g. on exit)
    /// has a token to use.
    Manual,
}

impl Default for CheckpointFrequency {
    fn default() -> Self {
        Self::EveryBatch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn lease_owned_at(owner: Option<&str>, timestamp: DateTime<Utc>) -> Lease {
        Lease {
            partition_id: PartitionId::new("p-0"),
            owner: owner.map(HostId::new),
            continuation_token: ContinuationToken::empty(),
            timestamp,
            properties: BTreeMap::new(),
            etag: Etag::new("etag-0"),
        }
    }

    #[test]
    fn unowned_lease_is_always_expired() {
        let lease = lease_owned_at(None, Utc::now());
        assert!(lease.is_expired(Utc::now(), StdDuration::from_secs(60)));
        assert!(!lease.is_owned(Utc::now(), StdDuration::from_secs(60)));
    }

    #[test]
    fn fresh_lease_is_owned_until_expiration_elapses() {
        let now = Utc::now();
        let lease = lease_owned_at(Some("host-a"), now);
        assert!(lease.is_owned(now, StdDuration::from_secs(60)));

        let later = now + chrono::Duration::seconds(61);
        assert!(!lease.is_owned(later, StdDuration::from_secs(60)));
        assert!(lease.is_expired(later, StdDuration::from_secs(60)));
    }

    #[test]
    fn expired_lease_is_ownable_by_any_host() {
        let now = Utc::now();
        let lease = lease_owned_at(Some("host-a"), now - chrono::Duration::seconds(120));
        assert!(lease.is_ownable_by(&HostId::new("host-b"), now, StdDuration::from_secs(60)));
    }

    #[test]
    fn live_lease_is_only_ownable_by_current_owner() {
        let now = Utc::now();
        let lease = lease_owned_at(Some("host-a"), now);
        assert!(lease.is_ownable_by(&HostId::new("host-a"), now, StdDuration::from_secs(60)));
        assert!(!lease.is_ownable_by(&HostId::new("host-b"), now, StdDuration::from_secs(60)));
    }
}
