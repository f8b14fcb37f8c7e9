//! Error taxonomy (spec §7): `Transient`, `LeaseLost`, `ObserverFailed`,
//! `Split`, `Fatal`.

use std::time::Duration;

use rand::Rng;
use thiserror::Error;

use crate::store::LeaseStoreError;

/// Errors surfaced by [`crate::lease_manager::LeaseManager`] operations
/// (spec §4.2).
#[derive(Debug, Error)]
pub enum LeaseManagerError {
    #[error("lease not found")]
    NotFound,
    /// Another host owns this lease now; stop immediately. The sentinel
    /// every caller must handle.
    #[error("lease lost")]
    LeaseLost,
    #[error("transient lease store error: {0}")]
    Transient(String),
    #[error("fatal lease store error: {0}")]
    Fatal(String),
}

impl From<LeaseStoreError> for LeaseManagerError {
    fn from(err: LeaseStoreError) -> Self {
        match err {
            LeaseStoreError::NotFound => Self::NotFound,
            LeaseStoreError::Conflict => Self::LeaseLost,
            LeaseStoreError::Transient(msg) => Self::Transient(msg),
            LeaseStoreError::Fatal(msg) => Self::Fatal(msg),
        }
    }
}

/// Terminal outcome of one [`crate::processor::PartitionProcessor::run`]
/// call (spec §4.4 state machine).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessorExit {
    /// The server reported the partition gone/split.
    Split,
    /// Another host now owns the lease.
    LeaseLost,
    /// The observer returned an error.
    ObserverFailed,
    /// The supervisor cancelled this processor.
    Cancelled,
    /// Unrecoverable; the host should abort.
    Fatal(String),
}

/// Exponential back-off with full jitter, capped at `max_delay`.
///
/// Grounded in the deterministic `backoff_delay` used for the outbox
/// retry queue, generalized with randomized jitter per spec §7 ("retried
/// with exponential back-off and jitter").
pub fn backoff_with_jitter(attempt: u32, base: Duration, max_delay: Duration) -> Duration {
    let exp = attempt.min(16);
    let capped_ms = base.as_millis().saturating_mul(1u128 << exp).min(max_delay.as_millis());
    let capped_ms = capped_ms.min(u64::MAX as u128) as u64;
    if capped_ms == 0 {
        return Duration::ZERO;
    }
    let jittered_ms = rand::thread_rng().gen_range(0..=capped_ms);
    Duration::from_millis(jittered_ms)
}
