//! The user-supplied observer (spec §6). `open` and `close` are invoked
//! exactly once each, in that order, and never reentrantly for the same
//! partition (spec §4.5); `process_changes` invocations for one
//! partition are strictly serial (spec §5).

use std::fmt;
use std::future::Future;

use tokio_util::sync::CancellationToken;

use changefeed_common::ids::PartitionId;
use changefeed_common::model::ChangeRecord;

/// Why a partition's observer was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Controller/supervisor shutdown (including host shutdown).
    Shutdown,
    /// Another host now owns this partition.
    LeaseLost,
    /// The partition split; children have their own leases.
    Split,
    /// The observer itself failed and the lease was released for retry.
    ObserverFailed,
}

/// Read-only context handed to every observer callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionContext {
    pub partition_id: PartitionId,
}

/// Opaque observer failure. The processor does not interpret the reason;
/// it only needs to know that `process_changes` did not succeed.
#[derive(Debug, Clone)]
pub struct ObserverError(pub String);

impl fmt::Display for ObserverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer error: {}", self.0)
    }
}

impl std::error::Error for ObserverError {}

/// User-supplied callback surface.
pub trait Observer: Send + Sync + 'static {
    /// Called once, before the first batch is dispatched.
    fn open(&self, ctx: &PartitionContext) -> impl Future<Output = ()> + Send;

    /// Called once per batch, strictly serially per partition. An `Err`
    /// stops the processor with `ProcessorExit::ObserverFailed`; the
    /// batch is redelivered (at-least-once) when the lease is picked up
    /// again, since the checkpoint only advances after success.
    fn process_changes(
        &self,
        ctx: &PartitionContext,
        batch: Vec<ChangeRecord>,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<(), ObserverError>> + Send;

    /// Called exactly once, after the processor has stopped.
    fn close(&self, ctx: &PartitionContext, reason: CloseReason) -> impl Future<Output = ()> + Send;
}
