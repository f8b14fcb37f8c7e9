//! C9: health monitor. Consumes `(severity, operation, partition_id,
//! error)` records, classifies fatal vs transient, and suppresses
//! repeated noise. Not on the data path (spec §4.9) — `record` is
//! synchronous and must not block.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use changefeed_common::ids::PartitionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthSeverity {
    Info,
    Warning,
    Error,
}

/// The operation a health event is about. Mirrors the controller
/// operations named in spec §4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthOperation {
    AcquireLeaseFailure,
    ReleaseLeaseFailure,
    Observer,
    General,
}

#[derive(Debug, Clone)]
pub struct HealthEvent {
    pub severity: HealthSeverity,
    pub operation: HealthOperation,
    pub partition_id: Option<PartitionId>,
    pub message: String,
}

/// Sink for health events. Implementations must not panic and must
/// return quickly — this is called from hot paths (renew/acquire
/// failure handling).
pub trait HealthSink: Send + Sync + 'static {
    fn record(&self, event: HealthEvent);
}

/// Default implementation: logs via `tracing`, de-duplicating repeated
/// `(operation, partition_id)` pairs within `unhealthiness_duration` so a
/// partition stuck in a retry loop does not spam the log.
pub struct TracingHealthSink {
    unhealthiness_duration: Duration,
    last_seen: Mutex<HashMap<(HealthOperation, Option<PartitionId>), Instant>>,
}

impl TracingHealthSink {
    pub fn new(unhealthiness_duration: Duration) -> Self {
        Self { unhealthiness_duration, last_seen: Mutex::new(HashMap::new()) }
    }

    fn should_emit(&self, key: &(HealthOperation, Option<PartitionId>)) -> bool {
        let now = Instant::now();
        let mut guard = self.last_seen.lock().expect("health sink lock poisoned");
        match guard.get(key) {
            Some(last) if now.duration_since(*last) < self.unhealthiness_duration => false,
            _ => {
                guard.insert(key.clone(), now);
                true
            }
        }
    }
}

impl HealthSink for TracingHealthSink {
    fn record(&self, event: HealthEvent) {
        let key = (event.operation, event.partition_id.clone());
        if !self.should_emit(&key) {
            return;
        }
        match event.severity {
            HealthSeverity::Info => {
                tracing::info!(operation = ?event.operation, partition_id = ?event.partition_id, "{}", event.message)
            }
            HealthSeverity::Warning => {
                tracing::warn!(operation = ?event.operation, partition_id = ?event.partition_id, "{}", event.message)
            }
            HealthSeverity::Error => {
                tracing::error!(operation = ?event.operation, partition_id = ?event.partition_id, "{}", event.message)
            }
        }
    }
}
