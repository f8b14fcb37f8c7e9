//! Typed processor configuration.
//!
//! Per REDESIGN FLAG #1 in SPEC_FULL.md: one constructor, `validate`,
//! which collects every invalid/missing field and fails once with the
//! complete list, instead of a mutator-chain builder with nullable
//! fields discovered one at a time.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::ContinuationToken;

/// Seed for a newly created lease's `continuation_token` (spec §6:
/// `StartFromBeginning` / `StartTime` / `StartContinuation`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitialCheckpoint {
    /// Start from the beginning of the feed (empty continuation token).
    Beginning,
    /// Start from a server-assigned point in time.
    Time(DateTime<Utc>),
    /// Start from a caller-supplied continuation token.
    Continuation(ContinuationToken),
}

impl Default for InitialCheckpoint {
    fn default() -> Self {
        Self::Beginning
    }
}

/// How often the processor (C4) advances the checkpointed token.
pub use crate::model::CheckpointFrequency;

/// Raw, user-facing configuration. Every field has a sane default except
/// `lease_prefix`, which must be set explicitly — it namespaces leases
/// across logical processors sharing one lease collection.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub lease_prefix: String,
    pub lease_expiration_interval: Duration,
    pub lease_renew_interval: Duration,
    pub lease_acquire_interval: Duration,
    pub min_partition_count: usize,
    pub max_partition_count: usize,
    pub feed_poll_delay: Duration,
    pub max_item_count: u32,
    pub initial_checkpoint: InitialCheckpoint,
    pub checkpoint_frequency: CheckpointFrequency,
    pub degree_of_parallelism: usize,
    pub query_partitions_max_batch_size: usize,
    pub unhealthiness_duration: Duration,
    pub bootstrap_lock_ttl: Duration,
    pub bootstrap_retry_delay: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            lease_prefix: String::new(),
            lease_expiration_interval: Duration::from_secs(60),
            lease_renew_interval: Duration::from_secs(17),
            lease_acquire_interval: Duration::from_secs(13),
            min_partition_count: 0,
            max_partition_count: usize::MAX,
            feed_poll_delay: Duration::from_millis(500),
            max_item_count: 100,
            initial_checkpoint: InitialCheckpoint::Beginning,
            checkpoint_frequency: CheckpointFrequency::EveryBatch,
            degree_of_parallelism: 8,
            query_partitions_max_batch_size: 100,
            unhealthiness_duration: Duration::from_secs(15 * 60),
            bootstrap_lock_ttl: Duration::from_secs(30),
            bootstrap_retry_delay: Duration::from_secs(1),
        }
    }
}

/// A `ProcessorConfig` that has passed [`ProcessorConfig::validate`].
/// Components take this type, never the raw config, so an unvalidated
/// config cannot reach them.
#[derive(Debug, Clone)]
pub struct ValidatedConfig(ProcessorConfig);

impl ValidatedConfig {
    pub fn get(&self) -> &ProcessorConfig {
        &self.0
    }
}

impl std::ops::Deref for ValidatedConfig {
    type Target = ProcessorConfig;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration: {0:?}")]
    InvalidConfiguration(Vec<String>),
    #[error("config I/O error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    Parse(String),
}

/// TOML-friendly mirror of [`ProcessorConfig`]'s scalar fields. Durations
/// are seconds/millis rather than `Duration` so the file stays readable;
/// `initial_checkpoint` and `checkpoint_frequency` carry run-specific
/// state and are left to the caller to set in code after loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfigToml {
    pub lease_prefix: String,
    pub lease_expiration_interval_secs: u64,
    pub lease_renew_interval_secs: u64,
    pub lease_acquire_interval_secs: u64,
    pub min_partition_count: usize,
    pub max_partition_count: usize,
    pub feed_poll_delay_millis: u64,
    pub max_item_count: u32,
    pub degree_of_parallelism: usize,
    pub query_partitions_max_batch_size: usize,
    pub unhealthiness_duration_secs: u64,
    pub bootstrap_lock_ttl_secs: u64,
    pub bootstrap_retry_delay_secs: u64,
}

impl Default for ProcessorConfigToml {
    fn default() -> Self {
        ProcessorConfig::default().into()
    }
}

impl From<ProcessorConfig> for ProcessorConfigToml {
    fn from(config: ProcessorConfig) -> Self {
        Self {
            lease_prefix: config.lease_prefix,
            lease_expiration_interval_secs: config.lease_expiration_interval.as_secs(),
            lease_renew_interval_secs: config.lease_renew_interval.as_secs(),
            lease_acquire_interval_secs: config.lease_acquire_interval.as_secs(),
            min_partition_count: config.min_partition_count,
            max_partition_count: config.max_partition_count,
            feed_poll_delay_millis: config.feed_poll_delay.as_millis() as u64,
            max_item_count: config.max_item_count,
            degree_of_parallelism: config.degree_of_parallelism,
            query_partitions_max_batch_size: config.query_partitions_max_batch_size,
            unhealthiness_duration_secs: config.unhealthiness_duration.as_secs(),
            bootstrap_lock_ttl_secs: config.bootstrap_lock_ttl.as_secs(),
            bootstrap_retry_delay_secs: config.bootstrap_retry_delay.as_secs(),
        }
    }
}

impl From<ProcessorConfigToml> for ProcessorConfig {
    fn from(raw: ProcessorConfigToml) -> Self {
        Self {
            lease_prefix: raw.lease_prefix,
            lease_expiration_interval: Duration::from_secs(raw.lease_expiration_interval_secs),
            lease_renew_interval: Duration::from_secs(raw.lease_renew_interval_secs),
            lease_acquire_interval: Duration::from_secs(raw.lease_acquire_interval_secs),
            min_partition_count: raw.min_partition_count,
            max_partition_count: raw.max_partition_count,
            feed_poll_delay: Duration::from_millis(raw.feed_poll_delay_millis),
            max_item_count: raw.max_item_count,
            initial_checkpoint: InitialCheckpoint::default(),
            checkpoint_frequency: CheckpointFrequency::default(),
            degree_of_parallelism: raw.degree_of_parallelism,
            query_partitions_max_batch_size: raw.query_partitions_max_batch_size,
            unhealthiness_duration: Duration::from_secs(raw.unhealthiness_duration_secs),
            bootstrap_lock_ttl: Duration::from_secs(raw.bootstrap_lock_ttl_secs),
            bootstrap_retry_delay: Duration::from_secs(raw.bootstrap_retry_delay_secs),
        }
    }
}

impl ProcessorConfig {
    /// Load from a TOML file, falling back to [`ProcessorConfig::default`]
    /// for any field the file omits.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|err| ConfigError::Io(err.to_string()))?;
        let raw: ProcessorConfigToml =
            toml::from_str(&contents).map_err(|err| ConfigError::Parse(err.to_string()))?;
        Ok(raw.into())
    }

    /// Save to a TOML file, creating parent directories as needed.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| ConfigError::Io(err.to_string()))?;
        }
        let raw: ProcessorConfigToml = self.clone().into();
        let contents = toml::to_string_pretty(&raw).map_err(|err| ConfigError::Parse(err.to_string()))?;
        std::fs::write(path, contents).map_err(|err| ConfigError::Io(err.to_string()))
    }

    /// Validate every field up front, returning all problems at once
    /// rather than failing on the first one encountered.
    pub fn validate(self) -> Result<ValidatedConfig, ConfigError> {
        let mut problems = Vec::new();

        if self.lease_prefix.is_empty() {
            problems.push("lease_prefix must not be empty".to_string());
        } else if !self.lease_prefix.is_ascii() {
            problems.push("lease_prefix must be ASCII".to_string());
        } else if self.lease_prefix.contains('.') {
            problems.push(
                "lease_prefix must not contain '.' (reserved for the .info/.lock singletons)"
                    .to_string(),
            );
        }

        if self.min_partition_count > self.max_partition_count {
            problems.push(format!(
                "min_partition_count ({}) must be <= max_partition_count ({})",
                self.min_partition_count, self.max_partition_count
            ));
        }

        if self.lease_renew_interval >= self.lease_expiration_interval {
            problems.push(format!(
                "lease_renew_interval ({:?}) must be less than lease_expiration_interval ({:?})",
                self.lease_renew_interval, self.lease_expiration_interval
            ));
        }

        if self.degree_of_parallelism == 0 {
            problems.push("degree_of_parallelism must be at least 1".to_string());
        }

        if self.max_item_count == 0 {
            problems.push("max_item_count must be at least 1".to_string());
        }

        if let CheckpointFrequency::EveryNBatches(0) = self.checkpoint_frequency {
            problems.push("checkpoint_frequency every_n_batches(n) requires n >= 1".to_string());
        }

        if !problems.is_empty() {
            return Err(ConfigError::InvalidConfiguration(problems));
        }

        Ok(ValidatedConfig(self))
    }
}
