//! `changefeed-demo config-show` — prints the effective configuration,
//! either the built-in defaults or a file on disk, for inspection.

use std::path::PathBuf;

use clap::Args;

use changefeed_common::config::{ProcessorConfig, ProcessorConfigToml};

use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct ConfigShowArgs {
    /// Load this file instead of the built-in defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Force JSON output.
    #[arg(long)]
    json: bool,
}

pub async fn run(args: ConfigShowArgs) -> anyhow::Result<()> {
    let format = OutputFormat::detect(args.json);
    let config = match &args.config {
        Some(path) => ProcessorConfig::load_from(path)?,
        None => ProcessorConfig::default(),
    };
    let raw: ProcessorConfigToml = config.into();
    output::print_output(format, &raw, format_human)?;
    Ok(())
}

fn format_human(raw: &ProcessorConfigToml) -> String {
    format!(
        "lease_prefix: {}\n\
         lease_expiration_interval_secs: {}\n\
         lease_renew_interval_secs: {}\n\
         lease_acquire_interval_secs: {}\n\
         min_partition_count: {}\n\
         max_partition_count: {}\n\
         feed_poll_delay_millis: {}\n\
         max_item_count: {}\n\
         degree_of_parallelism: {}\n\
         query_partitions_max_batch_size: {}\n\
         unhealthiness_duration_secs: {}\n\
         bootstrap_lock_ttl_secs: {}\n\
         bootstrap_retry_delay_secs: {}",
        raw.lease_prefix,
        raw.lease_expiration_interval_secs,
        raw.lease_renew_interval_secs,
        raw.lease_acquire_interval_secs,
        raw.min_partition_count,
        raw.max_partition_count,
        raw.feed_poll_delay_millis,
        raw.max_item_count,
        raw.degree_of_parallelism,
        raw.query_partitions_max_batch_size,
        raw.unhealthiness_duration_secs,
        raw.bootstrap_lock_ttl_secs,
        raw.bootstrap_retry_delay_secs,
    )
}
