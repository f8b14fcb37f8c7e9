//! `changefeed-demo run` — drives a simulated fleet of hosts against an
//! in-memory feed and lease collection until every record has been seen
//! or the caller stops it.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use changefeed_common::config::ProcessorConfig;
use changefeed_common::ids::HostId;
use changefeed_core::ChangeFeedProcessor;
use changefeed_memstore::{CountingObserver, InMemoryFeedStore, InMemoryLeaseStore};

use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Number of partitions to simulate.
    #[arg(long, default_value_t = 4)]
    partitions: usize,

    /// Records delivered by each partition.
    #[arg(long, default_value_t = 1000)]
    records_per_partition: usize,

    /// Number of hosts competing for the same partitions.
    #[arg(long, default_value_t = 1)]
    hosts: usize,

    /// Namespace for the leases this run creates.
    #[arg(long, default_value = "demo")]
    lease_prefix: String,

    /// Load processor settings from a TOML file instead of the defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Stop after this many seconds regardless of progress. Without it,
    /// the run stops once every record has been processed or Ctrl-C is
    /// received.
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Force JSON output.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct RunSummary {
    hosts: usize,
    partitions: usize,
    total_records: usize,
    opened: usize,
    processed: usize,
    closed: usize,
    elapsed_ms: u128,
}

async fn wait_for_completion_or_deadline(
    observer: &CountingObserver,
    total: usize,
    deadline: Option<tokio::time::Instant>,
) {
    loop {
        if observer.processed.load(Ordering::SeqCst) >= total {
            return;
        }
        if deadline.is_some_and(|at| tokio::time::Instant::now() >= at) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

pub async fn run(args: RunArgs) -> anyhow::Result<()> {
    let format = OutputFormat::detect(args.json);

    let base_config = match &args.config {
        Some(path) => ProcessorConfig::load_from(path)?,
        None => ProcessorConfig::default(),
    };
    let config = ProcessorConfig { lease_prefix: args.lease_prefix.clone(), ..base_config };

    let partition_specs: Vec<(String, usize)> = (0..args.partitions)
        .map(|i| (format!("p-{i}"), args.records_per_partition))
        .collect();
    let partition_specs_ref: Vec<(&str, usize)> =
        partition_specs.iter().map(|(id, count)| (id.as_str(), *count)).collect();
    let total_records = args.partitions * args.records_per_partition;

    let feed = Arc::new(InMemoryFeedStore::with_partition_totals(&partition_specs_ref));
    let client = InMemoryLeaseStore::new();
    let observer = Arc::new(CountingObserver::default());
    let shutdown = CancellationToken::new();

    let mut handles = Vec::with_capacity(args.hosts);
    for host_index in 0..args.hosts {
        let validated = config.clone().validate()?;
        let processor = ChangeFeedProcessor::new(
            client.clone(),
            feed.clone(),
            observer.clone(),
            HostId::new(format!("host-{host_index}")),
            validated,
        );
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(processor.run(shutdown)));
    }

    let deadline =
        args.duration_secs.map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));
    let start = tokio::time::Instant::now();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
        }
        _ = wait_for_completion_or_deadline(&observer, total_records, deadline) => {}
    }

    shutdown.cancel();
    for handle in handles {
        handle.await.map_err(|err| anyhow::anyhow!("host task panicked: {err}"))??;
    }

    let summary = RunSummary {
        hosts: args.hosts,
        partitions: args.partitions,
        total_records,
        opened: observer.opened.load(Ordering::SeqCst),
        processed: observer.processed.load(Ordering::SeqCst),
        closed: observer.closed.load(Ordering::SeqCst),
        elapsed_ms: start.elapsed().as_millis(),
    };

    output::print_output(format, &summary, format_human)?;
    Ok(())
}

fn format_human(summary: &RunSummary) -> String {
    format!(
        "{} host(s) processed {}/{} records across {} partitions in {}ms (opened {}, closed {})",
        summary.hosts,
        summary.processed,
        summary.total_records,
        summary.partitions,
        summary.elapsed_ms,
        summary.opened,
        summary.closed,
    )
}
