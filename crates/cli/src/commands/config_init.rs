//! `changefeed-demo config-init` — writes the default configuration to a
//! TOML file a real deployment can then edit.

use std::path::PathBuf;

use clap::Args;

use changefeed_common::config::ProcessorConfig;

#[derive(Debug, Args)]
pub struct ConfigInitArgs {
    /// Where to write the generated file.
    path: PathBuf,

    /// Lease namespace to seed the file with.
    #[arg(long, default_value = "demo")]
    lease_prefix: String,
}

pub async fn run(args: ConfigInitArgs) -> anyhow::Result<()> {
    let config = ProcessorConfig { lease_prefix: args.lease_prefix, ..Default::default() };
    config.save_to(&args.path)?;
    println!("wrote default configuration to {}", args.path.display());
    Ok(())
}
