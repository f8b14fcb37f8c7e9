// CLI subcommand dispatch.

use clap::Subcommand;

pub mod config_init;
pub mod config_show;
pub mod run;

#[derive(Subcommand)]
pub enum Command {
    /// Run a simulated fleet of hosts against an in-memory feed
    Run(run::RunArgs),
    /// Write the default configuration to a TOML file
    ConfigInit(config_init::ConfigInitArgs),
    /// Print the effective configuration
    ConfigShow(config_show::ConfigShowArgs),
}

pub async fn run(cmd: Command) -> anyhow::Result<()> {
    match cmd {
        Command::Run(args) => run::run(args).await,
        Command::ConfigInit(args) => config_init::run(args).await,
        Command::ConfigShow(args) => config_show::run(args).await,
    }
}
