// changefeed-demo: CLI entry point for exercising the change-feed
// processor core against an in-memory feed and lease collection.

use clap::Parser;

mod commands;
mod exit_code;
mod output;

use exit_code::ExitCode;
use output::OutputFormat;

#[derive(Parser)]
#[command(name = "changefeed-demo", about = "Runs a simulated change-feed partition processor fleet")]
struct Cli {
    #[command(subcommand)]
    command: commands::Command,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match commands::run(cli.command).await {
        Ok(()) => ExitCode::Success.into(),
        Err(err) => {
            output::print_error(OutputFormat::detect(false), "ERROR", &format!("{err:#}"));
            ExitCode::from_error(&err).into()
        }
    }
}
