//! Kiln - Cloud Native Buildpacks lifecycle
//!
//! CLI entry point that dispatches to phase subcommands.

use clap::Parser;
use console::style;
use kiln::cli::{Cli, Commands};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => EnvFilter::new("kiln=info"),
        1 => EnvFilter::new("kiln=debug"),
        _ => EnvFilter::new("kiln=trace"),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();

    let result = match cli.command {
        Commands::Detect(args) => kiln::cli::commands::detect(args).await,
        Commands::Analyze(args) => kiln::cli::commands::analyze(args).await,
        Commands::Restore(args) => kiln::cli::commands::restore(args).await,
        Commands::Export(args) => kiln::cli::commands::export(args).await,
        Commands::Cache(args) => kiln::cli::commands::cache(args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            ExitCode::from(e.exit_code())
        }
    }
}
