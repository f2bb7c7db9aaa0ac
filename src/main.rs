//! previewd - component preview build service
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use previewd::cli::{Cli, Commands};
use previewd::config::ConfigManager;
use previewd::error::PreviewResult;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> PreviewResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = config_manager.load().await?;

    init_logging(cli.verbose, &config.general.log_format);
    debug!("Using config {}", config_manager.path().display());

    match cli.command {
        Commands::Serve(args) => previewd::cli::commands::serve(args, &config).await,
        Commands::Cache(args) => previewd::cli::commands::cache(args, &config).await,
        Commands::Config(args) => {
            previewd::cli::commands::config(args, &config, &config_manager).await
        }
    }
}

/// 0 = warn, 1 = info, 2+ = debug. `RUST_LOG` wins when set.
fn init_logging(verbose: u8, log_format: &str) {
    let default = match verbose {
        0 => "previewd=warn",
        1 => "previewd=info",
        _ => "previewd=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    if log_format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .without_time()
            .init();
    }
}
