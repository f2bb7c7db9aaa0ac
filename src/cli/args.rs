//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// previewd - build and deploy UI component previews
///
/// Compiles submitted component source with an external bundler, caches the
/// output by content digest, and materializes each result as its own
/// deployment directory.
#[derive(Parser, Debug)]
#[command(name = "previewd")]
#[command(author, version, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "PREVIEWD_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the build server
    Serve(ServeArgs),

    /// Inspect and prune the build cache
    Cache(CacheArgs),

    /// Show or initialize configuration
    Config(ConfigArgs),
}

/// Arguments for the serve command
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Address to listen on (overrides [server] bind)
    #[arg(short, long)]
    pub bind: Option<String>,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show effective configuration
    Show,

    /// Show configuration file path
    Path,

    /// Write the default configuration file
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

/// Output format for listings
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one per line)
    Plain,
}

/// Arguments for the cache command
#[derive(Parser, Debug)]
pub struct CacheArgs {
    /// Subcommand for cache
    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache subcommands
#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// List cached builds
    List {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Evict cached builds older than the retention window
    Gc {
        /// Evict entries older than N days (default: from config)
        #[arg(long)]
        days: Option<u32>,

        /// Dry run - show what would be removed
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove every cached build
    Clear {
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn about_comes_from_doc_comment() {
        use clap::CommandFactory;
        let about = Cli::command().get_about().map(|a| a.to_string());
        assert_eq!(
            about.as_deref(),
            Some("previewd - build and deploy UI component previews")
        );
    }

    #[test]
    fn cli_parses_serve() {
        let cli = Cli::parse_from(["previewd", "serve", "--bind", "0.0.0.0:8080"]);
        match cli.command {
            Commands::Serve(args) => assert_eq!(args.bind.as_deref(), Some("0.0.0.0:8080")),
            _ => panic!("expected Serve command"),
        }
    }

    #[test]
    fn cli_parses_serve_defaults() {
        let cli = Cli::parse_from(["previewd", "serve"]);
        match cli.command {
            Commands::Serve(args) => assert!(args.bind.is_none()),
            _ => panic!("expected Serve command"),
        }
    }

    #[test]
    fn cli_parses_cache_gc() {
        let cli = Cli::parse_from(["previewd", "cache", "gc", "--days", "3", "--dry-run"]);
        match cli.command {
            Commands::Cache(CacheArgs {
                action: CacheAction::Gc { days, dry_run },
            }) => {
                assert_eq!(days, Some(3));
                assert!(dry_run);
            }
            _ => panic!("expected Cache Gc command"),
        }
    }

    #[test]
    fn cli_parses_cache_list_format() {
        let cli = Cli::parse_from(["previewd", "cache", "list", "--format", "json"]);
        assert!(matches!(
            cli.command,
            Commands::Cache(CacheArgs {
                action: CacheAction::List {
                    format: OutputFormat::Json
                }
            })
        ));
    }

    #[test]
    fn cli_parses_config_without_action() {
        let cli = Cli::parse_from(["previewd", "config"]);
        match cli.command {
            Commands::Config(args) => assert!(args.action.is_none()),
            _ => panic!("expected Config command"),
        }
    }

    #[test]
    fn verbosity_counts() {
        let cli = Cli::parse_from(["previewd", "-vv", "serve"]);
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn global_config_flag() {
        let cli = Cli::parse_from(["previewd", "cache", "list", "-c", "/tmp/p.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/p.toml")));
    }
}
