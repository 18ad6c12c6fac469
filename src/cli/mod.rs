pub mod commands;
pub mod config;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use crate::queue::Lane;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run crawl workers against the shared queue until interrupted
    Worker {
        /// Number of concurrent workers
        #[arg(short = 'n', long)]
        concurrency: Option<usize>,
    },

    /// Submit a root crawl task
    Submit {
        /// URL to start crawling from
        #[arg(required = true)]
        url: String,

        /// Link-following hops below the root
        #[arg(short, long, default_value_t = 0)]
        depth: u32,

        /// Priority lane (critical, default, low)
        #[arg(short, long, default_value_t = Lane::Default)]
        lane: Lane,

        /// Retry ceiling for the root task
        #[arg(long)]
        max_retry: Option<u32>,
    },

    /// Crawl a site in this process and exit when done
    Crawl {
        /// URL to start crawling from
        #[arg(required = true)]
        url: String,

        /// Link-following hops below the root
        #[arg(short, long, default_value_t = 1)]
        depth: u32,

        /// Number of concurrent workers
        #[arg(short = 'n', long)]
        concurrency: Option<usize>,

        /// Retry ceiling for every task of this crawl
        #[arg(long, default_value_t = 3)]
        max_retry: u32,
    },

    /// Show queue depth per lane
    Status,

    /// List stored pages
    Pages {
        /// 1-based page number
        #[arg(short, long, default_value_t = 1)]
        page: u64,
    },

    /// Show one stored page
    Page {
        /// Document id
        #[arg(required = true)]
        uid: String,
    },

    /// Show the effective configuration
    Config {
        /// Write the default configuration file
        #[arg(long)]
        init: bool,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Worker { concurrency } => {
            info!("Starting worker pool");
            commands::worker(config_path, concurrency).await
        },
        Commands::Submit { url, depth, lane, max_retry } => {
            info!("Submitting {} with depth {} on {} lane", url, depth, lane);
            commands::submit(config_path, url, depth, lane, max_retry).await
        },
        Commands::Crawl { url, depth, concurrency, max_retry } => {
            info!("Starting standalone crawl of {} with depth {}", url, depth);
            commands::crawl(config_path, url, depth, concurrency, max_retry).await
        },
        Commands::Status => commands::status(config_path).await,
        Commands::Pages { page } => commands::pages(config_path, page).await,
        Commands::Page { uid } => commands::page(config_path, uid).await,
        Commands::Config { init } => {
            if init {
                info!("Writing default configuration");
                commands::init_config(config_path)
            } else {
                commands::show_config(config_path)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }

    #[test]
    fn test_submit_arguments() {
        let cli = Cli::try_parse_from([
            "crawler", "submit", "https://example.com/", "--depth", "2", "--lane", "critical", "--max-retry", "5",
        ])
        .unwrap();

        match cli.command {
            Commands::Submit { url, depth, lane, max_retry } => {
                assert_eq!(url, "https://example.com/");
                assert_eq!(depth, 2);
                assert_eq!(lane, Lane::Critical);
                assert_eq!(max_retry, Some(5));
            }
            _ => panic!("expected submit"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["crawler", "status", "--verbose", "--config", "crawler.yaml"]).unwrap();

        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("crawler.yaml")));
    }

    #[test]
    fn test_short_config_and_concurrency_flags() {
        let cli = Cli::try_parse_from(["crawler", "worker", "-c", "crawler.yaml", "-n", "4"]).unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("crawler.yaml")));
        assert!(matches!(cli.command, Commands::Worker { concurrency: Some(4) }));

        let cli = Cli::try_parse_from(["crawler", "crawl", "https://example.com/", "-n", "2", "-c", "crawler.yaml"]).unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("crawler.yaml")));
        match cli.command {
            Commands::Crawl { concurrency, depth, .. } => {
                assert_eq!(concurrency, Some(2));
                assert_eq!(depth, 1);
            }
            _ => panic!("expected crawl"),
        }
    }

    #[test]
    fn test_unknown_lane_is_rejected() {
        assert!(Cli::try_parse_from(["crawler", "submit", "https://example.com/", "--lane", "urgent"]).is_err());
    }
}
