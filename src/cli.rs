/// CLI Module
///
/// Command-line interface configuration using clap.
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Multi-chain ERC20 transfer indexer
///
/// Poll block explorers, backfill history into PostgreSQL and compute transfer analytics
#[derive(Parser, Debug)]
#[command(name = "transfer-indexer")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Database connection URL (overrides DATABASE_URL env var)
    #[arg(short = 'd', long, value_name = "URL", global = true)]
    pub database_url: Option<String>,

    /// Chain list JSON file (overrides CHAINS_CONFIG env var)
    #[arg(short = 'c', long = "chains", value_name = "FILE", global = true)]
    pub chains_config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run live ingestion for every configured chain until Ctrl-C
    Run {
        /// Only ingest these chain ids (repeatable)
        #[arg(long = "chain", value_name = "ID")]
        chains: Vec<u64>,

        /// Transfers requested per page (clamped to the provider cap)
        #[arg(short = 'p', long, value_name = "SIZE", default_value = "1000")]
        page_size: usize,

        /// Seconds to wait after catching up with the chain head
        #[arg(long, value_name = "SECONDS", default_value = "30")]
        interval: u64,

        /// Also run the backfill reconciler alongside live ingestion
        #[arg(long)]
        with_backfill: bool,

        /// Start chains without a cursor at block 0 instead of their newest transfer
        #[arg(long)]
        from_genesis: bool,
    },

    /// Fill history from genesis (or the last checkpoint) up to the live cursor
    Backfill {
        /// Only backfill this chain id
        #[arg(long = "chain", value_name = "ID")]
        chain: Option<u64>,

        /// Block range walked per chunk
        #[arg(long, value_name = "BLOCKS", default_value = "100000")]
        chunk_blocks: u64,

        /// Extend completed backfills up to the current live cursor
        #[arg(long)]
        refresh_target: bool,
    },

    /// Print the analytics response as JSON
    Analytics {
        /// 7d, 30d, 90d or all
        #[arg(short = 'r', long, value_name = "RANGE", default_value = "30d")]
        range: String,

        /// Chain id or "all"
        #[arg(long, value_name = "ID", default_value = "all")]
        chain: String,

        /// Token decimals (defaults to the chain's configured decimals)
        #[arg(long, value_name = "N")]
        decimals: Option<String>,
    },

    /// Print per-chain ingestion health as JSON
    Health,

    /// Apply database migrations and exit
    Migrate,
}

impl Cli {
    /// Validate CLI arguments
    pub fn validate(&self) -> anyhow::Result<()> {
        match &self.command {
            Command::Run { page_size, interval, .. } => {
                if *page_size == 0 {
                    anyhow::bail!("Page size must be greater than 0");
                }
                if *interval == 0 {
                    anyhow::bail!("Interval must be greater than 0");
                }
            }
            Command::Backfill { chunk_blocks, .. } => {
                if *chunk_blocks == 0 {
                    anyhow::bail!("Chunk size must be greater than 0");
                }
            }
            Command::Analytics { .. } | Command::Health | Command::Migrate => {}
        }

        Ok(())
    }

    /// Whether `chain_id` passes the `--chain` selection of the command
    pub fn selects_chain(&self, chain_id: u64) -> bool {
        match &self.command {
            Command::Run { chains, .. } => chains.is_empty() || chains.contains(&chain_id),
            Command::Backfill { chain, .. } => chain.map_or(true, |id| id == chain_id),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::parse_from(["transfer-indexer", "run", "--chain", "1", "--chain", "56", "--with-backfill"]);
        assert!(cli.validate().is_ok());
        assert!(cli.selects_chain(56));
        assert!(!cli.selects_chain(137));
        assert!(matches!(cli.command, Command::Run { with_backfill: true, page_size: 1000, from_genesis: false, .. }));
    }

    #[test]
    fn test_chain_filter_and_chains_file_coexist() {
        let args = ["transfer-indexer", "-c", "file.json", "run", "--chain", "1", "--chain", "56", "--from-genesis"];
        let cli = Cli::parse_from(args);
        assert_eq!(cli.chains_config, Some(PathBuf::from("file.json")));
        let Command::Run { ref chains, from_genesis, .. } = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(chains, &vec![1, 56]);
        assert!(from_genesis);

        let cli = Cli::parse_from(["transfer-indexer", "run", "--chains", "other.json"]);
        assert_eq!(cli.chains_config, Some(PathBuf::from("other.json")));
        assert!(cli.selects_chain(137));
    }

    #[test]
    fn test_command_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_analytics_defaults() {
        let cli = Cli::parse_from(["transfer-indexer", "analytics"]);
        let Command::Analytics { range, chain, decimals } = cli.command else {
            panic!("expected analytics command");
        };
        assert_eq!(range, "30d");
        assert_eq!(chain, "all");
        assert!(decimals.is_none());
    }

    #[test]
    fn test_validation() {
        let cli = Cli::parse_from(["transfer-indexer", "backfill", "--chunk-blocks", "0"]);
        assert!(cli.validate().is_err());

        let cli = Cli::parse_from(["transfer-indexer", "-d", "postgres://x", "backfill", "--chain", "10"]);
        assert_eq!(cli.database_url.as_deref(), Some("postgres://x"));
        assert!(cli.selects_chain(10));
        assert!(!cli.selects_chain(1));
    }
}
