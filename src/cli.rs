//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

/// Batch retrieval of digitized historical works.
///
/// Reads a CSV of works (entry id, title, optional creator), searches the
/// enabled digital-library providers for each, downloads the best match's
/// artifacts into a per-work directory, and keeps the CSV's `retrievable`
/// and `link` columns up to date.
#[derive(Parser, Debug)]
#[command(name = "chronofetch")]
#[command(author, version, about)]
#[command(
    after_help = "Exit codes:\n  0 = success\n  2 = configuration error\n  3 = input error\n  4 = stopped by download budget\n  130 = interrupted"
)]
pub struct Cli {
    /// Input CSV file (columns: entry_id, short_title, main_author, ...).
    #[arg(value_name = "INPUT_CSV")]
    pub input: Option<PathBuf>,

    /// Root directory receiving one folder per work.
    #[arg(
        short = 'o',
        long = "output-dir",
        value_name = "DIR",
        default_value = "downloaded_works"
    )]
    pub output_dir: PathBuf,

    /// Search and journal selections without downloading anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Log level filter (error, warn, info, debug, trace).
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Configuration file path (overrides CHRONO_CONFIG_PATH).
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Force the interactive terminal UI.
    #[arg(long, conflicts_with = "force_cli")]
    pub force_interactive: bool,

    /// Force plain CLI mode.
    #[arg(long)]
    pub force_cli: bool,

    /// Print the quota ledger and deferred queue, then exit.
    #[arg(long)]
    pub quota_status: bool,

    /// Compact the deferred queue (drop stale terminal items), then exit.
    #[arg(long)]
    pub cleanup_deferred: bool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["chronofetch", "works.csv"]).unwrap();
        assert_eq!(cli.input.unwrap(), PathBuf::from("works.csv"));
        assert_eq!(cli.output_dir, PathBuf::from("downloaded_works"));
        assert!(!cli.dry_run);
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_maintenance_flags_without_input() {
        let cli = Cli::try_parse_from(["chronofetch", "--quota-status"]).unwrap();
        assert!(cli.quota_status);
        assert!(cli.input.is_none());
    }

    #[test]
    fn test_interactive_flags_conflict() {
        assert!(
            Cli::try_parse_from(["chronofetch", "--force-interactive", "--force-cli"]).is_err()
        );
    }
}
