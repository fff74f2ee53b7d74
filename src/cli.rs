use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Immutable options used by the application runtime
#[derive(Debug, Clone)]
pub struct Options {
    pub config: PathBuf,
    pub offsets: PathBuf,
    pub interval: Duration,
    pub dry_run: bool,
    pub verbose: bool,
}

/// User-facing CLI arguments (kept private to the CLI layer)
#[derive(Parser, Debug)]
#[command(name = "logbeat", version, about = "Ships multi-line application logs to a search index")]
struct Args {
    /// Configuration document (JSON)
    #[arg(long = "config", env = "LOGBEAT_CONFIG", default_value = "/config/logging.json")]
    config: PathBuf,

    /// File recording how far each log file has been shipped
    #[arg(long = "offsets", env = "LOGBEAT_OFFSETS", default_value = "/metadata/metadata.json")]
    offsets: PathBuf,

    /// Seconds to wait between directory passes
    #[arg(long = "interval", default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
    interval: u64,

    /// Parse and log entries without contacting the index
    #[arg(long = "dry-run")]
    dry_run: bool,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

/// Parse CLI options into application Options
pub fn parse() -> Options {
    from_args(Args::parse())
}

fn from_args(args: Args) -> Options {
    Options {
        config: args.config,
        offsets: args.offsets,
        interval: Duration::from_secs(args.interval),
        dry_run: args.dry_run,
        verbose: args.verbose,
    }
}
