use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

const HELP_TEMPLATE: &str = "\
{before-help}{name} {version}
{author-with-newline}{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}
";

#[derive(Parser, Debug)]
#[command(
    version,
    about = "thermoflow - run batches of nucleic-acid thermodynamics jobs on a shared, memory-bounded table cache.",
    help_template = HELP_TEMPLATE,
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity level (-v for INFO, -vv for DEBUG, -vvv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all log output except for errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Write logs to a specified file in addition to the console output
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run every job of a TOML batch file and summarize the results per complex.
    Run(RunArgs),
}

/// Arguments for the `run` subcommand.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Path to the TOML batch file listing the jobs.
    #[arg(value_name = "BATCH")]
    pub batch: PathBuf,

    /// Write one CSV row per complex to this path.
    #[arg(short, long, value_name = "CSV")]
    pub output: Option<PathBuf>,

    /// Memory budget for cached tables, in bytes. Overrides `max-bytes` in the batch file.
    #[arg(long, value_name = "BYTES")]
    pub max_bytes: Option<usize>,

    /// Number of worker threads. Overrides `threads` in the batch file.
    #[arg(short = 'j', long, value_name = "NUM")]
    pub threads: Option<usize>,

    /// Keep block tables only for the duration of each submission.
    #[arg(long)]
    pub no_cache_complexes: bool,

    /// Submit the batch this many times against the same cache.
    #[arg(long, value_name = "N", default_value_t = 1,
          value_parser = clap::value_parser!(u32).range(1..))]
    pub repeat: u32,
}
