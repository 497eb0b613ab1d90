//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "mscan",
    version,
    about = "Reconstruct objects, call stacks and critical sections from an mtrace log",
    after_help = "\
EXAMPLES:
    mscan mtrace.out.gz                               Summary to stdout
    mscan mtrace.out.gz -o report.json --vmlinux vmlinux --symbols vmlinux.syms
    mscan mtrace.out --dump | head                    Decoded records as JSON"
)]
pub struct Args {
    /// Trace log to scan (gzip-compressed logs are detected automatically)
    #[arg(value_name = "TRACE")]
    pub trace: PathBuf,

    /// Write the JSON report here instead of stdout
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Guest kernel image with debug info, for symbolizing pcs
    #[arg(long, value_name = "FILE")]
    pub vmlinux: Option<PathBuf>,

    /// `nm -S` listing of the guest kernel, for static and per-cpu objects
    #[arg(short, long, value_name = "FILE")]
    pub symbols: Option<PathBuf>,

    /// JSON file with scan tolerances
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Dump every decoded record instead of running the analyses
    #[arg(long)]
    pub dump: bool,

    /// Overlapping labels tolerated (overrides the config file)
    #[arg(long, value_name = "N")]
    pub overlap_limit: Option<u64>,

    /// Unmatched label removals tolerated per class (overrides the config file)
    #[arg(long, value_name = "N")]
    pub label_miss_limit: Option<u64>,

    /// Releases of unheld locks tolerated (overrides the config file)
    #[arg(long, value_name = "N")]
    pub release_miss_limit: Option<u64>,

    /// `acquired` records without a pending acquire tolerated (overrides the config file)
    #[arg(long, value_name = "N")]
    pub acquired_miss_limit: Option<u64>,

    /// Log progress every N records, 0 to disable (overrides the config file)
    #[arg(long, value_name = "N")]
    pub progress: Option<u64>,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}
