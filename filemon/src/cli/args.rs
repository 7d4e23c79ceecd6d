//! CLI argument definitions

use clap::{Parser, Subcommand};

use crate::domain::ProbeMode;

/// Default kernel ring buffer size (256KB, ~885 records)
pub const DEFAULT_RING_BYTES: u32 = 256 * 1024;

/// Default in-flight table capacity per operation
pub const DEFAULT_TABLE_ENTRIES: u32 = 10_240;

#[derive(Parser)]
#[command(
    name = "filemon",
    about = "Report file deletions and writes as they happen",
    after_help = "\
EXAMPLES:
    sudo filemon run                         Every deletion on the system
    sudo filemon run --pid 1234 --writes     Deletions and writes of one process
    sudo filemon run --mode paired --json    kprobe/kretprobe pair, JSON lines
    filemon simulate --threads 8             Exercise the pipeline in-process"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Attach to the kernel and stream events (requires root)
    Run(RunArgs),
    /// Drive the correlation pipeline with synthetic concurrent calls
    Simulate(SimulateArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    /// Only report this process (TGID)
    #[arg(short, long)]
    pub pid: Option<u32>,

    /// How to observe do_unlinkat
    #[arg(long, value_enum, default_value_t = ProbeMode::Auto)]
    pub mode: ProbeMode,

    /// Also report write(2) calls
    #[arg(long)]
    pub writes: bool,

    /// Print one JSON object per event
    #[arg(long)]
    pub json: bool,

    /// Stop after N seconds (0 = unlimited)
    #[arg(long, default_value = "0")]
    pub duration: u64,

    /// Kernel ring buffer size in bytes (rounded up to a power-of-two multiple of the page size)
    #[arg(long, default_value_t = DEFAULT_RING_BYTES)]
    pub ring_bytes: u32,

    /// In-flight table capacity per operation
    #[arg(long, default_value_t = DEFAULT_TABLE_ENTRIES)]
    pub table_entries: u32,
}

#[derive(clap::Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Concurrent simulated threads
    #[arg(long, default_value = "4")]
    pub threads: usize,

    /// Top-level calls per thread
    #[arg(long, default_value = "64")]
    pub calls: usize,

    /// Recursion depth of each call (1 = no nesting)
    #[arg(long, default_value = "2")]
    pub nesting: usize,

    /// Every Nth call loses its exit and leaves an orphan (0 = never)
    #[arg(long, default_value = "16")]
    pub orphan_every: usize,

    /// In-flight table capacity per operation
    #[arg(long, default_value = "1024")]
    pub table_entries: usize,

    /// Channel capacity in records
    #[arg(long, default_value = "256")]
    pub ring_records: usize,

    /// Only report this simulated process
    #[arg(short, long)]
    pub pid: Option<u32>,

    /// Also simulate write(2) calls
    #[arg(long)]
    pub writes: bool,

    /// Print one JSON object per event
    #[arg(long)]
    pub json: bool,
}
