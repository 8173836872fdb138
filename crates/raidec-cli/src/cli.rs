use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(flatten)]
    pub array: ArrayArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct ArrayArgs {
    /// Directory holding the emulated disk images.
    #[arg(long, env = "RAIDEC_DISK_DIR")]
    pub disk_dir: PathBuf,

    #[arg(long, value_enum, default_value_t = RaidMode::Raid5)]
    pub raid: RaidMode,

    /// Information symbols per stripe.
    #[arg(long, default_value_t = 4)]
    pub dimension: usize,

    /// Check symbols per stripe (Reed-Solomon only).
    #[arg(long, default_value_t = 2)]
    pub redundancy: usize,

    /// Bytes per stripe unit; must be a multiple of 16.
    #[arg(long, default_value_t = 4096)]
    pub stripe_unit_size: usize,

    /// Number of independent subarrays interleaved over the disks.
    #[arg(long, default_value_t = 1)]
    pub interleaving: usize,

    /// Payload capacity of each disk in bytes.
    #[arg(long, env = "RAIDEC_DISK_CAPACITY", default_value_t = 1 << 20)]
    pub disk_capacity: u64,

    /// Maximum number of concurrent volume operations.
    #[arg(long, default_value_t = 4)]
    pub threads: usize,

    /// Disk indices to leave offline, comma separated.
    #[arg(long, value_delimiter = ',')]
    pub offline: Vec<usize>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Reset every disk and persist the array configuration.
    Init,

    /// Write an integer sequence, self-check, read back and compare.
    Verify(VerifyArgs),

    /// Store a file on the array.
    Store { file: PathBuf },

    /// Extract a previously stored file, validating its checksum.
    Get { file: PathBuf },

    /// Verify every stripe of the array.
    Check,

    /// Run a multi-threaded read/write benchmark.
    Bench(BenchArgs),
}

#[derive(Args, Debug, Clone)]
pub struct VerifyArgs {
    /// Stripe units per request; 0 issues one request for the whole volume.
    #[arg(long, default_value_t = 0)]
    pub blocks_per_request: u64,
}

#[derive(Args, Debug, Clone)]
pub struct BenchArgs {
    #[arg(long, value_enum, default_value_t = AccessMode::Linear)]
    pub mode: AccessMode,

    /// Align every request to a block-size multiple.
    #[arg(long)]
    pub aligned: bool,

    /// Fraction of requests that are writes.
    #[arg(long, default_value_t = 0.5)]
    pub write_ratio: f64,

    /// Bytes per request.
    #[arg(long, default_value_t = 4096)]
    pub block_size: usize,

    /// Number of load-generating threads.
    #[arg(long, default_value_t = 4)]
    pub threads: usize,

    /// Benchmark duration in seconds.
    #[arg(long, default_value_t = 10)]
    pub duration: u64,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum RaidMode {
    Raid5,
    Rs,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum AccessMode {
    Linear,
    Random,
}
