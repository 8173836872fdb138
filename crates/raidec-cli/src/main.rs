#![allow(clippy::multiple_crate_versions)]

mod cli;
mod scenarios;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use raidec::layout::codec::CodecConfig;
use raidec::retention::array::{ArrayConfig, DiskArray, DiskSpec};

use cli::{ArrayArgs, Cli, Command, RaidMode};

fn main() -> ExitCode {
    init_tracing();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Usage and parse problems exit with 1; --help/--version with 0.
            let code: u8 = if e.exit_code() == 0 { 0 } else { 1 };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(2)
        }
    }
}

fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();
}

fn run(cli: Cli) -> Result<u8> {
    // The benchmark may drive more threads than the default lock pool.
    let max_threads = match &cli.command {
        Command::Bench(bench) => cli.array.threads.max(bench.threads),
        _ => cli.array.threads,
    };
    let array = build_array(&cli.array, max_threads)?;

    match cli.command {
        Command::Init => scenarios::initialize(&array),
        Command::Verify(args) => scenarios::integer_verify(&array, &args),
        Command::Store { file } => scenarios::store_file(&array, &file),
        Command::Get { file } => scenarios::get_file(&array, &file),
        Command::Check => scenarios::check(&array),
        Command::Bench(args) => scenarios::benchmark(&Arc::new(array), &args),
    }
}

fn build_array(args: &ArrayArgs, max_threads: usize) -> Result<DiskArray> {
    let codec = match args.raid {
        RaidMode::Raid5 => CodecConfig::Raid5 {
            dimension: args.dimension,
            interleaving: args.interleaving,
            stripe_unit_size: args.stripe_unit_size,
        },
        RaidMode::Rs => CodecConfig::Rs {
            dimension: args.dimension,
            redundancy: args.redundancy,
            interleaving: args.interleaving,
            stripe_unit_size: args.stripe_unit_size,
        },
    };

    std::fs::create_dir_all(&args.disk_dir)?;
    let num_disks = codec.params().num_disks();
    let disks = (0..num_disks)
        .map(|i| DiskSpec {
            path: args.disk_dir.join(format!("disk-{i}.img")),
            online: !args.offline.contains(&i),
        })
        .collect();

    DiskArray::new(&ArrayConfig {
        codec,
        disks,
        disk_capacity: args.disk_capacity,
        max_threads,
    })
}
