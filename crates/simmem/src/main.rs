// SPDX-License-Identifier: AGPL-3.0

//! simmem - inspect checkpoint caches of the symbolic memory model

use anyhow::{Context as AnyhowContext, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing::debug;
use z3::Context as Z3Context;

use simmem_cache::{CacheFile, CheckpointCache};
use simmem_config::MemoryConfig;
use simmem_memory::{reattach_all, Path};

#[derive(Debug, Parser)]
#[clap(
    name = "simmem",
    version,
    about = "Copy-on-write symbolic memory for symbolic execution"
)]
struct Cli {
    #[clap(flatten)]
    config: MemoryConfig,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Summarize a checkpoint cache file
    Inspect {
        file: PathBuf,

        /// Rebuild every memory in a fresh solver context and check it
        #[clap(long)]
        reattach: bool,
    },

    /// Print the cache file path for a binary
    Key {
        #[clap(long)]
        binary: PathBuf,

        /// State address substituted for {addr} (hex with 0x prefix, or decimal)
        #[clap(long, value_parser = parse_addr)]
        addr: Option<u64>,
    },
}

fn parse_addr(s: &str) -> std::result::Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse::<u64>(),
    };
    parsed.map_err(|e| format!("invalid address '{}': {}", s, e))
}

fn main() -> Result<()> {
    let exitcode = _main()?;
    std::process::exit(exitcode)
}

fn _main() -> Result<i32> {
    let cli = Cli::parse();
    let config = cli.config.resolve()?;
    simmem_logs::init(config.verbose);
    debug!("resolved config: {:?}", config);

    match cli.command {
        Command::Inspect { file, reattach } => inspect(&config, &file, reattach),
        Command::Key { binary, addr } => key(&config, &binary, addr),
    }
}

fn inspect(config: &MemoryConfig, file: &std::path::Path, reattach: bool) -> Result<i32> {
    let cache = CacheFile::read(file)
        .with_context(|| format!("Failed to read cache file: {}", file.display()))?;

    println!(
        "{} {} (format v{}, binary {})",
        "Cache".cyan(),
        file.display(),
        cache.version,
        cache.binhash
    );
    for (i, memory) in cache.stash.iter().enumerate() {
        println!(
            "  [{}] {} bits={} limit={} concrete={} symbolic={}",
            i,
            memory.id.bold(),
            memory.bits,
            memory.limit,
            memory.concrete.len(),
            memory.symbolic.len()
        );
    }

    if !reattach {
        return Ok(0);
    }

    let z3_config = z3::Config::new();
    let ctx = Z3Context::new(&z3_config);
    let reattached = match reattach_all(&ctx, &cache.stash) {
        Ok(reattached) => reattached,
        Err(err) => {
            eprintln!("{}", format!("Reattach failed: {}", err).red());
            return Ok(1);
        }
    };

    let mut exitcode = 0;
    for (i, entry) in reattached.into_iter().enumerate() {
        let mut path = Path::new(&ctx).with_timeout(config.solver_timeout);
        path.extend(entry.constraints);
        match path.is_satisfiable() {
            Ok(true) => println!(
                "  [{}] {} {} bytes",
                i,
                "reattached".green(),
                entry.memory.len()
            ),
            Ok(false) => {
                println!("  [{}] {}", i, "unsatisfiable slot bindings".red());
                exitcode = 1;
            }
            Err(err) => {
                println!("  [{}] {}", i, err.to_string().yellow());
                exitcode = 1;
            }
        }
    }

    Ok(exitcode)
}

fn key(config: &MemoryConfig, binary: &std::path::Path, addr: Option<u64>) -> Result<i32> {
    let cache = CheckpointCache::from_config(config, binary)
        .with_context(|| format!("Failed to key binary: {}", binary.display()))?;
    let path = cache.path_for(addr);

    let status = if cache.exists(addr) {
        "cached".green()
    } else {
        "missing".dimmed()
    };
    println!("{} {}", path.display(), status);
    Ok(0)
}
