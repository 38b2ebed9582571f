// SPDX-License-Identifier: AGPL-3.0

//! Configuration management for the symbolic memory model
//!
//! Options come from the command line (clap) or from the `[global]` table of a
//! TOML file; command-line values override file values.

use anyhow::{Context, Result};
use clap::Parser;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Memory model configuration
#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
#[clap(
    name = "simmem",
    version,
    about = "Copy-on-write symbolic memory for symbolic execution"
)]
pub struct MemoryConfig {
    /// Path to the config file
    #[clap(long, global = true)]
    #[serde(default)]
    pub config: Option<PathBuf>,

    // === Memory options ===
    /// Address width in bits
    #[clap(long, default_value = "64", global = true)]
    #[serde(default = "default_bits")]
    pub bits: u32,

    /// Max number of concrete addresses enumerated for one symbolic address
    #[clap(long, default_value = "1024", global = true)]
    #[serde(default = "default_limit")]
    pub limit: usize,

    /// Identifier of the memory segment, used as prefix of fresh symbol names
    #[clap(long, default_value = "mem", global = true)]
    #[serde(default = "default_memory_id")]
    pub memory_id: String,

    // === Solver options ===
    /// Timeout for each solver query (e.g. 500ms, 2s; 0 = none)
    #[clap(long, default_value = "0", value_parser = parse_timeout, global = true)]
    #[serde(default)]
    pub solver_timeout: u64,

    // === Cache options ===
    /// Directory holding checkpoint cache files
    #[clap(long, default_value = "/tmp", global = true)]
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Cache file name template; accepts {name}, {binhash} and {addr}
    #[clap(long, global = true)]
    #[serde(default)]
    pub cache_template: Option<String>,

    /// Do not write checkpoints to the cache
    #[clap(long, global = true)]
    #[serde(default)]
    pub no_dump_cache: bool,

    /// Do not read checkpoints from the cache
    #[clap(long, global = true)]
    #[serde(default)]
    pub no_load_cache: bool,

    // === Debugging options ===
    /// Verbosity level (can be repeated: -v, -vv, -vvv)
    #[clap(short, long, action = clap::ArgAction::Count, global = true)]
    #[serde(default)]
    pub verbose: u8,
}

fn default_bits() -> u32 {
    64
}

fn default_limit() -> usize {
    1024
}

fn default_memory_id() -> String {
    "mem".to_string()
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            config: None,
            bits: default_bits(),
            limit: default_limit(),
            memory_id: default_memory_id(),
            solver_timeout: 0,
            cache_dir: default_cache_dir(),
            cache_template: None,
            no_dump_cache: false,
            no_load_cache: false,
            verbose: 0,
        }
    }
}

impl MemoryConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let parsed: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        parsed.to_config()
    }

    /// Load the config file named by `--config` (if any) and apply `self` on top
    pub fn resolve(self) -> Result<Self> {
        let mut resolved = match &self.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        resolved.merge(self);
        resolved.validate()?;
        Ok(resolved)
    }

    /// Merge with another configuration (command line overrides file config)
    pub fn merge(&mut self, other: Self) {
        if other.config.is_some() {
            self.config = other.config;
        }
        if other.bits != default_bits() {
            self.bits = other.bits;
        }
        if other.limit != default_limit() {
            self.limit = other.limit;
        }
        if other.memory_id != default_memory_id() {
            self.memory_id = other.memory_id;
        }
        if other.solver_timeout > 0 {
            self.solver_timeout = other.solver_timeout;
        }
        if other.cache_dir != default_cache_dir() {
            self.cache_dir = other.cache_dir;
        }
        if other.cache_template.is_some() {
            self.cache_template = other.cache_template;
        }
        if other.no_dump_cache {
            self.no_dump_cache = true;
        }
        if other.no_load_cache {
            self.no_load_cache = true;
        }
        if other.verbose > 0 {
            self.verbose = other.verbose;
        }
    }

    /// Reject values the memory model cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.bits == 0 || self.bits > 64 {
            return Err(anyhow::anyhow!(
                "Address width must be between 1 and 64 bits, got {}",
                self.bits
            ));
        }
        if self.limit == 0 {
            return Err(anyhow::anyhow!("Concretization limit must be positive"));
        }

        let ident = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$")?;
        if !ident.is_match(&self.memory_id) {
            return Err(anyhow::anyhow!(
                "Memory id must be a plain identifier, got {:?}",
                self.memory_id
            ));
        }
        Ok(())
    }

    pub fn dump_cache(&self) -> bool {
        !self.no_dump_cache
    }

    pub fn load_cache(&self) -> bool {
        !self.no_load_cache
    }
}

/// TOML configuration structure (for parsing from file)
#[derive(Debug, Deserialize)]
struct TomlConfig {
    #[serde(default)]
    global: HashMap<String, toml::Value>,
}

impl TomlConfig {
    fn to_config(self) -> Result<MemoryConfig> {
        let mut config = MemoryConfig::default();

        for (key, value) in self.global {
            // Convert kebab-case to snake_case
            let key = key.replace('-', "_");

            match key.as_str() {
                "bits" => config.bits = parse_toml_u32(&value)?,
                "limit" => config.limit = parse_toml_usize(&value)?,
                "memory_id" | "id" => config.memory_id = parse_toml_string(&value)?,
                "solver_timeout" => config.solver_timeout = parse_toml_timeout(&value)?,
                "cache_dir" => config.cache_dir = PathBuf::from(parse_toml_string(&value)?),
                "cache_template" => config.cache_template = Some(parse_toml_string(&value)?),
                "dump_cache" => config.no_dump_cache = !parse_toml_bool(&value)?,
                "load_cache" => config.no_load_cache = !parse_toml_bool(&value)?,
                "verbose" => config.verbose = parse_toml_u8(&value)?,
                _ => return Err(anyhow::anyhow!("Unknown config key: {}", key)),
            }
        }

        Ok(config)
    }
}

// TOML parsing helpers
fn parse_toml_string(value: &toml::Value) -> Result<String> {
    value
        .as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("Expected string, got {:?}", value))
}

fn parse_toml_bool(value: &toml::Value) -> Result<bool> {
    value
        .as_bool()
        .ok_or_else(|| anyhow::anyhow!("Expected bool, got {:?}", value))
}

fn parse_toml_usize(value: &toml::Value) -> Result<usize> {
    value
        .as_integer()
        .and_then(|i| usize::try_from(i).ok())
        .ok_or_else(|| anyhow::anyhow!("Expected usize, got {:?}", value))
}

fn parse_toml_u32(value: &toml::Value) -> Result<u32> {
    value
        .as_integer()
        .and_then(|i| u32::try_from(i).ok())
        .ok_or_else(|| anyhow::anyhow!("Expected u32, got {:?}", value))
}

fn parse_toml_u8(value: &toml::Value) -> Result<u8> {
    value
        .as_integer()
        .and_then(|i| u8::try_from(i).ok())
        .ok_or_else(|| anyhow::anyhow!("Expected u8, got {:?}", value))
}

/// Timeouts may be written as integers (milliseconds) or strings with units
fn parse_toml_timeout(value: &toml::Value) -> Result<u64> {
    if let Some(i) = value.as_integer() {
        return u64::try_from(i).map_err(|_| anyhow::anyhow!("Expected u64, got {}", i));
    }
    parse_time(&parse_toml_string(value)?, "ms")
}

fn parse_timeout(s: &str) -> std::result::Result<u64, String> {
    parse_time(s, "ms").map_err(|e| e.to_string())
}

/// Parse time string with unit support
/// Supports: "100ms", "5s", "2m", "1h", or plain numbers (default_unit)
pub fn parse_time(time_str: &str, default_unit: &str) -> Result<u64> {
    let time_str = time_str.trim();

    if let Some(num_str) = time_str.strip_suffix("ms") {
        return Ok(num_str.trim().parse::<u64>()?);
    }
    if let Some(num_str) = time_str.strip_suffix('s') {
        return Ok(num_str.trim().parse::<u64>()? * 1000);
    }
    if let Some(num_str) = time_str.strip_suffix('m') {
        return Ok(num_str.trim().parse::<u64>()? * 60 * 1000);
    }
    if let Some(num_str) = time_str.strip_suffix('h') {
        return Ok(num_str.trim().parse::<u64>()? * 60 * 60 * 1000);
    }

    let value = time_str.parse::<u64>()?;
    match default_unit {
        "ms" => Ok(value),
        "s" => Ok(value * 1000),
        "m" => Ok(value * 60 * 1000),
        "h" => Ok(value * 60 * 60 * 1000),
        _ => Err(anyhow::anyhow!("Invalid default unit: {}", default_unit)),
    }
}
