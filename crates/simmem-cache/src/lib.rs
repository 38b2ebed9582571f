// SPDX-License-Identifier: AGPL-3.0

//! Checkpoint cache
//!
//! Stashes of detached memories are written to JSON files whose names come
//! from a [`CacheKey`] template. A file that already exists is never
//! overwritten. Failing to write a checkpoint is logged and reported through
//! [`DumpOutcome`]; it never interrupts exploration.

mod key;

pub use key::CacheKey;

use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{error, warn};

use simmem_config::MemoryConfig;
use simmem_exceptions::{CacheError, CacheResult};
use simmem_logs::{warn_code, WarningCode};
use simmem_memory::{DetachedMemory, MemoryView};

/// Format version written into every cache file
pub const CACHE_VERSION: u32 = 1;

/// On-disk layout of a cache file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheFile {
    pub version: u32,
    pub binhash: String,
    pub stash: Vec<DetachedMemory>,
}

impl CacheFile {
    pub fn read(path: &Path) -> CacheResult<Self> {
        let content = fs::read(path)?;
        serde_json::from_slice(&content).map_err(|e| CacheError::Serialization(e.to_string()))
    }
}

/// What a dump did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpOutcome {
    Written(PathBuf),
    /// A cache file for this key already exists
    Skipped(PathBuf),
    /// Dumping is turned off in the configuration
    Disabled,
    Failed(String),
}

impl DumpOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, DumpOutcome::Written(_))
    }
}

/// Checkpoint cache bound to one analysed binary
#[derive(Debug, Clone)]
pub struct CheckpointCache {
    dir: PathBuf,
    key: CacheKey,
    name: String,
    binhash: String,
    dump_enabled: bool,
    load_enabled: bool,
}

impl CheckpointCache {
    /// Cache for `binary`, keyed by its file name and content hash
    pub fn from_config(config: &MemoryConfig, binary: &Path) -> CacheResult<Self> {
        let name = binary
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let binhash = simmem_hashes::file_hash(binary)?;
        Self::with_binhash(config, &name, &binhash)
    }

    pub fn with_binhash(config: &MemoryConfig, name: &str, binhash: &str) -> CacheResult<Self> {
        let key = match &config.cache_template {
            Some(template) => CacheKey::parse(template)?,
            None => CacheKey::default(),
        };

        Ok(Self {
            dir: config.cache_dir.clone(),
            key,
            name: name.to_string(),
            binhash: binhash.to_string(),
            dump_enabled: config.dump_cache(),
            load_enabled: config.load_cache(),
        })
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn binhash(&self) -> &str {
        &self.binhash
    }

    pub fn path_for(&self, addr: Option<u64>) -> PathBuf {
        self.dir
            .join(self.key.render(&self.name, &self.binhash, addr))
    }

    pub fn exists(&self, addr: Option<u64>) -> bool {
        self.path_for(addr).exists()
    }

    /// Read the stash cached for `addr`
    ///
    /// Returns `Ok(None)` when loading is disabled or nothing is cached.
    pub fn load(&self, addr: Option<u64>) -> CacheResult<Option<Vec<DetachedMemory>>> {
        if !self.load_enabled {
            return Ok(None);
        }

        let path = self.path_for(addr);
        if !path.exists() {
            return Ok(None);
        }

        warn!("Loading from {}...", path.display());
        let file = CacheFile::read(&path)?;
        if file.binhash != self.binhash {
            return Err(CacheError::Stale {
                path: path.display().to_string(),
                expected: self.binhash.clone(),
                found: file.binhash,
            });
        }

        Ok(Some(file.stash))
    }

    /// Like [`load`](Self::load), treating unusable files as a cache miss
    pub fn load_or_skip(&self, addr: Option<u64>) -> Option<Vec<DetachedMemory>> {
        match self.load(addr) {
            Ok(stash) => stash,
            Err(err) => {
                warn_code(
                    WarningCode::CacheLoadFailed,
                    &format!("ignoring cache entry: {}", err),
                    true,
                );
                None
            }
        }
    }

    /// Write `stash` for the state at `addr` unless a file already exists
    pub fn dump(&self, addr: u64, stash: &[DetachedMemory]) -> DumpOutcome {
        if !self.dump_enabled {
            return DumpOutcome::Disabled;
        }

        let path = self.path_for(Some(addr));
        if path.exists() {
            return DumpOutcome::Skipped(path);
        }

        warn!("Caching to {}...", path.display());
        let file = CacheFile {
            version: CACHE_VERSION,
            binhash: self.binhash.clone(),
            stash: stash.to_vec(),
        };

        match Self::write_new(&path, &file) {
            Ok(()) => DumpOutcome::Written(path),
            Err(err) => {
                error!(
                    "Unable to cache to {}: {} [{}]",
                    path.display(),
                    err,
                    WarningCode::CacheDumpFailed.code()
                );
                DumpOutcome::Failed(err.to_string())
            }
        }
    }

    /// Trim, detach and dump a set of live memories
    pub fn dump_views(&self, addr: u64, views: &mut [MemoryView<'_>]) -> DumpOutcome {
        if !self.dump_enabled {
            return DumpOutcome::Disabled;
        }

        let mut stash = Vec::with_capacity(views.len());
        for view in views.iter_mut() {
            view.trim();
            match view.detach() {
                Ok(detached) => stash.push(detached),
                Err(err) => {
                    error!(
                        "Unable to cache, '{}' while detaching [{}]",
                        err,
                        WarningCode::CacheDumpFailed.code()
                    );
                    return DumpOutcome::Failed(err.to_string());
                }
            }
        }

        self.dump(addr, &stash)
    }

    fn write_new(path: &Path, file: &CacheFile) -> CacheResult<()> {
        let data =
            serde_json::to_vec_pretty(file).map_err(|e| CacheError::Serialization(e.to_string()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = OpenOptions::new().write(true).create_new(true).open(path)?;
        out.write_all(&data)?;
        Ok(())
    }
}
