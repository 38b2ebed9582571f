// SPDX-License-Identifier: AGPL-3.0

//! Address concretization
//!
//! A symbolic address is resolved into concrete candidates by trying an
//! ordered list of strategies until one yields a result.

use std::fmt;
use tracing::trace;

use simmem_bitvec::SymBitVec;
use simmem_exceptions::{MemoryError, MemoryResult};

use crate::path::Path;

/// Address selection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Unallocated memory; needs an allocator model
    Free,
    /// Currently allocated memory; needs an allocator model
    Allocated,
    /// Memory with write permission; needs a permission model
    Writeable,
    /// Memory with execute permission; needs a permission model
    Executable,
    /// Every satisfying value, when the value range is below the limit
    Symbolic,
    /// One arbitrary satisfying value
    Any,
}

impl Strategy {
    /// Order used to resolve store addresses
    pub const WRITE: [Strategy; 3] = [Strategy::Free, Strategy::Writeable, Strategy::Any];

    /// Order used to resolve load addresses
    pub const READ: [Strategy; 2] = [Strategy::Symbolic, Strategy::Any];

    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Free => "free",
            Strategy::Allocated => "allocated",
            Strategy::Writeable => "writeable",
            Strategy::Executable => "executable",
            Strategy::Symbolic => "symbolic",
            Strategy::Any => "any",
        }
    }

    /// Placeholders always yield no candidates
    pub fn is_placeholder(&self) -> bool {
        matches!(
            self,
            Strategy::Free | Strategy::Allocated | Strategy::Writeable | Strategy::Executable
        )
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of resolving an address expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The address has exactly one value; no constraint is needed to use it
    Unique(u64),
    /// Candidates chosen by a strategy, each valid only under `addr == c`
    Candidates(Vec<u64>),
}

impl Resolution {
    pub fn addresses(&self) -> &[u64] {
        match self {
            Resolution::Unique(addr) => std::slice::from_ref(addr),
            Resolution::Candidates(addrs) => addrs,
        }
    }

    pub fn into_addresses(self) -> Vec<u64> {
        match self {
            Resolution::Unique(addr) => vec![addr],
            Resolution::Candidates(addrs) => addrs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Concretizer {
    limit: usize,
}

impl Concretizer {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Concrete candidates for `addr`
    pub fn concretize<'ctx>(
        &self,
        path: &Path<'ctx>,
        addr: &SymBitVec<'ctx>,
        strategies: &[Strategy],
    ) -> MemoryResult<Vec<u64>> {
        Ok(self.resolve(path, addr, strategies)?.into_addresses())
    }

    /// Resolve `addr`, telling unique addresses apart from strategy picks
    pub fn resolve<'ctx>(
        &self,
        path: &Path<'ctx>,
        addr: &SymBitVec<'ctx>,
        strategies: &[Strategy],
    ) -> MemoryResult<Resolution> {
        if addr.is_concrete() {
            return Ok(Resolution::Unique(addr.as_u64()?));
        }

        if !path.is_satisfiable()? {
            return Err(MemoryError::UnsatAddress(addr.to_string()));
        }

        if path.is_unique(addr)? {
            return Ok(Resolution::Unique(path.any(addr)?));
        }

        for strategy in strategies {
            if let Some(addrs) = self.apply(path, addr, *strategy)? {
                if !addrs.is_empty() {
                    trace!("{} resolved to {} candidate(s) by {}", addr, addrs.len(), strategy);
                    return Ok(Resolution::Candidates(addrs));
                }
            }
        }

        let tried: Vec<&str> = strategies.iter().map(|s| s.name()).collect();
        Err(MemoryError::ConcretizationFailure(format!(
            "{} with [{}]",
            addr,
            tried.join(", ")
        )))
    }

    fn apply<'ctx>(
        &self,
        path: &Path<'ctx>,
        addr: &SymBitVec<'ctx>,
        strategy: Strategy,
    ) -> MemoryResult<Option<Vec<u64>>> {
        match strategy {
            Strategy::Free | Strategy::Allocated | Strategy::Writeable | Strategy::Executable => {
                trace!("strategy {} has no semantics yet, skipping", strategy);
                Ok(None)
            }
            Strategy::Symbolic => {
                let min = path.min(addr)?;
                let max = path.max(addr)?;
                if max - min < self.limit as u64 {
                    Ok(Some(path.any_n(addr, self.limit)?))
                } else {
                    Ok(None)
                }
            }
            Strategy::Any => Ok(Some(vec![path.any(addr)?])),
        }
    }
}
