// SPDX-License-Identifier: AGPL-3.0

//! Detaching memories from a solver context and reattaching them
//!
//! A detached memory carries no `'ctx` lifetime and serializes with serde.
//! Concrete bytes are kept as plain values. Each symbolic byte at `addr` is
//! bound to a slot constant by one SMT-LIB2 assertion `(= slot expr)`; on
//! reattach the slots become the stored bytes and the parsed assertions are
//! handed back as constraints for the new path.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;
use z3::ast::{Ast, BV};
use z3::{Context, Solver};

use simmem_bitvec::{SymBitVec, SymBool};
use simmem_bytestore::ByteStore;
use simmem_exceptions::{MemoryError, MemoryResult};

use crate::names::{NamerState, SymbolNamer};
use crate::view::MemoryView;

/// Context-free form of a [`MemoryView`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetachedMemory {
    pub id: String,
    pub bits: u32,
    pub limit: usize,
    pub namer: NamerState,
    pub concrete: BTreeMap<u64, u8>,
    /// Slot constant name for each symbolic byte
    pub symbolic: BTreeMap<u64, String>,
    /// SMT-LIB2 script with one slot assertion per symbolic byte
    pub script: String,
}

/// A reattached memory and the slot bindings its path must carry
#[derive(Debug)]
pub struct ReattachedMemory<'ctx> {
    pub memory: MemoryView<'ctx>,
    pub constraints: Vec<SymBool<'ctx>>,
}

impl<'ctx> MemoryView<'ctx> {
    /// Drop lineage history, keeping only the current content
    pub fn trim(&mut self) {
        self.store = self.store.flatten();
    }

    /// Serializable snapshot of this memory
    pub fn detach(&self) -> MemoryResult<DetachedMemory> {
        let generation = self.namer.checkpoint();
        let solver = Solver::new(self.ctx);
        let mut concrete = BTreeMap::new();
        let mut symbolic = BTreeMap::new();

        for (addr, byte) in self.store.snapshot() {
            match &byte {
                SymBitVec::Concrete { .. } => {
                    let value = byte.as_u64()?;
                    concrete.insert(addr, value as u8);
                }
                SymBitVec::Symbolic { value, .. } => {
                    let slot = format!("__ckpt_{}_{}_0x{:x}", self.id, generation, addr);
                    let constant = BV::new_const(self.ctx, slot.as_str(), 8);
                    solver.assert(&constant._eq(value));
                    symbolic.insert(addr, slot);
                }
            }
        }

        let script = if symbolic.is_empty() {
            String::new()
        } else {
            solver.to_string()
        };

        debug!(
            "detached '{}': {} concrete, {} symbolic byte(s)",
            self.id,
            concrete.len(),
            symbolic.len()
        );
        Ok(DetachedMemory {
            id: self.id.clone(),
            bits: self.bits,
            limit: self.limit,
            namer: self.namer.state(),
            concrete,
            symbolic,
            script,
        })
    }
}

impl DetachedMemory {
    /// Rebuild the memory in `ctx` with a namer resumed from the saved counters
    pub fn reattach<'ctx>(&self, ctx: &'ctx Context) -> MemoryResult<ReattachedMemory<'ctx>> {
        self.reattach_with(ctx, SymbolNamer::resume(self.namer))
    }

    /// Rebuild the memory in `ctx`, minting names from `namer`
    ///
    /// `namer` is advanced past the saved counters first.
    pub fn reattach_with<'ctx>(
        &self,
        ctx: &'ctx Context,
        namer: SymbolNamer,
    ) -> MemoryResult<ReattachedMemory<'ctx>> {
        namer.advance_to(self.namer);
        let constraints = self.parse_script(ctx)?;

        let concrete = self
            .concrete
            .iter()
            .map(|(addr, byte)| (*addr, SymBitVec::from_u64(*byte as u64, 8)));
        let symbolic = self
            .symbolic
            .iter()
            .map(|(addr, slot)| (*addr, SymBitVec::symbolic(ctx, slot, 8)));
        let store: ByteStore<SymBitVec<'ctx>> = concrete.chain(symbolic).collect();

        let memory =
            MemoryView::from_parts(ctx, store, self.bits, self.id.clone(), self.limit, namer);
        Ok(ReattachedMemory {
            memory,
            constraints,
        })
    }

    fn parse_script<'ctx>(&self, ctx: &'ctx Context) -> MemoryResult<Vec<SymBool<'ctx>>> {
        if self.symbolic.is_empty() {
            return Ok(Vec::new());
        }

        let solver = Solver::new(ctx);
        solver.from_string(self.script.as_str());
        let assertions = solver.get_assertions();
        if assertions.len() != self.symbolic.len() {
            return Err(MemoryError::Checkpoint(format!(
                "'{}' expects {} slot assertions, script holds {}",
                self.id,
                self.symbolic.len(),
                assertions.len()
            )));
        }

        Ok(assertions.into_iter().map(SymBool::from_z3).collect())
    }

    /// Number of stored bytes
    pub fn len(&self) -> usize {
        self.concrete.len() + self.symbolic.len()
    }

    pub fn is_empty(&self) -> bool {
        self.concrete.is_empty() && self.symbolic.is_empty()
    }
}

/// Reattach a stash of memories detached from one run
///
/// All memories share one namer advanced past every saved counter, so fresh
/// names never repeat across the stash.
pub fn reattach_all<'ctx>(
    ctx: &'ctx Context,
    stash: &[DetachedMemory],
) -> MemoryResult<Vec<ReattachedMemory<'ctx>>> {
    let state = stash
        .iter()
        .fold(NamerState::default(), |acc, memory| acc.max(memory.namer));
    let namer = SymbolNamer::resume(state);
    stash
        .iter()
        .map(|memory| memory.reattach_with(ctx, namer.clone()))
        .collect()
}
