// SPDX-License-Identifier: AGPL-3.0

//! Fresh symbol names
//!
//! Every memory created in one run shares a namer so that names minted by
//! sibling states never collide. Counters live behind an `Rc`, so cloning a
//! namer hands out another handle to the same counters.

use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::rc::Rc;

/// Counter values, saved with checkpoints so reattached memories keep minting
/// names that were never used before
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamerState {
    pub byte: u64,
    pub addr: u64,
    pub merge: u64,
    pub checkpoint: u64,
}

impl NamerState {
    /// Field-wise maximum
    pub fn max(self, other: Self) -> Self {
        Self {
            byte: self.byte.max(other.byte),
            addr: self.addr.max(other.addr),
            merge: self.merge.max(other.merge),
            checkpoint: self.checkpoint.max(other.checkpoint),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    byte: Cell<u64>,
    addr: Cell<u64>,
    merge: Cell<u64>,
    checkpoint: Cell<u64>,
}

fn bump(counter: &Cell<u64>) -> u64 {
    let n = counter.get();
    counter.set(n + 1);
    n
}

/// Shared source of fresh symbol names
#[derive(Debug, Clone, Default)]
pub struct SymbolNamer {
    counters: Rc<Counters>,
}

impl SymbolNamer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Namer continuing from previously saved counters
    pub fn resume(state: NamerState) -> Self {
        let namer = Self::new();
        namer.advance_to(state);
        namer
    }

    pub fn state(&self) -> NamerState {
        NamerState {
            byte: self.counters.byte.get(),
            addr: self.counters.addr.get(),
            merge: self.counters.merge.get(),
            checkpoint: self.counters.checkpoint.get(),
        }
    }

    /// Raise every counter to at least the values in `state`
    pub fn advance_to(&self, state: NamerState) {
        let merged = self.state().max(state);
        self.counters.byte.set(merged.byte);
        self.counters.addr.set(merged.addr);
        self.counters.merge.set(merged.merge);
        self.counters.checkpoint.set(merged.checkpoint);
    }

    /// Whether both handles share the same counters
    pub fn shares_counters(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.counters, &other.counters)
    }

    /// Name for a byte read before it was ever written
    pub fn byte(&self, id: &str, addr: u64) -> String {
        format!("{}_{:x}_{}", id, addr, bump(&self.counters.byte))
    }

    /// Name for a free symbolic address
    pub fn addr(&self, id: &str) -> String {
        format!("{}_addr_{}", id, bump(&self.counters.addr))
    }

    /// Name for a byte whose value is forgotten
    pub fn unconstrain(&self, id: &str, addr: u64) -> String {
        format!("{}_unconstrain_0x{:x}_{}", id, addr, bump(&self.counters.addr))
    }

    /// Name for the byte produced by merging several states
    pub fn merge(&self, id: &str, addr: u64) -> String {
        format!("{}_merge_0x{:x}_{}", id, addr, bump(&self.counters.merge))
    }

    /// Sequence number of the next checkpoint
    pub fn checkpoint(&self) -> u64 {
        bump(&self.counters.checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_formats() {
        let namer = SymbolNamer::new();
        assert_eq!(namer.byte("mem", 0x10), "mem_10_0");
        assert_eq!(namer.byte("mem", 0x10), "mem_10_1");
        assert_eq!(namer.addr("mem"), "mem_addr_0");
        assert_eq!(namer.unconstrain("mem", 0xff), "mem_unconstrain_0xff_1");
        assert_eq!(namer.merge("stack", 0x8), "stack_merge_0x8_0");
    }

    #[test]
    fn test_clones_share_counters() {
        let namer = SymbolNamer::new();
        let other = namer.clone();
        namer.byte("mem", 0);
        assert_eq!(other.byte("mem", 0), "mem_0_1");
        assert!(namer.shares_counters(&other));
        assert!(!namer.shares_counters(&SymbolNamer::new()));
    }

    #[test]
    fn test_resume() {
        let namer = SymbolNamer::new();
        namer.merge("mem", 1);
        namer.merge("mem", 1);
        namer.checkpoint();

        let resumed = SymbolNamer::resume(namer.state());
        assert_eq!(resumed.merge("mem", 1), "mem_merge_0x1_2");
        assert_eq!(resumed.checkpoint(), 1);
        assert_eq!(resumed.byte("mem", 1), "mem_1_0");
    }

    #[test]
    fn test_advance_never_lowers() {
        let namer = SymbolNamer::new();
        for _ in 0..5 {
            namer.addr("mem");
        }
        namer.advance_to(NamerState {
            addr: 2,
            byte: 3,
            ..NamerState::default()
        });
        let state = namer.state();
        assert_eq!(state.addr, 5);
        assert_eq!(state.byte, 3);
    }
}
