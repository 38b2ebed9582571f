// SPDX-License-Identifier: AGPL-3.0

//! Errors raised by the symbolic memory model.
//!
//! Memory errors fall in two groups: ones that end the current path (the
//! address constraints are unsatisfiable) and ones the caller may recover from
//! by dropping the state or widening the concretization strategies.

use thiserror::Error;

/// Errors surfaced by loads, stores, concretization, merging and checkpointing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// Address concretization attempted against an unsatisfiable constraint set
    #[error("Trying to concretize with unsat constraints: {0}")]
    UnsatAddress(String),

    /// No configured strategy produced a candidate address
    #[error("Unable to concretize address with the provided strategies: {0}")]
    ConcretizationFailure(String),

    /// `flag_values` does not line up with the states being merged
    #[error("Merge arity mismatch: {states} states but {flag_values} flag values")]
    MergeArityMismatch { states: usize, flag_values: usize },

    /// A merge flag value does not fit in the flag's width
    #[error("Merge flag value {value} does not fit in {bits} bits")]
    SelectorOutOfRange { value: u64, bits: u32 },

    #[error("Zero-sized memory access at {0}")]
    ZeroSizedAccess(String),

    #[error("Value width {0} is not a multiple of 8")]
    UnalignedValue(u32),

    #[error("Expression of {0} bits is too wide for a concrete query")]
    TooWide(u32),

    #[error("Solver returned unknown: {0}")]
    SolverUnknown(String),

    #[error("Value is not concrete: {0}")]
    NotConcrete(String),

    #[error("Byte store error: {0}")]
    Store(#[from] StoreError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),
}

impl MemoryError {
    /// Whether the owning state must be treated as a dead path
    pub fn is_dead_path(&self) -> bool {
        matches!(self, Self::UnsatAddress(_))
    }
}

/// Errors raised by the copy-on-write byte store lineage
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The node is not on the store's parent chain
    #[error("Node {0} is not an ancestor of the current store")]
    NotAnAncestor(usize),

    #[error("Unknown lineage node {0}")]
    UnknownNode(usize),
}

/// Errors raised by the checkpoint cache
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Only the following cache keys are accepted: 'name', 'binhash' and 'addr' (got '{0}')")]
    UnknownKey(String),

    #[error("Cache file {path} was produced for binary {found}, expected {expected}")]
    Stale {
        path: String,
        expected: String,
        found: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for memory operations
pub type MemoryResult<T> = Result<T, MemoryError>;

/// Result type for byte store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for checkpoint cache operations
pub type CacheResult<T> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsat_address() {
        let err = MemoryError::UnsatAddress("mem_addr".to_string());
        assert_eq!(
            err.to_string(),
            "Trying to concretize with unsat constraints: mem_addr"
        );
        assert!(err.is_dead_path());
    }

    #[test]
    fn test_concretization_failure_is_recoverable() {
        let err = MemoryError::ConcretizationFailure("x".to_string());
        assert!(!err.is_dead_path());
    }

    #[test]
    fn test_merge_arity_mismatch() {
        let err = MemoryError::MergeArityMismatch {
            states: 3,
            flag_values: 2,
        };
        assert_eq!(
            err.to_string(),
            "Merge arity mismatch: 3 states but 2 flag values"
        );
    }

    #[test]
    fn test_selector_out_of_range() {
        let err = MemoryError::SelectorOutOfRange { value: 2, bits: 1 };
        assert_eq!(err.to_string(), "Merge flag value 2 does not fit in 1 bits");
        assert!(!err.is_dead_path());
    }

    #[test]
    fn test_store_error_conversion() {
        let err: MemoryError = StoreError::NotAnAncestor(7).into();
        assert_eq!(
            err.to_string(),
            "Byte store error: Node 7 is not an ancestor of the current store"
        );
    }

    #[test]
    fn test_zero_sized_access() {
        let err = MemoryError::ZeroSizedAccess("0x1000".to_string());
        assert_eq!(err.to_string(), "Zero-sized memory access at 0x1000");
    }

    #[test]
    fn test_cache_unknown_key() {
        let err = CacheError::UnknownKey("pid".to_string());
        assert!(err.to_string().contains("'pid'"));
    }
}
