// SPDX-License-Identifier: AGPL-3.0

//! Copy-on-write symbolic memory
//!
//! A [`MemoryView`] is the memory of one execution state. Forking a state
//! copies its view in O(1); diverged views can later be diffed and merged,
//! either precisely under a selector flag or approximately by forgetting the
//! bytes that differ.

pub mod checkpoint;
pub mod concretize;
pub mod names;
pub mod path;
pub mod view;

pub use checkpoint::{reattach_all, DetachedMemory, ReattachedMemory};
pub use concretize::{Concretizer, Resolution, Strategy};
pub use names::{NamerState, SymbolNamer};
pub use path::Path;
pub use view::{Address, MemoryView, MergeError, MergeOutcome};

pub use simmem_bitvec::{SymBitVec, SymBool};
pub use simmem_exceptions::{MemoryError, MemoryResult};
