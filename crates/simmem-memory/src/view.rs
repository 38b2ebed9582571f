// SPDX-License-Identifier: AGPL-3.0

//! Per-state memory view
//!
//! A view owns one node of a copy-on-write byte store. All accesses are byte
//! granular with big-endian layout: for an access of `n` bytes at `a`, byte `a`
//! holds the most significant byte and `a + n - 1` the least significant one.
//! Every address is readable; reading a byte nobody wrote materializes a fresh
//! unconstrained symbol.

use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, trace};
use z3::Context;

use simmem_bitvec::{SymBitVec, SymBool};
use simmem_bytestore::ByteStore;
use simmem_config::MemoryConfig;
use simmem_exceptions::{MemoryError, MemoryResult};
use simmem_logs::{warn_code, WarningCode};

use crate::concretize::{Concretizer, Resolution, Strategy};
use crate::names::SymbolNamer;
use crate::path::Path;

/// Address operand of a load or store
#[derive(Debug, Clone)]
pub enum Address<'ctx> {
    Concrete(u64),
    Expr(SymBitVec<'ctx>),
}

impl<'ctx> Address<'ctx> {
    /// Address as a `bits`-wide expression; concrete values wrap
    fn into_expr(self, bits: u32) -> SymBitVec<'ctx> {
        match self {
            Address::Concrete(addr) => SymBitVec::from_u64(addr, bits),
            Address::Expr(expr) => expr,
        }
    }
}

impl<'ctx> From<u64> for Address<'ctx> {
    fn from(addr: u64) -> Self {
        Address::Concrete(addr)
    }
}

impl<'ctx> From<SymBitVec<'ctx>> for Address<'ctx> {
    fn from(expr: SymBitVec<'ctx>) -> Self {
        Address::Expr(expr)
    }
}

impl<'ctx> From<&SymBitVec<'ctx>> for Address<'ctx> {
    fn from(expr: &SymBitVec<'ctx>) -> Self {
        Address::Expr(expr.clone())
    }
}

impl<'ctx> fmt::Display for Address<'ctx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Concrete(addr) => write!(f, "{:#x}", addr),
            Address::Expr(expr) => write!(f, "{}", expr),
        }
    }
}

/// Result of a precise merge
#[derive(Debug)]
pub struct MergeOutcome<'ctx> {
    pub memory: MemoryView<'ctx>,
    /// One disjunction per merged byte; must be added to the path
    pub constraints: Vec<SymBool<'ctx>>,
}

/// A rejected merge, handing the untouched inputs back to the caller
#[derive(Debug)]
pub struct MergeError<'ctx> {
    pub error: MemoryError,
    pub memory: MemoryView<'ctx>,
    pub others: Vec<MemoryView<'ctx>>,
}

impl<'ctx> fmt::Display for MergeError<'ctx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl<'ctx> std::error::Error for MergeError<'ctx> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl<'ctx> From<MergeError<'ctx>> for MemoryError {
    fn from(err: MergeError<'ctx>) -> Self {
        err.error
    }
}

fn wrap_address(addr: u64, bits: u32) -> u64 {
    if bits >= 64 {
        addr
    } else {
        addr & ((1u64 << bits) - 1)
    }
}

/// Byte-addressable symbolic memory owned by one execution state
pub struct MemoryView<'ctx> {
    pub(crate) ctx: &'ctx Context,
    pub(crate) store: ByteStore<SymBitVec<'ctx>>,
    pub(crate) bits: u32,
    pub(crate) id: String,
    pub(crate) limit: usize,
    pub(crate) namer: SymbolNamer,
}

impl<'ctx> MemoryView<'ctx> {
    /// Create an empty memory
    pub fn new(ctx: &'ctx Context, config: &MemoryConfig, namer: SymbolNamer) -> Self {
        Self::from_parts(
            ctx,
            ByteStore::new(),
            config.bits,
            config.memory_id.clone(),
            config.limit,
            namer,
        )
    }

    /// Create a memory initialised with concrete bytes
    pub fn with_backer<I>(
        ctx: &'ctx Context,
        config: &MemoryConfig,
        namer: SymbolNamer,
        backer: I,
    ) -> Self
    where
        I: IntoIterator<Item = (u64, u8)>,
    {
        let bits = config.bits;
        let store = backer
            .into_iter()
            .map(|(addr, byte)| (wrap_address(addr, bits), SymBitVec::from_u64(byte as u64, 8)))
            .collect();
        Self::from_parts(ctx, store, bits, config.memory_id.clone(), config.limit, namer)
    }

    pub(crate) fn from_parts(
        ctx: &'ctx Context,
        store: ByteStore<SymBitVec<'ctx>>,
        bits: u32,
        id: String,
        limit: usize,
        namer: SymbolNamer,
    ) -> Self {
        Self {
            ctx,
            store,
            bits,
            id,
            limit,
            namer,
        }
    }

    pub fn context(&self) -> &'ctx Context {
        self.ctx
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of bytes holding a value
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn byte_store(&self) -> &ByteStore<SymBitVec<'ctx>> {
        &self.store
    }

    pub fn namer(&self) -> &SymbolNamer {
        &self.namer
    }

    pub fn concretizer(&self) -> Concretizer {
        Concretizer::new(self.limit)
    }

    /// Reduce `addr` modulo 2^bits
    pub fn wrap(&self, addr: u64) -> u64 {
        wrap_address(addr, self.bits)
    }

    /// Byte at `addr` if one is stored, without materializing
    pub fn peek(&self, addr: u64) -> Option<SymBitVec<'ctx>> {
        self.store.get(self.wrap(addr))
    }

    fn read_byte(&mut self, addr: u64) -> SymBitVec<'ctx> {
        if let Some(byte) = self.store.get(addr) {
            return byte;
        }

        let name = self.namer.byte(&self.id, addr);
        debug!("materializing fresh byte {}", name);
        let byte = SymBitVec::symbolic(self.ctx, &name, 8);
        self.store.insert(addr, byte.clone());
        byte
    }

    fn read_from(&mut self, addr: u64, size: usize) -> MemoryResult<SymBitVec<'ctx>> {
        let mut bytes = Vec::with_capacity(size);
        for offset in 0..size as u64 {
            let at = self.wrap(addr.wrapping_add(offset));
            bytes.push(self.read_byte(at));
        }
        SymBitVec::concat_all(&bytes).ok_or_else(|| MemoryError::ZeroSizedAccess(format!("{:#x}", addr)))
    }

    fn write_to(&mut self, addr: u64, bytes: Vec<SymBitVec<'ctx>>) {
        for (offset, byte) in bytes.into_iter().enumerate() {
            let at = self.wrap(addr.wrapping_add(offset as u64));
            self.store.insert(at, byte);
        }
    }

    /// Read `size` bytes at `addr`
    ///
    /// Returns the value and the constraints the caller must add to the path.
    /// An ambiguous address yields a fresh value `m` constrained by
    /// `OR_c (m == value_at(c) AND addr == c)` over the read candidates.
    pub fn load(
        &mut self,
        path: &Path<'ctx>,
        addr: impl Into<Address<'ctx>>,
        size: usize,
    ) -> MemoryResult<(SymBitVec<'ctx>, Vec<SymBool<'ctx>>)> {
        let addr = addr.into();
        if size == 0 {
            return Err(MemoryError::ZeroSizedAccess(addr.to_string()));
        }

        let expr = addr.into_expr(self.bits);
        let addrs = match self.concretizer().resolve(path, &expr, &Strategy::READ)? {
            Resolution::Unique(at) => return Ok((self.read_from(at, size)?, Vec::new())),
            Resolution::Candidates(addrs) => addrs,
        };

        if let [at] = addrs.as_slice() {
            let value = self.read_from(*at, size)?;
            return Ok((value, vec![expr.eq_u64(*at, self.ctx)]));
        }

        let name = self.namer.addr(&self.id);
        let result = SymBitVec::symbolic(self.ctx, &name, (size * 8) as u32);
        let mut cases = Vec::with_capacity(addrs.len());
        for at in addrs {
            let value = self.read_from(at, size)?;
            cases.push(
                result
                    .eq(&value, self.ctx)
                    .and(&expr.eq_u64(at, self.ctx), self.ctx),
            );
        }

        debug!("load from {} split over {} addresses into {}", expr, cases.len(), name);
        Ok((result, vec![SymBool::or_all(self.ctx, cases)]))
    }

    /// Write `value` at `addr`
    ///
    /// An ambiguous address is written at its first write candidate `c` and the
    /// returned `addr == c` must be added to the path.
    pub fn store(
        &mut self,
        path: &Path<'ctx>,
        addr: impl Into<Address<'ctx>>,
        value: &SymBitVec<'ctx>,
    ) -> MemoryResult<Vec<SymBool<'ctx>>> {
        let bytes = value.to_byte_values()?;
        let expr = addr.into().into_expr(self.bits);

        match self.concretizer().resolve(path, &expr, &Strategy::WRITE)? {
            Resolution::Unique(at) => {
                self.write_to(at, bytes);
                Ok(Vec::new())
            }
            Resolution::Candidates(addrs) => {
                let at = *addrs
                    .first()
                    .ok_or_else(|| MemoryError::ConcretizationFailure(expr.to_string()))?;
                self.write_to(at, bytes);
                Ok(vec![expr.eq_u64(at, self.ctx)])
            }
        }
    }

    /// Whether `addr` resolves to a byte holding a value; never fails
    pub fn contains(&self, path: &Path<'ctx>, addr: impl Into<Address<'ctx>>) -> bool {
        let expr = addr.into().into_expr(self.bits);
        match self.concretizer().resolve(path, &expr, &[Strategy::Allocated]) {
            Ok(resolution) => resolution
                .addresses()
                .first()
                .map_or(false, |at| self.store.contains(self.wrap(*at))),
            Err(err) => {
                trace!("membership probe for {} missed: {}", expr, err);
                false
            }
        }
    }

    /// Branch this memory for a forked state
    pub fn copy(&self) -> Self {
        Self {
            ctx: self.ctx,
            store: self.store.branch(),
            bits: self.bits,
            id: self.id.clone(),
            limit: self.limit,
            namer: self.namer.clone(),
        }
    }

    /// Addresses that may differ between `self` and `other`
    pub fn changed_bytes(&self, other: &Self) -> MemoryResult<BTreeSet<u64>> {
        let Some(ancestor) = self.store.common_ancestor(&other.store) else {
            debug!(
                ours = self.store.head().index(),
                theirs = other.store.head().index(),
                "diffing '{}' against '{}' without a common ancestor",
                self.id,
                other.id
            );
            warn_code(
                WarningCode::SlowDiff,
                &format!(
                    "memories '{}' and '{}' share no history, diffing full key sets",
                    self.id, other.id
                ),
                false,
            );
            let ours = self.store.keys();
            let theirs = other.store.keys();
            return Ok(ours.union(&theirs).copied().collect());
        };

        let (mut changed, deleted) = self.store.changes_since(ancestor)?;
        changed.extend(deleted);
        let (other_changed, other_deleted) = other.store.changes_since(ancestor)?;
        changed.extend(other_changed);
        changed.extend(other_deleted);
        Ok(changed)
    }

    /// Validate merge inputs and collect the bytes that differ
    fn merge_plan(
        &self,
        others: &[Self],
        flag: &SymBitVec<'ctx>,
        flag_values: &[u64],
    ) -> MemoryResult<BTreeSet<u64>> {
        if flag_values.len() != others.len() + 1 {
            return Err(MemoryError::MergeArityMismatch {
                states: others.len() + 1,
                flag_values: flag_values.len(),
            });
        }

        let bits = flag.size();
        if let Some(value) = flag_values
            .iter()
            .find(|value| bits < 64 && **value >> bits != 0)
        {
            return Err(MemoryError::SelectorOutOfRange { value: *value, bits });
        }

        let mut changed = BTreeSet::new();
        for other in others {
            changed.extend(self.changed_bytes(other)?);
        }
        Ok(changed)
    }

    /// Replace the byte at `addr` with a fresh unconstrained symbol
    pub fn unconstrain_byte(&mut self, addr: u64) {
        let addr = self.wrap(addr);
        let name = self.namer.unconstrain(&self.id, addr);
        self.store
            .insert(addr, SymBitVec::symbolic(self.ctx, &name, 8));
    }

    /// Approximate merge: forget every byte that differs from `other`
    ///
    /// Returns the number of bytes unconstrained.
    pub fn unconstrain_differences(&mut self, other: &Self) -> MemoryResult<usize> {
        let changed = self.changed_bytes(other)?;
        for addr in &changed {
            self.unconstrain_byte(*addr);
        }
        debug!("unconstrained {} byte(s) of '{}'", changed.len(), self.id);
        Ok(changed.len())
    }

    /// Precise merge of `self` (index 0) with `others` (indices 1..)
    ///
    /// Each differing byte becomes a fresh symbol `merged` constrained by
    /// `OR_i (flag == flag_values[i] AND merged == byte_i)`. On error nothing
    /// is merged and the inputs come back inside the [`MergeError`].
    pub fn merge(
        mut self,
        mut others: Vec<Self>,
        flag: &SymBitVec<'ctx>,
        flag_values: &[u64],
    ) -> Result<MergeOutcome<'ctx>, MergeError<'ctx>> {
        let changed = match self.merge_plan(&others, flag, flag_values) {
            Ok(changed) => changed,
            Err(error) => {
                return Err(MergeError {
                    error,
                    memory: self,
                    others,
                })
            }
        };

        let ctx = self.ctx;
        let selectors: Vec<SymBool<'ctx>> = flag_values
            .iter()
            .map(|value| flag.eq_u64(*value, ctx))
            .collect();

        let mut constraints = Vec::with_capacity(changed.len());
        for addr in changed {
            let mut alternatives = Vec::with_capacity(others.len() + 1);
            alternatives.push(self.read_byte(addr));
            for other in others.iter_mut() {
                alternatives.push(other.read_byte(addr));
            }

            let name = self.namer.merge(&self.id, addr);
            let merged = SymBitVec::symbolic(ctx, &name, 8);
            let cases = selectors
                .iter()
                .zip(&alternatives)
                .map(|(selector, byte)| selector.and(&merged.eq(byte, ctx), ctx));
            constraints.push(SymBool::or_all(ctx, cases));
            self.store.insert(addr, merged);
        }

        debug!(
            "merged {} state(s) into '{}': {} byte(s) differ",
            others.len() + 1,
            self.id,
            constraints.len()
        );
        Ok(MergeOutcome {
            memory: self,
            constraints,
        })
    }
}

impl<'ctx> fmt::Debug for MemoryView<'ctx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryView")
            .field("id", &self.id)
            .field("bits", &self.bits)
            .field("limit", &self.limit)
            .field("len", &self.store.len())
            .field("depth", &self.store.depth())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use z3::Config;

    fn config(bits: u32) -> MemoryConfig {
        MemoryConfig {
            bits,
            ..MemoryConfig::default()
        }
    }

    #[derive(Clone, Default)]
    struct Capture(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_every_unrelated_diff_is_traced() {
        let capture = Capture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let cfg = Config::new();
            let ctx = Context::new(&cfg);
            let a = MemoryView::with_backer(&ctx, &config(64), SymbolNamer::new(), vec![(1, 1)]);
            let b = MemoryView::with_backer(&ctx, &config(64), SymbolNamer::new(), vec![(2, 2)]);
            for _ in 0..3 {
                assert_eq!(a.changed_bytes(&b).unwrap(), BTreeSet::from([1, 2]));
            }
        });

        let output = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        assert_eq!(output.matches("without a common ancestor").count(), 3);
    }

    #[test]
    fn test_backer_bytes_are_concrete() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let path = Path::new(&ctx);
        let mut mem =
            MemoryView::with_backer(&ctx, &config(64), SymbolNamer::new(), vec![(0, 0xca), (1, 0xfe)]);

        let (value, constraints) = mem.load(&path, 0u64, 2).unwrap();
        assert_eq!(value.as_u64().unwrap(), 0xcafe);
        assert!(constraints.is_empty());
    }

    #[test]
    fn test_unwritten_bytes_materialize_once() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let path = Path::new(&ctx);
        let mut mem = MemoryView::new(&ctx, &config(64), SymbolNamer::new());

        let (first, _) = mem.load(&path, 0x10u64, 1).unwrap();
        let (second, _) = mem.load(&path, 0x10u64, 1).unwrap();
        assert!(first.is_symbolic());
        assert_eq!(first, second);
        assert_eq!(first.to_string(), "mem_10_0");
        assert_eq!(mem.len(), 1);
    }

    #[test]
    fn test_addresses_wrap() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let path = Path::new(&ctx);
        let mut mem = MemoryView::new(&ctx, &config(16), SymbolNamer::new());

        mem.store(&path, 0xffffu64, &SymBitVec::from_u64(0xabcd, 16))
            .unwrap();
        assert_eq!(mem.peek(0xffff).unwrap().as_u64().unwrap(), 0xab);
        assert_eq!(mem.peek(0).unwrap().as_u64().unwrap(), 0xcd);
        assert_eq!(mem.peek(0x1_0000).unwrap().as_u64().unwrap(), 0xcd);
    }

    #[test]
    fn test_zero_sized_load() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let path = Path::new(&ctx);
        let mut mem = MemoryView::new(&ctx, &config(64), SymbolNamer::new());

        assert_eq!(
            mem.load(&path, 0x20u64, 0).unwrap_err(),
            MemoryError::ZeroSizedAccess("0x20".to_string())
        );
    }

    #[test]
    fn test_unaligned_store() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let path = Path::new(&ctx);
        let mut mem = MemoryView::new(&ctx, &config(64), SymbolNamer::new());

        assert_eq!(
            mem.store(&path, 0u64, &SymBitVec::from_u64(1, 4))
                .unwrap_err(),
            MemoryError::UnalignedValue(4)
        );
        assert!(mem.is_empty());
    }

    #[test]
    fn test_debug_output() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let mem = MemoryView::new(&ctx, &config(32), SymbolNamer::new());
        let rendered = format!("{:?}", mem);
        assert!(rendered.contains("bits: 32"));
        assert!(rendered.contains("\"mem\""));
    }
}
