// SPDX-License-Identifier: AGPL-3.0

//! Symbolic bit vectors backing the memory model
//!
//! This module wraps Z3 bit vectors and booleans with concrete fast paths:
//! operations on two concrete operands are computed with `BigUint` and never
//! reach the solver. Only the handful of operations the byte-granular memory
//! needs are provided (construction, concatenation, extraction, equality and
//! boolean connectives).

use num_bigint::BigUint;
use num_traits::{One, ToPrimitive, Zero};
use std::fmt;
use z3::ast::{Ast, Bool as Z3Bool, BV};
use z3::Context;

use simmem_exceptions::{MemoryError, MemoryResult};

fn mask(bit_size: u32) -> BigUint {
    if bit_size == 0 {
        BigUint::zero()
    } else {
        (BigUint::one() << bit_size as usize) - BigUint::one()
    }
}

fn normalize_biguint(value: BigUint, bit_size: u32) -> BigUint {
    if bit_size == 0 {
        BigUint::zero()
    } else {
        value & mask(bit_size)
    }
}

fn biguint_to_bv<'ctx>(ctx: &'ctx Context, value: &BigUint, bit_size: u32) -> BV<'ctx> {
    assert!(bit_size > 0, "Bit size must be greater than zero");

    if let Some(small) = value.to_u64() {
        return BV::from_u64(ctx, small, bit_size);
    }

    // Build the bitvector from 64-bit limbs, most significant first
    let limbs = (bit_size as usize + 63) / 64;
    let digits = value.to_u64_digits();
    let mut acc: Option<BV<'ctx>> = None;
    for i in (0..limbs).rev() {
        let limb = digits.get(i).copied().unwrap_or(0);
        let width = if i == limbs - 1 && bit_size % 64 != 0 {
            bit_size % 64
        } else {
            64
        };
        let part = BV::from_u64(ctx, limb, width);
        acc = Some(match acc {
            None => part,
            Some(high) => high.concat(&part),
        });
    }

    acc.unwrap_or_else(|| BV::from_u64(ctx, 0, bit_size))
}

/// Symbolic or concrete boolean value
#[derive(Clone)]
pub enum SymBool<'ctx> {
    Concrete(bool),
    Symbolic(Z3Bool<'ctx>),
}

impl<'ctx> SymBool<'ctx> {
    /// Create a new symbolic boolean, folding it to a constant when Z3 can
    pub fn from_z3(value: Z3Bool<'ctx>) -> Self {
        if let Some(simplified) = value.simplify().as_bool() {
            Self::Concrete(simplified)
        } else {
            Self::Symbolic(value)
        }
    }

    pub fn is_concrete(&self) -> bool {
        matches!(self, Self::Concrete(_))
    }

    pub fn is_symbolic(&self) -> bool {
        matches!(self, Self::Symbolic(_))
    }

    /// Check whether this is the literal true
    pub fn is_true(&self) -> bool {
        matches!(self, Self::Concrete(true))
    }

    /// Check whether this is the literal false
    pub fn is_false(&self) -> bool {
        matches!(self, Self::Concrete(false))
    }

    /// Get concrete value, returns error if symbolic
    pub fn as_bool(&self) -> MemoryResult<bool> {
        match self {
            Self::Concrete(b) => Ok(*b),
            Self::Symbolic(_) => Err(MemoryError::NotConcrete(
                "Boolean is symbolic".to_string(),
            )),
        }
    }

    /// Get as Z3 boolean
    pub fn as_z3(&self, ctx: &'ctx Context) -> Z3Bool<'ctx> {
        match self {
            Self::Concrete(b) => Z3Bool::from_bool(ctx, *b),
            Self::Symbolic(z3) => z3.clone(),
        }
    }

    /// Logical AND
    pub fn and(&self, other: &Self, ctx: &'ctx Context) -> Self {
        match (self, other) {
            (Self::Concrete(false), _) | (_, Self::Concrete(false)) => Self::Concrete(false),
            (Self::Concrete(true), other) => other.clone(),
            (this, Self::Concrete(true)) => this.clone(),
            (Self::Symbolic(a), Self::Symbolic(b)) => Self::from_z3(Z3Bool::and(ctx, &[a, b])),
        }
    }

    /// Logical OR
    pub fn or(&self, other: &Self, ctx: &'ctx Context) -> Self {
        match (self, other) {
            (Self::Concrete(true), _) | (_, Self::Concrete(true)) => Self::Concrete(true),
            (Self::Concrete(false), other) => other.clone(),
            (this, Self::Concrete(false)) => this.clone(),
            (Self::Symbolic(a), Self::Symbolic(b)) => Self::from_z3(Z3Bool::or(ctx, &[a, b])),
        }
    }

    /// Logical NOT
    pub fn not(&self) -> Self {
        match self {
            Self::Concrete(b) => Self::Concrete(!b),
            Self::Symbolic(z3) => Self::from_z3(z3.not()),
        }
    }

    /// N-ary conjunction; the empty conjunction is true
    pub fn and_all<I>(ctx: &'ctx Context, terms: I) -> Self
    where
        I: IntoIterator<Item = Self>,
    {
        let mut symbolic = Vec::new();
        for term in terms {
            match term {
                Self::Concrete(false) => return Self::Concrete(false),
                Self::Concrete(true) => {}
                Self::Symbolic(b) => symbolic.push(b),
            }
        }

        match symbolic.len() {
            0 => Self::Concrete(true),
            1 => Self::Symbolic(symbolic.remove(0)),
            _ => {
                let refs: Vec<&Z3Bool<'ctx>> = symbolic.iter().collect();
                Self::Symbolic(Z3Bool::and(ctx, &refs))
            }
        }
    }

    /// N-ary disjunction; the empty disjunction is false
    pub fn or_all<I>(ctx: &'ctx Context, terms: I) -> Self
    where
        I: IntoIterator<Item = Self>,
    {
        let mut symbolic = Vec::new();
        for term in terms {
            match term {
                Self::Concrete(true) => return Self::Concrete(true),
                Self::Concrete(false) => {}
                Self::Symbolic(b) => symbolic.push(b),
            }
        }

        match symbolic.len() {
            0 => Self::Concrete(false),
            1 => Self::Symbolic(symbolic.remove(0)),
            _ => {
                let refs: Vec<&Z3Bool<'ctx>> = symbolic.iter().collect();
                Self::Symbolic(Z3Bool::or(ctx, &refs))
            }
        }
    }
}

impl<'ctx> fmt::Debug for SymBool<'ctx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Concrete(b) => write!(f, "Bool({})", b),
            Self::Symbolic(z3) => write!(f, "Bool({})", z3),
        }
    }
}

impl<'ctx> fmt::Display for SymBool<'ctx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Concrete(b) => write!(f, "{}", b),
            Self::Symbolic(z3) => write!(f, "{}", z3),
        }
    }
}

/// Symbolic or concrete bit vector
#[derive(Clone)]
pub enum SymBitVec<'ctx> {
    Concrete { value: BigUint, size: u32 },
    Symbolic { value: BV<'ctx>, size: u32 },
}

impl<'ctx> SymBitVec<'ctx> {
    /// Create a concrete bit vector from u64
    pub fn from_u64(value: u64, size: u32) -> Self {
        Self::from_biguint(BigUint::from(value), size)
    }

    /// Create a concrete bit vector from BigUint, truncated to `size` bits
    pub fn from_biguint(value: BigUint, size: u32) -> Self {
        Self::Concrete {
            value: normalize_biguint(value, size),
            size,
        }
    }

    /// Wrap a Z3 bit vector
    pub fn from_z3(value: BV<'ctx>) -> Self {
        let size = value.get_size();
        Self::Symbolic { value, size }
    }

    /// Create a fresh symbolic variable
    pub fn symbolic(ctx: &'ctx Context, name: &str, size: u32) -> Self {
        Self::Symbolic {
            value: BV::new_const(ctx, name, size),
            size,
        }
    }

    /// Get the size in bits
    pub fn size(&self) -> u32 {
        match self {
            Self::Concrete { size, .. } => *size,
            Self::Symbolic { size, .. } => *size,
        }
    }

    pub fn is_concrete(&self) -> bool {
        matches!(self, Self::Concrete { .. })
    }

    pub fn is_symbolic(&self) -> bool {
        matches!(self, Self::Symbolic { .. })
    }

    /// Get concrete value as u64, returns error if symbolic or too large
    pub fn as_u64(&self) -> MemoryResult<u64> {
        match self {
            Self::Concrete { value, .. } => value
                .to_u64()
                .ok_or_else(|| MemoryError::NotConcrete("Value too large for u64".to_string())),
            Self::Symbolic { .. } => {
                Err(MemoryError::NotConcrete("BitVec is symbolic".to_string()))
            }
        }
    }

    /// Get as Z3 bit vector
    pub fn as_z3(&self, ctx: &'ctx Context) -> BV<'ctx> {
        match self {
            Self::Concrete { value, size } => biguint_to_bv(ctx, value, *size),
            Self::Symbolic { value, .. } => value.clone(),
        }
    }

    /// Concatenate two bitvectors (self || other)
    ///
    /// self becomes the high bits, other becomes the low bits
    pub fn concat(&self, other: &Self) -> Self {
        let new_size = self.size() + other.size();

        match (self, other) {
            (
                Self::Concrete { value: a, .. },
                Self::Concrete {
                    value: b,
                    size: b_size,
                },
            ) => {
                let shifted = a << (*b_size as usize);
                Self::from_biguint(shifted | b, new_size)
            }
            (Self::Symbolic { value: a, .. }, Self::Symbolic { value: b, .. }) => {
                Self::from_z3(a.concat(b))
            }
            (Self::Concrete { .. }, Self::Symbolic { value: b, .. }) => {
                let ctx = b.get_ctx();
                Self::from_z3(self.as_z3(ctx).concat(b))
            }
            (Self::Symbolic { value: a, .. }, Self::Concrete { .. }) => {
                let ctx = a.get_ctx();
                Self::from_z3(a.concat(&other.as_z3(ctx)))
            }
        }
    }

    /// Concatenate a sequence of bitvectors, first element in the high bits
    pub fn concat_all(parts: &[Self]) -> Option<Self> {
        let (first, rest) = parts.split_first()?;
        Some(rest.iter().fold(first.clone(), |acc, part| acc.concat(part)))
    }

    /// Extract bits `high..=low`
    pub fn extract(&self, high: u32, low: u32) -> Self {
        assert!(
            high >= low && high < self.size(),
            "invalid extract [{}:{}] of a {}-bit value",
            high,
            low,
            self.size()
        );

        match self {
            Self::Concrete { value, .. } => {
                Self::from_biguint(value >> (low as usize), high - low + 1)
            }
            Self::Symbolic { value, .. } => Self::from_z3(value.extract(high, low)),
        }
    }

    /// Split into big-endian bytes (first element is the most significant byte)
    pub fn to_byte_values(&self) -> MemoryResult<Vec<Self>> {
        let size = self.size();
        if size == 0 || size % 8 != 0 {
            return Err(MemoryError::UnalignedValue(size));
        }

        Ok((0..size / 8)
            .map(|i| {
                let high = size - 8 * i - 1;
                self.extract(high, high - 7)
            })
            .collect())
    }

    /// Compare equality
    pub fn eq(&self, other: &Self, ctx: &'ctx Context) -> SymBool<'ctx> {
        match (self, other) {
            (Self::Concrete { value: a, .. }, Self::Concrete { value: b, .. }) => {
                SymBool::Concrete(a == b)
            }
            _ => SymBool::from_z3(self.as_z3(ctx)._eq(&other.as_z3(ctx))),
        }
    }

    /// Compare equality against a concrete value of the same width
    pub fn eq_u64(&self, value: u64, ctx: &'ctx Context) -> SymBool<'ctx> {
        self.eq(&Self::from_u64(value, self.size()), ctx)
    }
}

impl<'ctx> PartialEq for SymBitVec<'ctx> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::Concrete { value: a, size: sa },
                Self::Concrete { value: b, size: sb },
            ) => sa == sb && a == b,
            (Self::Symbolic { value: a, .. }, Self::Symbolic { value: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl<'ctx> fmt::Debug for SymBitVec<'ctx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Concrete { value, size } => write!(f, "BV({:#x}, {})", value, size),
            Self::Symbolic { value, size } => write!(f, "BV({}, {})", value, size),
        }
    }
}

impl<'ctx> fmt::Display for SymBitVec<'ctx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Concrete { value, .. } => write!(f, "{:#x}", value),
            Self::Symbolic { value, .. } => write!(f, "{}", value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use z3::Config;

    #[test]
    fn test_concrete_concat_and_extract() {
        let hi = SymBitVec::from_u64(0x12, 8);
        let lo = SymBitVec::from_u64(0x34, 8);

        let word = hi.concat(&lo);
        assert_eq!(word.size(), 16);
        assert_eq!(word.as_u64().unwrap(), 0x1234);
        assert_eq!(word.extract(15, 8).as_u64().unwrap(), 0x12);
        assert_eq!(word.extract(7, 0).as_u64().unwrap(), 0x34);
    }

    #[test]
    fn test_to_byte_values_is_big_endian() {
        let value = SymBitVec::from_u64(0x11223344, 32);
        let bytes: Vec<u64> = value
            .to_byte_values()
            .unwrap()
            .iter()
            .map(|b| b.as_u64().unwrap())
            .collect();
        assert_eq!(bytes, vec![0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn test_to_byte_values_rejects_unaligned() {
        let value = SymBitVec::from_u64(1, 12);
        assert_eq!(
            value.to_byte_values().unwrap_err(),
            MemoryError::UnalignedValue(12)
        );
    }

    #[test]
    fn test_concat_all() {
        let parts = vec![
            SymBitVec::from_u64(0xde, 8),
            SymBitVec::from_u64(0xad, 8),
            SymBitVec::from_u64(0xbe, 8),
            SymBitVec::from_u64(0xef, 8),
        ];
        let word = SymBitVec::concat_all(&parts).unwrap();
        assert_eq!(word.as_u64().unwrap(), 0xdeadbeef);
        assert!(SymBitVec::concat_all(&[]).is_none());
    }

    #[test]
    fn test_mixed_concat_goes_symbolic() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);

        let x = SymBitVec::symbolic(&ctx, "x", 8);
        let word = SymBitVec::from_u64(0xff, 8).concat(&x);
        assert!(word.is_symbolic());
        assert_eq!(word.size(), 16);
    }

    #[test]
    fn test_wide_constant_round_trips_through_z3() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);

        let value = (BigUint::one() << 100usize) + BigUint::from(5u32);
        let bv = SymBitVec::from_biguint(value, 128);
        let z3 = bv.as_z3(&ctx);
        assert_eq!(z3.get_size(), 128);
        let low = z3.extract(63, 0).simplify();
        assert_eq!(low.as_u64(), Some(5));
        let high = z3.extract(127, 64).simplify();
        assert_eq!(high.as_u64(), Some(1 << 36));
    }

    #[test]
    fn test_bool_folding() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);

        let x = SymBitVec::symbolic(&ctx, "x", 8);
        let cond = x.eq_u64(1, &ctx);
        assert!(cond.is_symbolic());

        assert!(cond.and(&SymBool::Concrete(false), &ctx).is_false());
        assert!(cond.or(&SymBool::Concrete(true), &ctx).is_true());
        assert!(SymBool::or_all(&ctx, Vec::new()).is_false());
        assert!(SymBool::and_all(&ctx, Vec::new()).is_true());
        assert!(SymBool::or_all(&ctx, vec![cond.clone(), SymBool::Concrete(false)]).is_symbolic());
    }

    #[test]
    fn test_structural_equality() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);

        let a = SymBitVec::symbolic(&ctx, "a", 8);
        let a_again = SymBitVec::symbolic(&ctx, "a", 8);
        let b = SymBitVec::symbolic(&ctx, "b", 8);
        assert_eq!(a, a_again);
        assert_ne!(a, b);
        assert_eq!(SymBitVec::from_u64(3, 8), SymBitVec::from_u64(3, 8));
        assert_ne!(SymBitVec::from_u64(3, 8), SymBitVec::from_u64(3, 16));
    }
}
