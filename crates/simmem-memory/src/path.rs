// SPDX-License-Identifier: AGPL-3.0

//! Path constraints and the solver queries run against them
//!
//! Paths share a single reference-counted solver. Every query pushes a scope,
//! asserts the path's own conditions, checks and pops, so sibling paths never
//! observe each other's constraints.

use std::rc::Rc;
use z3::ast::{Ast, Bool as Z3Bool, BV};
use z3::{Context, Params, SatResult, Solver};

use simmem_bitvec::{SymBitVec, SymBool};
use simmem_exceptions::{MemoryError, MemoryResult};

/// Ordered set of constraints describing one execution path
#[derive(Debug)]
pub struct Path<'ctx> {
    ctx: &'ctx Context,
    /// Reference-counted solver - allows multiple paths to share one solver instance
    solver: Rc<Solver<'ctx>>,
    conditions: Vec<Z3Bool<'ctx>>,
}

impl<'ctx> Clone for Path<'ctx> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx,
            solver: Rc::clone(&self.solver),
            conditions: self.conditions.clone(),
        }
    }
}

impl<'ctx> Path<'ctx> {
    /// Create an empty path with its own solver
    pub fn new(ctx: &'ctx Context) -> Self {
        Self::with_solver(ctx, Rc::new(Solver::new(ctx)))
    }

    /// Create an empty path on a shared solver
    pub fn with_solver(ctx: &'ctx Context, solver: Rc<Solver<'ctx>>) -> Self {
        Self {
            ctx,
            solver,
            conditions: Vec::new(),
        }
    }

    /// Apply a per-query timeout in milliseconds (0 disables it)
    pub fn with_timeout(self, timeout_ms: u64) -> Self {
        if timeout_ms > 0 {
            let mut params = Params::new(self.ctx);
            params.set_u32("timeout", timeout_ms.min(u32::MAX as u64) as u32);
            self.solver.set_params(&params);
        }
        self
    }

    pub fn context(&self) -> &'ctx Context {
        self.ctx
    }

    pub fn solver(&self) -> &Rc<Solver<'ctx>> {
        &self.solver
    }

    pub fn conditions(&self) -> &[Z3Bool<'ctx>] {
        &self.conditions
    }

    /// Add a constraint; literal true and duplicates are skipped
    pub fn append(&mut self, cond: SymBool<'ctx>) {
        if cond.is_true() {
            return;
        }

        let cond = cond.as_z3(self.ctx);
        if self.conditions.iter().any(|c| *c == cond) {
            return;
        }

        self.conditions.push(cond);
    }

    pub fn extend<I>(&mut self, conds: I)
    where
        I: IntoIterator<Item = SymBool<'ctx>>,
    {
        for cond in conds {
            self.append(cond);
        }
    }

    /// Fork the path; the copy shares the solver but not future conditions
    pub fn branch(&self) -> Self {
        self.clone()
    }

    /// Run `f` in a solver scope holding this path's conditions
    fn scoped<R>(&self, f: impl FnOnce(&Solver<'ctx>) -> R) -> R {
        self.solver.push();
        for cond in &self.conditions {
            self.solver.assert(cond);
        }
        let result = f(&self.solver);
        self.solver.pop(1);
        result
    }

    fn sat(result: SatResult) -> MemoryResult<bool> {
        match result {
            SatResult::Sat => Ok(true),
            SatResult::Unsat => Ok(false),
            SatResult::Unknown => Err(MemoryError::SolverUnknown(
                "query did not finish".to_string(),
            )),
        }
    }

    fn model_value(solver: &Solver<'ctx>, bv: &BV<'ctx>) -> MemoryResult<u64> {
        solver
            .get_model()
            .and_then(|model| model.eval(bv, true))
            .and_then(|value| value.as_u64())
            .ok_or_else(|| MemoryError::SolverUnknown(format!("no model value for {}", bv)))
    }

    fn symbolic_operand(&self, expr: &SymBitVec<'ctx>) -> MemoryResult<BV<'ctx>> {
        if expr.size() > 64 {
            return Err(MemoryError::TooWide(expr.size()));
        }
        Ok(expr.as_z3(self.ctx))
    }

    /// Whether the path's conditions admit at least one model
    pub fn is_satisfiable(&self) -> MemoryResult<bool> {
        self.scoped(|solver| Self::sat(solver.check()))
    }

    /// Whether the path's conditions together with `cond` are satisfiable
    pub fn check(&self, cond: &SymBool<'ctx>) -> MemoryResult<bool> {
        match cond {
            SymBool::Concrete(false) => Ok(false),
            SymBool::Concrete(true) => self.is_satisfiable(),
            SymBool::Symbolic(b) => self.scoped(|solver| {
                solver.assert(b);
                Self::sat(solver.check())
            }),
        }
    }

    /// One value `expr` may take on this path
    pub fn any(&self, expr: &SymBitVec<'ctx>) -> MemoryResult<u64> {
        if expr.is_concrete() {
            return expr.as_u64();
        }

        let bv = self.symbolic_operand(expr)?;
        self.scoped(|solver| {
            if !Self::sat(solver.check())? {
                return Err(MemoryError::UnsatAddress(expr.to_string()));
            }
            Self::model_value(solver, &bv)
        })
    }

    /// Up to `n` distinct values `expr` may take, in ascending order
    pub fn any_n(&self, expr: &SymBitVec<'ctx>, n: usize) -> MemoryResult<Vec<u64>> {
        if expr.is_concrete() {
            return Ok(vec![expr.as_u64()?]);
        }

        let bv = self.symbolic_operand(expr)?;
        let size = expr.size();
        let mut values = self.scoped(|solver| -> MemoryResult<Vec<u64>> {
            let mut values = Vec::new();
            while values.len() < n {
                if !Self::sat(solver.check())? {
                    break;
                }
                let value = Self::model_value(solver, &bv)?;
                solver.assert(&bv._eq(&BV::from_u64(self.ctx, value, size)).not());
                values.push(value);
            }
            Ok(values)
        })?;

        values.sort_unstable();
        Ok(values)
    }

    /// Smallest value `expr` may take on this path
    pub fn min(&self, expr: &SymBitVec<'ctx>) -> MemoryResult<u64> {
        if expr.is_concrete() {
            return expr.as_u64();
        }

        let bv = self.symbolic_operand(expr)?;
        let size = expr.size();
        self.scoped(|solver| {
            if !Self::sat(solver.check())? {
                return Err(MemoryError::UnsatAddress(expr.to_string()));
            }

            let mut lo: u128 = 0;
            let mut hi: u128 = Self::model_value(solver, &bv)? as u128;
            while lo < hi {
                let mid = (lo + hi) / 2;
                solver.push();
                solver.assert(&bv.bvule(&BV::from_u64(self.ctx, mid as u64, size)));
                let below = Self::sat(solver.check());
                solver.pop(1);
                if below? {
                    hi = mid;
                } else {
                    lo = mid + 1;
                }
            }
            Ok(lo as u64)
        })
    }

    /// Largest value `expr` may take on this path
    pub fn max(&self, expr: &SymBitVec<'ctx>) -> MemoryResult<u64> {
        if expr.is_concrete() {
            return expr.as_u64();
        }

        let bv = self.symbolic_operand(expr)?;
        let size = expr.size();
        self.scoped(|solver| {
            if !Self::sat(solver.check())? {
                return Err(MemoryError::UnsatAddress(expr.to_string()));
            }

            let mut lo: u128 = Self::model_value(solver, &bv)? as u128;
            let mut hi: u128 = (1u128 << size) - 1;
            while lo < hi {
                let mid = (lo + hi + 1) / 2;
                solver.push();
                solver.assert(&bv.bvuge(&BV::from_u64(self.ctx, mid as u64, size)));
                let above = Self::sat(solver.check());
                solver.pop(1);
                if above? {
                    lo = mid;
                } else {
                    hi = mid - 1;
                }
            }
            Ok(lo as u64)
        })
    }

    /// Whether `expr` has exactly one value on this path
    pub fn is_unique(&self, expr: &SymBitVec<'ctx>) -> MemoryResult<bool> {
        if expr.is_concrete() {
            return Ok(true);
        }

        let value = self.any(expr)?;
        Ok(!self.check(&expr.eq_u64(value, self.ctx).not())?)
    }
}
