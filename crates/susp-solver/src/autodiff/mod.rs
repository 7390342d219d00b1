//! Reverse-mode computation graph
//!
//! Expressions are reference-counted node DAGs over scalars, 3-vectors and
//! quaternion rotation matrices. Each evaluation pass carries a fresh epoch;
//! a node recomputes its cached value only when its stored epoch is stale,
//! so sub-expressions shared by several constraints are evaluated once.
//!
//! `diff` propagates an upstream Jacobian block (`m × 3` for vectors,
//! `m × 1` for scalars) down to the variable leaves, accumulating into
//! [`Gradients`], which then scatters the blocks into a caller-owned
//! Jacobian with [`Gradients::set_jacobian`].

mod rotation;
mod scalar;
mod vector;

use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use glam::{DMat3, DVec3};
use nalgebra::DMatrix;

use crate::variable::{VarId, Variable};

pub use rotation::{Rotation, RotationMatrix};
pub use scalar::{Scalar, ScalarFunction};
pub use vector::Vector;

/// Monotonic evaluation-pass counter
#[derive(Debug, Default)]
pub struct Epoch(u64);

impl Epoch {
    /// Start a new evaluation pass
    pub fn next(&mut self) -> u64 {
        self.0 += 1;
        self.0
    }
}

/// Read-only view of the variable values for one evaluation pass
pub struct EvalContext<'a> {
    epoch: u64,
    variables: &'a [Variable],
}

impl<'a> EvalContext<'a> {
    pub fn new(epoch: u64, variables: &'a [Variable]) -> Self {
        Self { epoch, variables }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Scalar component `offset` of a variable
    pub fn component(&self, var: VarId, offset: usize) -> f64 {
        self.variables[var.0].component(offset)
    }

    pub fn variables(&self) -> &'a [Variable] {
        self.variables
    }
}

/// Location of a differentiable leaf inside a variable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Leaf {
    pub var: VarId,
    /// Degrees of freedom of the whole variable
    pub dof: usize,
    /// First component of the leaf within the variable
    pub offset: usize,
}

/// A scalar whose value can be changed between solves (controlled offsets,
/// spring free lengths)
#[derive(Debug, Clone, Default)]
pub struct Parameter(Rc<Cell<f64>>);

impl Parameter {
    pub fn new(value: f64) -> Self {
        Self(Rc::new(Cell::new(value)))
    }

    pub fn get(&self) -> f64 {
        self.0.get()
    }

    pub fn set(&self, value: f64) {
        self.0.set(value);
    }
}

/// Accumulated partial derivatives of an `m`-row expression, per variable
#[derive(Debug, Clone)]
pub struct Gradients {
    rows: usize,
    blocks: BTreeMap<VarId, DMatrix<f64>>,
}

impl Gradients {
    pub fn new(rows: usize) -> Self {
        Self {
            rows,
            blocks: BTreeMap::new(),
        }
    }

    /// Add `contribution` (`rows × width`) at column `leaf.offset` of the
    /// variable's block
    pub fn accumulate(&mut self, leaf: Leaf, contribution: &DMatrix<f64>) {
        let rows = self.rows;
        let block = self
            .blocks
            .entry(leaf.var)
            .or_insert_with(|| DMatrix::zeros(rows, leaf.dof));
        for r in 0..contribution.nrows() {
            for c in 0..contribution.ncols() {
                block[(r, leaf.offset + c)] += contribution[(r, c)];
            }
        }
    }

    /// Accumulated block of one variable
    pub fn block(&self, var: VarId) -> Option<&DMatrix<f64>> {
        self.blocks.get(&var)
    }

    /// Variables that received a contribution
    pub fn variables(&self) -> impl Iterator<Item = VarId> + '_ {
        self.blocks.keys().copied()
    }

    /// Scatter every block into `target` starting at `row`, using each
    /// variable's column and scale. Variables without a column are skipped.
    pub fn set_jacobian(&self, ctx: &EvalContext, target: &mut DMatrix<f64>, row: usize) {
        for (var, block) in &self.blocks {
            let variable = &ctx.variables()[var.0];
            let Some(col) = variable.col() else {
                continue;
            };
            let scale = variable.scale();
            for r in 0..block.nrows() {
                for c in 0..block.ncols() {
                    target[(row + r, col + c)] += block[(r, c)] * scale;
                }
            }
        }
    }
}

/// Leaves reachable from an expression
pub(crate) fn collect_leaf(leaf: &Leaf, out: &mut BTreeSet<VarId>) {
    out.insert(leaf.var);
}

/// `3 × 3` glam matrix as nalgebra
pub fn dmat3(m: &DMat3) -> DMatrix<f64> {
    DMatrix::from_fn(3, 3, |r, c| m.col(c)[r])
}

/// Column vector `3 × 1`
pub fn column(v: DVec3) -> DMatrix<f64> {
    DMatrix::from_column_slice(3, 1, &[v.x, v.y, v.z])
}

/// Row vector `1 × 3`
pub fn row(v: DVec3) -> DMatrix<f64> {
    DMatrix::from_row_slice(1, 3, &[v.x, v.y, v.z])
}

/// Cross-product matrix: `skew(a) * b == a × b`
pub fn skew(a: DVec3) -> DMatrix<f64> {
    DMatrix::from_row_slice(3, 3, &[0.0, -a.z, a.y, a.z, 0.0, -a.x, -a.y, a.x, 0.0])
}

/// Unit vector orthogonal to `v`, built against the axis `v` is least
/// aligned with
pub fn stable_orthogonal(v: DVec3) -> DVec3 {
    v.cross(least_aligned_axis(v)).normalize()
}

/// Coordinate axis with the smallest component in `v`
pub fn least_aligned_axis(v: DVec3) -> DVec3 {
    let a = v.abs();
    if a.x <= a.y && a.x <= a.z {
        DVec3::X
    } else if a.y <= a.z {
        DVec3::Y
    } else {
        DVec3::Z
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Finite-difference helpers shared by the node tests

    use super::*;
    use crate::variable::{ScalarVariable, Variable};

    /// Variables holding plain scalars, one per entry
    pub fn scalar_variables(values: &[f64]) -> Vec<Variable> {
        values
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                let mut variable = Variable::from(ScalarVariable::new(format!("s{i}"), v));
                variable.set_col(Some(i));
                variable
            })
            .collect()
    }

    /// Scalar leaf of variable `i`
    pub fn leaf(i: usize) -> Leaf {
        Leaf {
            var: VarId(i),
            dof: 1,
            offset: 0,
        }
    }

    /// Vector built from three scalar variables
    pub fn vector_of(i: usize) -> Vector {
        Vector::from_scalars(
            Scalar::variable(leaf(i)),
            Scalar::variable(leaf(i + 1)),
            Scalar::variable(leaf(i + 2)),
        )
    }
}
