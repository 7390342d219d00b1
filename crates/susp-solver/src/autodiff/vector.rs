//! 3-vector expression nodes

use std::cell::Cell;
use std::collections::BTreeSet;
use std::fmt;
use std::rc::Rc;

use glam::DVec3;
use nalgebra::DMatrix;

use super::{
    EvalContext, Gradients, Leaf, RotationMatrix, Scalar, collect_leaf, column, dmat3,
    least_aligned_axis, skew,
};
use crate::variable::VarId;

enum VectorOp {
    Constant(DVec3),
    Variable(Leaf),
    Compose([Scalar; 3]),
    Add(Vector, Vector),
    Sub(Vector, Vector),
    Scale(Scalar, Vector),
    Cross(Vector, Vector),
    Normalize(Vector),
    Rotate(RotationMatrix, Vector),
}

struct VectorNode {
    op: VectorOp,
    cache: Cell<(u64, DVec3)>,
}

/// Shared handle to a 3-vector expression
#[derive(Clone)]
pub struct Vector(Rc<VectorNode>);

impl fmt::Debug for Vector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Vector({})", self.value())
    }
}

impl Vector {
    fn from_op(op: VectorOp) -> Self {
        Self(Rc::new(VectorNode {
            op,
            cache: Cell::new((0, DVec3::ZERO)),
        }))
    }

    pub fn constant(value: DVec3) -> Self {
        Self::from_op(VectorOp::Constant(value))
    }

    /// Three consecutive components of a variable
    pub fn variable(leaf: Leaf) -> Self {
        Self::from_op(VectorOp::Variable(leaf))
    }

    pub fn from_scalars(x: Scalar, y: Scalar, z: Scalar) -> Self {
        Self::from_op(VectorOp::Compose([x, y, z]))
    }

    pub fn add(&self, rhs: &Vector) -> Self {
        Self::from_op(VectorOp::Add(self.clone(), rhs.clone()))
    }

    pub fn sub(&self, rhs: &Vector) -> Self {
        Self::from_op(VectorOp::Sub(self.clone(), rhs.clone()))
    }

    /// `factor * self`
    pub fn scale(&self, factor: &Scalar) -> Self {
        Self::from_op(VectorOp::Scale(factor.clone(), self.clone()))
    }

    pub fn scale_by(&self, factor: f64) -> Self {
        self.scale(&Scalar::constant(factor))
    }

    pub fn cross(&self, rhs: &Vector) -> Self {
        Self::from_op(VectorOp::Cross(self.clone(), rhs.clone()))
    }

    pub fn normalize(&self) -> Self {
        Self::from_op(VectorOp::Normalize(self.clone()))
    }

    pub fn dot(&self, rhs: &Vector) -> Scalar {
        Scalar::dot(self, rhs)
    }

    pub fn length(&self) -> Scalar {
        Scalar::length(self)
    }

    pub(crate) fn rotated(matrix: RotationMatrix, v: &Vector) -> Self {
        Self::from_op(VectorOp::Rotate(matrix, v.clone()))
    }

    /// Unit vector orthogonal to this expression. The helper axis is chosen
    /// from `hint` (the expected direction) once, so the result stays smooth
    /// while the expression moves.
    pub fn stable_orthogonal(&self, hint: DVec3) -> Self {
        self.cross(&Vector::constant(least_aligned_axis(hint)))
            .normalize()
    }

    /// Recompute the cached value unless already done in this pass
    pub fn reset(&self, ctx: &EvalContext) {
        if self.0.cache.get().0 == ctx.epoch() {
            return;
        }
        let value = match &self.0.op {
            VectorOp::Constant(v) => *v,
            VectorOp::Variable(leaf) => DVec3::new(
                ctx.component(leaf.var, leaf.offset),
                ctx.component(leaf.var, leaf.offset + 1),
                ctx.component(leaf.var, leaf.offset + 2),
            ),
            VectorOp::Compose(s) => {
                for c in s {
                    c.reset(ctx);
                }
                DVec3::new(s[0].value(), s[1].value(), s[2].value())
            }
            VectorOp::Add(a, b) => {
                a.reset(ctx);
                b.reset(ctx);
                a.value() + b.value()
            }
            VectorOp::Sub(a, b) => {
                a.reset(ctx);
                b.reset(ctx);
                a.value() - b.value()
            }
            VectorOp::Scale(s, v) => {
                s.reset(ctx);
                v.reset(ctx);
                v.value() * s.value()
            }
            VectorOp::Cross(a, b) => {
                a.reset(ctx);
                b.reset(ctx);
                a.value().cross(b.value())
            }
            VectorOp::Normalize(v) => {
                v.reset(ctx);
                v.value().normalize_or_zero()
            }
            VectorOp::Rotate(m, v) => {
                m.reset(ctx);
                v.reset(ctx);
                m.value() * v.value()
            }
        };
        self.0.cache.set((ctx.epoch(), value));
    }

    /// Value cached by the last `reset`
    pub fn value(&self) -> DVec3 {
        self.0.cache.get().1
    }

    /// Propagate an `m × 3` upstream block to the leaves
    pub fn diff(&self, upstream: &DMatrix<f64>, grads: &mut Gradients) {
        match &self.0.op {
            VectorOp::Constant(_) => {}
            VectorOp::Variable(leaf) => grads.accumulate(*leaf, upstream),
            VectorOp::Compose(s) => {
                for (i, c) in s.iter().enumerate() {
                    c.diff(&upstream.columns(i, 1).into_owned(), grads);
                }
            }
            VectorOp::Add(a, b) => {
                a.diff(upstream, grads);
                b.diff(upstream, grads);
            }
            VectorOp::Sub(a, b) => {
                a.diff(upstream, grads);
                b.diff(&-upstream, grads);
            }
            VectorOp::Scale(s, v) => {
                s.diff(&(upstream * column(v.value())), grads);
                v.diff(&(upstream * s.value()), grads);
            }
            VectorOp::Cross(a, b) => {
                // d(a×b) = a×db - b×da
                a.diff(&(upstream * -skew(b.value())), grads);
                b.diff(&(upstream * skew(a.value())), grads);
            }
            VectorOp::Normalize(v) => {
                let value = v.value();
                let length = value.length();
                if length > 0.0 {
                    let n = value / length;
                    let projector = DMatrix::from_fn(3, 3, |r, c| {
                        let identity = if r == c { 1.0 } else { 0.0 };
                        (identity - n[r] * n[c]) / length
                    });
                    v.diff(&(upstream * projector), grads);
                }
            }
            VectorOp::Rotate(m, v) => {
                v.diff(&(upstream * dmat3(&m.value())), grads);
                m.diff(v.value(), upstream, grads);
            }
        }
    }

    /// Variables this expression depends on
    pub fn collect_variables(&self, out: &mut BTreeSet<VarId>) {
        match &self.0.op {
            VectorOp::Constant(_) => {}
            VectorOp::Variable(leaf) => collect_leaf(leaf, out),
            VectorOp::Compose(s) => {
                for c in s {
                    c.collect_variables(out);
                }
            }
            VectorOp::Add(a, b) | VectorOp::Sub(a, b) | VectorOp::Cross(a, b) => {
                a.collect_variables(out);
                b.collect_variables(out);
            }
            VectorOp::Scale(s, v) => {
                s.collect_variables(out);
                v.collect_variables(out);
            }
            VectorOp::Normalize(v) => v.collect_variables(out),
            VectorOp::Rotate(m, v) => {
                m.collect_variables(out);
                v.collect_variables(out);
            }
        }
    }

    /// Evaluate and differentiate in one call: returns the value and the
    /// `3 × dof` gradient blocks
    pub fn jacobian(&self, ctx: &EvalContext) -> (DVec3, Gradients) {
        self.reset(ctx);
        let mut grads = Gradients::new(3);
        self.diff(&DMatrix::identity(3, 3), &mut grads);
        (self.value(), grads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::testing::{scalar_variables, vector_of};
    use approx::assert_relative_eq;

    /// Central finite differences of `f` over all scalar variables
    fn numeric(expr: &Vector, values: &[f64]) -> DMatrix<f64> {
        let h = 1e-6;
        let mut j = DMatrix::zeros(3, values.len());
        for c in 0..values.len() {
            let mut plus = values.to_vec();
            plus[c] += h;
            let mut minus = values.to_vec();
            minus[c] -= h;
            let vp = scalar_variables(&plus);
            expr.reset(&EvalContext::new(100 + 2 * c as u64, &vp));
            let fp = expr.value();
            let vm = scalar_variables(&minus);
            expr.reset(&EvalContext::new(101 + 2 * c as u64, &vm));
            let fm = expr.value();
            let d = (fp - fm) / (2.0 * h);
            for r in 0..3 {
                j[(r, c)] = d[r];
            }
        }
        j
    }

    fn analytic(expr: &Vector, values: &[f64]) -> DMatrix<f64> {
        let variables = scalar_variables(values);
        let ctx = EvalContext::new(1, &variables);
        let (_, grads) = expr.jacobian(&ctx);
        let mut j = DMatrix::zeros(3, values.len());
        grads.set_jacobian(&ctx, &mut j, 0);
        j
    }

    fn assert_matches_finite_differences(expr: &Vector, values: &[f64]) {
        let a = analytic(expr, values);
        let n = numeric(expr, values);
        for r in 0..a.nrows() {
            for c in 0..a.ncols() {
                assert_relative_eq!(a[(r, c)], n[(r, c)], epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_cross_partials() {
        let expr = vector_of(0).cross(&vector_of(3));
        assert_matches_finite_differences(&expr, &[1.0, -2.0, 0.5, 0.3, 0.7, -1.1]);
    }

    #[test]
    fn test_normalize_partials() {
        let expr = vector_of(0).normalize();
        assert_matches_finite_differences(&expr, &[1.0, 2.0, -0.5]);
    }

    #[test]
    fn test_scale_and_sub_partials() {
        let s = Scalar::dot(&vector_of(0), &vector_of(0));
        let expr = vector_of(0).scale(&s).sub(&vector_of(3));
        assert_matches_finite_differences(&expr, &[0.2, -0.4, 0.9, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_stable_orthogonal_node() {
        let v = vector_of(0);
        let o = v.stable_orthogonal(DVec3::new(1.0, 0.1, 0.0));
        let variables = scalar_variables(&[1.0, 0.1, 0.0]);
        o.reset(&EvalContext::new(1, &variables));
        assert_relative_eq!(o.value().length(), 1.0, epsilon = 1e-12);
        assert!(o.value().dot(DVec3::new(1.0, 0.1, 0.0)).abs() < 1e-12);
        assert_matches_finite_differences(&o, &[1.0, 0.1, 0.0]);
    }

    #[test]
    fn test_shared_node_evaluated_once_per_pass() {
        let shared = vector_of(0).add(&Vector::constant(DVec3::ONE));
        let sum = shared.add(&shared);
        let variables = scalar_variables(&[1.0, 2.0, 3.0]);
        sum.reset(&EvalContext::new(1, &variables));
        assert_eq!(sum.value(), DVec3::new(4.0, 6.0, 8.0));
        let j = analytic(&sum, &[1.0, 2.0, 3.0]);
        assert_relative_eq!(j[(0, 0)], 2.0);
        assert_relative_eq!(j[(1, 0)], 0.0);
    }
}
