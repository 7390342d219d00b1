//! Quaternion-driven rotation matrices
//!
//! The quaternion `(w, x, y, z)` is differentiated as four independent
//! scalars. With `u = (x, y, z)` the rotation map is
//!
//! `R v = (w² - u·u) v + 2 (u·v) u + 2 w (u × v)`
//!
//! which equals the usual rotation for unit quaternions and is used for both
//! the value and the partials so they stay consistent between renormalizations.

use std::cell::Cell;
use std::collections::BTreeSet;
use std::rc::Rc;

use glam::{DMat3, DQuat, DVec3};
use nalgebra::DMatrix;

use super::{EvalContext, Gradients, Leaf, Vector, collect_leaf, skew};
use crate::variable::VarId;

enum QuaternionSource {
    Constant(DQuat),
    /// Four consecutive components `(w, x, y, z)` of a variable
    Variable(Leaf),
}

struct RotationNode {
    source: QuaternionSource,
    cache: Cell<(u64, [f64; 4])>,
}

/// A quaternion leaf of the computation graph
#[derive(Clone)]
pub struct Rotation(Rc<RotationNode>);

impl Rotation {
    pub fn constant(q: DQuat) -> Self {
        Self(Rc::new(RotationNode {
            source: QuaternionSource::Constant(q),
            cache: Cell::new((0, [q.w, q.x, q.y, q.z])),
        }))
    }

    pub fn variable(leaf: Leaf) -> Self {
        Self(Rc::new(RotationNode {
            source: QuaternionSource::Variable(leaf),
            cache: Cell::new((0, [1.0, 0.0, 0.0, 0.0])),
        }))
    }

    /// Rotation matrix node `R(q)`
    pub fn matrix(&self) -> RotationMatrix {
        RotationMatrix {
            rotation: self.clone(),
            transposed: false,
        }
    }

    /// Inverse rotation matrix node `R(q)ᵀ`
    pub fn inverse(&self) -> RotationMatrix {
        RotationMatrix {
            rotation: self.clone(),
            transposed: true,
        }
    }

    /// `R(q) v`
    pub fn rotate(&self, v: &Vector) -> Vector {
        Vector::rotated(self.matrix(), v)
    }

    /// `R(q)ᵀ v`
    pub fn inverse_rotate(&self, v: &Vector) -> Vector {
        Vector::rotated(self.inverse(), v)
    }

    fn reset(&self, ctx: &EvalContext) {
        if self.0.cache.get().0 == ctx.epoch() {
            return;
        }
        let q = match &self.0.source {
            QuaternionSource::Constant(q) => [q.w, q.x, q.y, q.z],
            QuaternionSource::Variable(leaf) => [
                ctx.component(leaf.var, leaf.offset),
                ctx.component(leaf.var, leaf.offset + 1),
                ctx.component(leaf.var, leaf.offset + 2),
                ctx.component(leaf.var, leaf.offset + 3),
            ],
        };
        self.0.cache.set((ctx.epoch(), q));
    }

    fn components(&self) -> [f64; 4] {
        self.0.cache.get().1
    }
}

/// `R(q)` or `R(q)ᵀ` as a differentiable matrix node
#[derive(Clone)]
pub struct RotationMatrix {
    rotation: Rotation,
    transposed: bool,
}

impl RotationMatrix {
    /// `R(q) v` (or `R(q)ᵀ v`)
    pub fn mul(&self, v: &Vector) -> Vector {
        Vector::rotated(self.clone(), v)
    }

    pub(crate) fn reset(&self, ctx: &EvalContext) {
        self.rotation.reset(ctx);
    }

    /// Current matrix value
    pub fn value(&self) -> DMat3 {
        let [w, x, y, z] = self.rotation.components();
        let u = DVec3::new(x, y, z);
        let cols = [DVec3::X, DVec3::Y, DVec3::Z].map(|e| apply(w, u, e, self.transposed));
        DMat3::from_cols(cols[0], cols[1], cols[2])
    }

    /// Propagate `upstream` (`m × 3`) through `∂(R v)/∂q` for fixed `v`
    pub(crate) fn diff(&self, v: DVec3, upstream: &DMatrix<f64>, grads: &mut Gradients) {
        let QuaternionSource::Variable(leaf) = &self.rotation.0.source else {
            return;
        };
        let [w, x, y, z] = self.rotation.components();
        let partials = partials(w, DVec3::new(x, y, z), v, self.transposed);
        grads.accumulate(*leaf, &(upstream * partials));
    }

    pub(crate) fn collect_variables(&self, out: &mut BTreeSet<VarId>) {
        if let QuaternionSource::Variable(leaf) = &self.rotation.0.source {
            collect_leaf(leaf, out);
        }
    }
}

fn apply(w: f64, u: DVec3, v: DVec3, transposed: bool) -> DVec3 {
    let sign = if transposed { -1.0 } else { 1.0 };
    v * (w * w - u.dot(u)) + u * (2.0 * u.dot(v)) + u.cross(v) * (2.0 * w * sign)
}

/// `3 × 4` partials of `R v` with respect to `(w, x, y, z)`
fn partials(w: f64, u: DVec3, v: DVec3, transposed: bool) -> DMatrix<f64> {
    let sign = if transposed { -1.0 } else { 1.0 };
    let dw = v * (2.0 * w) + u.cross(v) * (2.0 * sign);
    // -2 v uᵀ + 2 u vᵀ + 2 (u·v) I ∓ 2 w [v]×
    let cross = skew(v);
    let mut result = DMatrix::zeros(3, 4);
    for r in 0..3 {
        result[(r, 0)] = dw[r];
        for c in 0..3 {
            let identity = if r == c { 2.0 * u.dot(v) } else { 0.0 };
            result[(r, c + 1)] = -2.0 * v[r] * u[c] + 2.0 * u[r] * v[c] + identity
                - 2.0 * w * sign * cross[(r, c)];
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn quaternion_leaf() -> Rotation {
        Rotation::variable(Leaf {
            var: VarId(0),
            dof: 7,
            offset: 3,
        })
    }

    fn body(q: DQuat) -> Vec<crate::variable::Variable> {
        use crate::variable::{RigidBodyVariable, Variable};
        let mut variable = Variable::from(RigidBodyVariable::free(
            uuid::Uuid::new_v4(),
            "body",
            DVec3::ZERO,
            q,
        ));
        variable.set_col(Some(0));
        vec![variable]
    }

    #[test]
    fn test_matches_glam_rotation() {
        let q = DQuat::from_euler(glam::EulerRot::XYZ, 0.3, -0.7, 1.1);
        let variables = body(q);
        let ctx = EvalContext::new(1, &variables);
        let r = quaternion_leaf();
        let v = DVec3::new(1.0, -2.0, 0.5);
        let rotated = r.rotate(&Vector::constant(v));
        rotated.reset(&ctx);
        let expected = q * v;
        assert_relative_eq!(rotated.value().x, expected.x, epsilon = 1e-12);
        assert_relative_eq!(rotated.value().y, expected.y, epsilon = 1e-12);
        assert_relative_eq!(rotated.value().z, expected.z, epsilon = 1e-12);

        let back = r.inverse_rotate(&rotated);
        back.reset(&ctx);
        assert_relative_eq!(back.value().x, v.x, epsilon = 1e-12);
        assert_relative_eq!(back.value().y, v.y, epsilon = 1e-12);
        assert_relative_eq!(back.value().z, v.z, epsilon = 1e-12);
    }

    #[test]
    fn test_partials_match_finite_differences() {
        let w = 0.8;
        let u = DVec3::new(0.1, -0.5, 0.3);
        let v = DVec3::new(0.7, 0.2, -1.3);
        let h = 1e-6;
        for transposed in [false, true] {
            let analytic = partials(w, u, v, transposed);
            for c in 0..4 {
                let mut q = [w, u.x, u.y, u.z];
                q[c] += h;
                let plus = apply(q[0], DVec3::new(q[1], q[2], q[3]), v, transposed);
                q[c] -= 2.0 * h;
                let minus = apply(q[0], DVec3::new(q[1], q[2], q[3]), v, transposed);
                let numeric = (plus - minus) / (2.0 * h);
                for r in 0..3 {
                    assert_relative_eq!(analytic[(r, c)], numeric[r], epsilon = 1e-6);
                }
            }
        }
    }

    #[test]
    fn test_rotate_jacobian_scatter() {
        let variables = body(DQuat::IDENTITY);
        let ctx = EvalContext::new(1, &variables);
        let rotated = quaternion_leaf().rotate(&Vector::constant(DVec3::X));
        let (_, grads) = rotated.jacobian(&ctx);
        let mut j = DMatrix::zeros(3, 7);
        grads.set_jacobian(&ctx, &mut j, 0);
        // at identity: d(Rx)/dw = 2x, d(Rx)/dz = 2y
        assert_relative_eq!(j[(0, 3)], 2.0);
        assert_relative_eq!(j[(1, 6)], 2.0);
        assert_relative_eq!(j[(2, 5)], -2.0);
    }
}
