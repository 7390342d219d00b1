//! Spherical and revolute joints between full rigid bodies

use glam::DVec3;
use nalgebra::{DMatrix, DVector};

use susp_core::constants::COINCIDENT_EPSILON;

use super::{ConstraintEquations, leaves, write_scalar, write_vector};
use crate::autodiff::{EvalContext, Scalar, Vector};
use crate::config::ConstraintsOptions;
use crate::error::{SolverError, SolverResult};
use crate::variable::VarId;

/// Two anchor points coincide
pub struct SphericalJoint {
    name: String,
    residual: Vector,
    variables: Vec<VarId>,
}

impl SphericalJoint {
    pub fn new(name: impl Into<String>, lhs: &Vector, rhs: &Vector) -> Self {
        let residual = lhs.sub(rhs);
        Self {
            name: name.into(),
            variables: leaves(&[&residual], &[]),
            residual,
        }
    }
}

impl ConstraintEquations for SphericalJoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn relevant_variables(&self) -> &[VarId] {
        &self.variables
    }

    fn equations(&self, _options: &ConstraintsOptions) -> usize {
        3
    }

    fn set_jacobian_and_constraints(
        &self,
        ctx: &EvalContext,
        phi: &mut DVector<f64>,
        phi_q: &mut DMatrix<f64>,
        row: usize,
        _options: &ConstraintsOptions,
    ) {
        write_vector(&self.residual, ctx, phi, phi_q, row);
    }
}

/// Hinge: a coincident anchor plus the axis of `a` staying orthogonal to two
/// directions normal to the axis of `b`
pub struct RevoluteJoint {
    name: String,
    anchor: Vector,
    alignment: [Scalar; 2],
    variables: Vec<VarId>,
}

impl RevoluteJoint {
    /// `points` are `[a0, a1, b0, b1]`: joint `i` pairs `a_i` with `b_i`.
    /// `initial` holds their world positions for the degeneracy check.
    pub fn new(
        name: impl Into<String>,
        points: [&Vector; 4],
        initial: [DVec3; 4],
    ) -> SolverResult<Self> {
        let name = name.into();
        let [a0, a1, b0, b1] = points;
        let span_a = initial[1] - initial[0];
        let span_b = initial[3] - initial[2];
        if span_a.length() < COINCIDENT_EPSILON || span_b.length() < COINCIDENT_EPSILON {
            return Err(SolverError::DegenerateGeometry {
                element: name,
                reason: "hinge axis points are coincident".into(),
            });
        }

        let anchor = a0.sub(b0);
        let axis_a = a1.sub(a0).normalize();
        let axis_b = b1.sub(b0).normalize();
        let ortho0 = axis_b.stable_orthogonal(span_b);
        let ortho1 = axis_b.cross(&ortho0);
        let alignment = [axis_a.dot(&ortho0), axis_a.dot(&ortho1)];
        Ok(Self {
            variables: leaves(&[&anchor], &[&alignment[0], &alignment[1]]),
            name,
            anchor,
            alignment,
        })
    }
}

impl ConstraintEquations for RevoluteJoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn relevant_variables(&self) -> &[VarId] {
        &self.variables
    }

    fn equations(&self, _options: &ConstraintsOptions) -> usize {
        5
    }

    fn set_jacobian_and_constraints(
        &self,
        ctx: &EvalContext,
        phi: &mut DVector<f64>,
        phi_q: &mut DMatrix<f64>,
        row: usize,
        _options: &ConstraintsOptions,
    ) {
        write_vector(&self.anchor, ctx, phi, phi_q, row);
        write_scalar(&self.alignment[0], ctx, phi, phi_q, row + 3);
        write_scalar(&self.alignment[1], ctx, phi, phi_q, row + 4);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::Leaf;
    use crate::constraint::testing::{assign_columns, evaluate};
    use crate::variable::{PointVariable, Variable};
    use approx::assert_relative_eq;
    use uuid::Uuid;

    fn point(i: usize) -> Vector {
        Vector::variable(Leaf {
            var: VarId(i),
            dof: 3,
            offset: 0,
        })
    }

    fn points(positions: &[DVec3]) -> Vec<Variable> {
        let mut variables: Vec<Variable> = positions
            .iter()
            .map(|p| Variable::from(PointVariable::new(Uuid::new_v4(), "p", *p)))
            .collect();
        assign_columns(&mut variables);
        variables
    }

    #[test]
    fn test_sphere_residual_and_jacobian() {
        let joint = SphericalJoint::new("s", &point(0), &point(1));
        let variables = points(&[DVec3::new(1.0, 2.0, 3.0), DVec3::new(1.0, 0.0, 0.0)]);
        let (phi, phi_q) = evaluate(&joint, &variables, &ConstraintsOptions::default());
        assert_eq!(phi.len(), 3);
        assert_relative_eq!(phi[1], 2.0);
        assert_relative_eq!(phi_q[(0, 0)], 1.0);
        assert_relative_eq!(phi_q[(0, 3)], -1.0);
        assert_eq!(joint.relevant_variables(), &[VarId(0), VarId(1)]);
    }

    #[test]
    fn test_hinge_satisfied_when_axes_parallel() {
        let positions = [
            DVec3::ZERO,
            DVec3::new(0.0, 0.0, 10.0),
            DVec3::ZERO,
            DVec3::new(0.0, 0.0, 20.0),
        ];
        let variables = points(&positions);
        let (p0, p1, p2, p3) = (point(0), point(1), point(2), point(3));
        let hinge = RevoluteJoint::new("h", [&p0, &p1, &p2, &p3], positions).unwrap();
        let (phi, _) = evaluate(&hinge, &variables, &ConstraintsOptions::default());
        assert_eq!(phi.len(), 5);
        assert!(phi.amax() < 1e-12);
    }

    #[test]
    fn test_hinge_detects_misalignment() {
        let positions = [
            DVec3::ZERO,
            DVec3::new(10.0, 0.0, 0.0),
            DVec3::ZERO,
            DVec3::new(0.0, 0.0, 20.0),
        ];
        let variables = points(&positions);
        let (p0, p1, p2, p3) = (point(0), point(1), point(2), point(3));
        let hinge = RevoluteJoint::new("h", [&p0, &p1, &p2, &p3], positions).unwrap();
        let (phi, _) = evaluate(&hinge, &variables, &ConstraintsOptions::default());
        assert!(phi.amax() > 0.5);
    }

    #[test]
    fn test_hinge_degenerate_axis() {
        let positions = [DVec3::ZERO, DVec3::ZERO, DVec3::ZERO, DVec3::Z];
        let (p0, p1, p2, p3) = (point(0), point(1), point(2), point(3));
        assert!(matches!(
            RevoluteJoint::new("h", [&p0, &p1, &p2, &p3], positions),
            Err(SolverError::DegenerateGeometry { .. })
        ));
    }
}
