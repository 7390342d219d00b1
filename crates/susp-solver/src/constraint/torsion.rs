//! Twist lock of a torsion spring while its elasticity is disabled

use glam::DVec3;
use nalgebra::{DMatrix, DVector};
use uuid::Uuid;

use super::{ConstraintEquations, ConstraintState, leaves, write_scalar};
use crate::autodiff::{EvalContext, Parameter, Scalar, Vector};
use crate::config::ConstraintsOptions;
use crate::error::{SolverError, SolverResult};
use crate::variable::VarId;

/// Signed angle from `arm0` to `arm1` about `axis`, both arms measured from
/// `origin`
pub fn twist_angle(origin: &Vector, axis: &Vector, arm0: &Vector, arm1: &Vector) -> Scalar {
    let axis = axis.normalize();
    let r0 = arm0.sub(origin);
    let r1 = arm1.sub(origin);
    let sine = Scalar::dot(&r0.cross(&r1), &axis);
    let cosine = r0
        .dot(&r1)
        .sub(&r0.dot(&axis).mul(&r1.dot(&axis)));
    Scalar::atan2(&sine, &cosine)
}

/// Numeric counterpart of [`twist_angle`]
pub fn twist_angle_value(origin: DVec3, axis: DVec3, arm0: DVec3, arm1: DVec3) -> f64 {
    let axis = axis.normalize_or_zero();
    let r0 = arm0 - origin;
    let r1 = arm1 - origin;
    let sine = r0.cross(r1).dot(axis);
    let cosine = r0.dot(r1) - r0.dot(axis) * r1.dot(axis);
    sine.atan2(cosine)
}

/// `twist = nominal + dl`, active while the spring is rigid or controlled
pub struct TorsionLock {
    name: String,
    element: Uuid,
    residual: Scalar,
    dl: Parameter,
    dl_min: f64,
    dl_max: f64,
    controller: Option<Uuid>,
    variables: Vec<VarId>,
}

impl TorsionLock {
    pub fn new(name: impl Into<String>, element: Uuid, twist: &Scalar, nominal: f64) -> Self {
        let dl = Parameter::new(0.0);
        let residual = twist.sub(&Scalar::constant(nominal).add(&Scalar::parameter(&dl)));
        Self {
            name: name.into(),
            element,
            variables: leaves(&[], &[&residual]),
            residual,
            dl,
            dl_min: f64::NEG_INFINITY,
            dl_max: f64::INFINITY,
            controller: None,
        }
    }

    pub fn with_bounds(mut self, dl_min: f64, dl_max: f64) -> Self {
        self.dl_min = dl_min;
        self.dl_max = dl_max;
        self
    }

    pub fn controlled_by(mut self, element: Uuid, dl: f64) -> Self {
        self.controller = Some(element);
        self.set_controlled_offset(dl);
        self
    }

    pub fn element(&self) -> Uuid {
        self.element
    }
}

impl ConstraintEquations for TorsionLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn relevant_variables(&self) -> &[VarId] {
        &self.variables
    }

    fn equations(&self, options: &ConstraintsOptions) -> usize {
        usize::from(options.disable_spring_elasticity || self.controller.is_some())
    }

    fn set_jacobian_and_constraints(
        &self,
        ctx: &EvalContext,
        phi: &mut DVector<f64>,
        phi_q: &mut DMatrix<f64>,
        row: usize,
        _options: &ConstraintsOptions,
    ) {
        write_scalar(&self.residual, ctx, phi, phi_q, row);
    }

    fn save_state(&self) -> ConstraintState {
        ConstraintState::Offset { dl: self.dl.get() }
    }

    fn restore_state(&mut self, state: &ConstraintState) -> SolverResult<()> {
        match state {
            ConstraintState::Offset { dl } => {
                self.dl.set(*dl);
                Ok(())
            }
            other => Err(SolverError::SnapshotMismatch(format!(
                "torsion lock {} cannot take {other:?}",
                self.name
            ))),
        }
    }

    fn controller(&self) -> Option<Uuid> {
        self.controller
    }

    fn set_controlled_offset(&mut self, dl: f64) {
        self.dl.set(dl.clamp(self.dl_min, self.dl_max));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::Leaf;
    use crate::constraint::testing::{assign_columns, evaluate};
    use crate::variable::{PointVariable, Variable};
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_twist_angle_value() {
        let angle = twist_angle_value(DVec3::ZERO, DVec3::Z * 3.0, DVec3::X, DVec3::new(0.0, 2.0, 5.0));
        assert_relative_eq!(angle, FRAC_PI_2, epsilon = 1e-12);
    }

    #[test]
    fn test_lock_only_when_rigid() {
        let mut variables = vec![Variable::from(PointVariable::new(
            Uuid::new_v4(),
            "arm1",
            DVec3::new(0.0, 1.0, 0.0),
        ))];
        assign_columns(&mut variables);
        let arm1 = Vector::variable(Leaf { var: VarId(0), dof: 3, offset: 0 });
        let twist = twist_angle(
            &Vector::constant(DVec3::ZERO),
            &Vector::constant(DVec3::Z),
            &Vector::constant(DVec3::X),
            &arm1,
        );
        let lock = TorsionLock::new("arb", Uuid::new_v4(), &twist, 0.0);
        assert_eq!(lock.equations(&ConstraintsOptions::default()), 0);
        let rigid = ConstraintsOptions::default().with_disabled_spring_elasticity();
        let (phi, phi_q) = evaluate(&lock, &variables, &rigid);
        assert_relative_eq!(phi[0], FRAC_PI_2, epsilon = 1e-12);
        // moving arm1 along -x increases the angle
        assert_relative_eq!(phi_q[(0, 0)], -1.0, epsilon = 1e-9);
    }
}
