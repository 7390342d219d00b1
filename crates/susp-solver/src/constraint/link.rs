//! Fixed-distance link between two anchors (bars, spring/dampers, reduced
//! A-arm sides)

use nalgebra::{DMatrix, DVector};
use uuid::Uuid;

use super::{ConstraintEquations, ConstraintState, leaves, write_scalar};
use crate::autodiff::{EvalContext, Parameter, Scalar, Vector};
use crate::config::ConstraintsOptions;
use crate::error::{SolverError, SolverResult};
use crate::variable::VarId;

/// Tolerance of the bound check, in length units
const INEQUALITY_EPSILON: f64 = 1e-6;

/// `|p1 - p0|² = (length + dl)²`
///
/// A spring/damper without a controller is an inequality: it carries no
/// equation while its elasticity is enabled, and its length must stay within
/// `[length + dl_min, length + dl_max]`.
pub struct RigidLink {
    name: String,
    element: Uuid,
    span: Vector,
    length: f64,
    dl: Parameter,
    dl_min: f64,
    dl_max: f64,
    is_spring_dumper: bool,
    controller: Option<Uuid>,
    held_length: Parameter,
    residual: Scalar,
    held_residual: Scalar,
    variables: Vec<VarId>,
}

impl RigidLink {
    pub fn new(name: impl Into<String>, element: Uuid, p0: &Vector, p1: &Vector, length: f64) -> Self {
        let span = p1.sub(p0);
        let squared = span.dot(&span);
        let dl = Parameter::new(0.0);
        let target = Scalar::constant(length).add(&Scalar::parameter(&dl));
        let residual = squared.sub(&target.mul(&target));
        let held_length = Parameter::new(length);
        let held = Scalar::parameter(&held_length);
        let held_residual = squared.sub(&held.mul(&held));
        Self {
            name: name.into(),
            element,
            variables: leaves(&[&span], &[]),
            span,
            length,
            dl,
            dl_min: f64::NEG_INFINITY,
            dl_max: f64::INFINITY,
            is_spring_dumper: false,
            controller: None,
            held_length,
            residual,
            held_residual,
        }
    }

    /// Mark as spring/damper with offset bounds
    pub fn spring_dumper(mut self, dl_min: f64, dl_max: f64) -> Self {
        self.is_spring_dumper = true;
        self.dl_min = dl_min;
        self.dl_max = dl_max;
        self
    }

    /// Drive the offset from `element`'s controls
    pub fn controlled_by(mut self, element: Uuid, dl: f64) -> Self {
        self.controller = Some(element);
        self.set_controlled_offset(dl);
        self
    }

    pub fn element(&self) -> Uuid {
        self.element
    }

    pub fn length(&self) -> f64 {
        self.length
    }

    pub fn dl(&self) -> f64 {
        self.dl.get()
    }

    pub fn is_spring_dumper(&self) -> bool {
        self.is_spring_dumper
    }

    /// Record the current length as the target of
    /// `fix_spring_dumpers_at_current_position`
    pub fn hold_current_length(&mut self, ctx: &EvalContext) {
        self.span.reset(ctx);
        self.held_length.set(self.span.value().length());
    }

    fn holds_current_length(&self, options: &ConstraintsOptions) -> bool {
        self.is_inequality() && options.fix_spring_dumpers_at_current_position
    }
}

impl ConstraintEquations for RigidLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn relevant_variables(&self) -> &[VarId] {
        &self.variables
    }

    fn is_inequality(&self) -> bool {
        self.is_spring_dumper && self.controller.is_none()
    }

    fn equations(&self, options: &ConstraintsOptions) -> usize {
        if self.is_inequality()
            && !options.disable_spring_elasticity
            && !options.fix_spring_dumpers_at_current_position
        {
            0
        } else {
            1
        }
    }

    fn set_jacobian_and_constraints(
        &self,
        ctx: &EvalContext,
        phi: &mut DVector<f64>,
        phi_q: &mut DMatrix<f64>,
        row: usize,
        options: &ConstraintsOptions,
    ) {
        let residual = if self.holds_current_length(options) {
            &self.held_residual
        } else {
            &self.residual
        };
        write_scalar(residual, ctx, phi, phi_q, row);
    }

    fn set_jacobian_and_constraints_inequal(
        &self,
        ctx: &EvalContext,
        phi: &mut DVector<f64>,
        phi_q: &mut DMatrix<f64>,
        row: usize,
        hint: i8,
    ) -> SolverResult<()> {
        if !self.is_inequality() {
            return Err(SolverError::Unimplemented("inequality rows for a rigid link"));
        }
        let bound = self.length + if hint < 0 { self.dl_min } else { self.dl_max };
        let span = &self.span;
        let residual = span.dot(span).sub(&Scalar::constant(bound * bound));
        write_scalar(&residual, ctx, phi, phi_q, row);
        Ok(())
    }

    fn check_inequality(&self, ctx: &EvalContext) -> (bool, i8) {
        self.span.reset(ctx);
        let current = self.span.value().length();
        if current < self.length + self.dl_min - INEQUALITY_EPSILON {
            (true, -1)
        } else if current > self.length + self.dl_max + INEQUALITY_EPSILON {
            (true, 1)
        } else {
            (false, 0)
        }
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
                "rigid link {} cannot take {other:?}",
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
    use glam::DVec3;

    fn setup(distance: f64) -> (Vec<Variable>, Vector, Vector) {
        let mut variables = vec![
            Variable::from(PointVariable::new(Uuid::new_v4(), "p0", DVec3::ZERO)),
            Variable::from(PointVariable::new(Uuid::new_v4(), "p1", DVec3::new(distance, 0.0, 0.0))),
        ];
        assign_columns(&mut variables);
        let p = |i| Vector::variable(Leaf { var: VarId(i), dof: 3, offset: 0 });
        (variables, p(0), p(1))
    }

    fn damper(p0: &Vector, p1: &Vector) -> RigidLink {
        RigidLink::new("damper", Uuid::new_v4(), p0, p1, 100.0).spring_dumper(-10.0, 10.0)
    }

    #[test]
    fn test_bar_always_one_equation() {
        let (_, p0, p1) = setup(100.0);
        let bar = RigidLink::new("bar", Uuid::new_v4(), &p0, &p1, 100.0);
        assert!(!bar.is_inequality());
        assert_eq!(bar.equations(&ConstraintsOptions::default()), 1);
        assert_eq!(
            bar.equations(&ConstraintsOptions::default().with_disabled_spring_elasticity()),
            1
        );
    }

    #[test]
    fn test_bar_residual_and_jacobian() {
        let (variables, p0, p1) = setup(102.0);
        let bar = RigidLink::new("bar", Uuid::new_v4(), &p0, &p1, 100.0);
        let (phi, phi_q) = evaluate(&bar, &variables, &ConstraintsOptions::default());
        assert_relative_eq!(phi[0], 102.0 * 102.0 - 100.0 * 100.0);
        assert_relative_eq!(phi_q[(0, 0)], -204.0);
        assert_relative_eq!(phi_q[(0, 3)], 204.0);
    }

    #[test]
    fn test_free_damper_is_inequality() {
        let (variables, p0, p1) = setup(95.0);
        let link = damper(&p0, &p1);
        assert!(link.is_inequality());
        assert_eq!(link.equations(&ConstraintsOptions::default()), 0);
        assert!(!link.active(&ConstraintsOptions::default()));
        let ctx = EvalContext::new(1, &variables);
        assert_eq!(link.check_inequality(&ctx), (false, 0));
    }

    #[test]
    fn test_inequality_bounds() {
        let (variables, p0, p1) = setup(70.0);
        let link = damper(&p0, &p1);
        let ctx = EvalContext::new(1, &variables);
        assert_eq!(link.check_inequality(&ctx), (true, -1));

        let (variables, p0, p1) = setup(115.0);
        let link = damper(&p0, &p1);
        let ctx = EvalContext::new(1, &variables);
        assert_eq!(link.check_inequality(&ctx), (true, 1));

        let mut phi = DVector::zeros(1);
        let mut phi_q = DMatrix::zeros(1, 6);
        link.set_jacobian_and_constraints_inequal(&ctx, &mut phi, &mut phi_q, 0, 1)
            .unwrap();
        assert_relative_eq!(phi[0], 115.0 * 115.0 - 110.0 * 110.0);
    }

    #[test]
    fn test_controlled_damper_is_equality() {
        let (variables, p0, p1) = setup(95.0);
        let link = damper(&p0, &p1).controlled_by(Uuid::new_v4(), -5.0);
        assert!(!link.is_inequality());
        let (phi, _) = evaluate(&link, &variables, &ConstraintsOptions::default());
        assert_relative_eq!(phi[0], 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_offset_is_clamped_and_saved() {
        let (_, p0, p1) = setup(100.0);
        let mut link = damper(&p0, &p1);
        link.set_controlled_offset(25.0);
        assert_eq!(link.save_state(), ConstraintState::Offset { dl: 10.0 });
        link.restore_state(&ConstraintState::Offset { dl: -3.0 }).unwrap();
        assert_eq!(link.dl(), -3.0);
    }

    #[test]
    fn test_hold_current_length() {
        let (variables, p0, p1) = setup(93.0);
        let mut link = damper(&p0, &p1);
        let options = ConstraintsOptions {
            fix_spring_dumpers_at_current_position: true,
            ..Default::default()
        };
        assert_eq!(link.equations(&options), 1);
        let ctx = EvalContext::new(1, &variables);
        link.hold_current_length(&ctx);
        let (phi, _) = evaluate(&link, &variables, &options);
        assert_relative_eq!(phi[0], 0.0, epsilon = 1e-9);
    }
}
