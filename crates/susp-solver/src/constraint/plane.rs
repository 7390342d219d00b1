//! Point-to-plane constraint (plane controls, tire ground contact)

use glam::DVec3;
use nalgebra::{DMatrix, DVector};
use uuid::Uuid;

use super::{ConstraintEquations, ConstraintState, leaves, write_scalar};
use crate::autodiff::{EvalContext, Parameter, Scalar, Vector};
use crate::config::ConstraintsOptions;
use crate::error::{SolverError, SolverResult};
use crate::variable::VarId;

/// Where the constrained point comes from
pub enum PlanePoint {
    /// A point fixed to a component
    Fixed(Vector),
    /// Point of a tire's outer circle closest to the plane
    NearestOnTire {
        center: Vector,
        axis: Vector,
        radius: f64,
    },
}

impl PlanePoint {
    /// Expression of the point for a plane with unit `normal`
    pub fn expression(&self, normal: DVec3) -> Vector {
        match self {
            PlanePoint::Fixed(point) => point.clone(),
            PlanePoint::NearestOnTire {
                center,
                axis,
                radius,
            } => {
                // a × (-n × a): in-plane direction of the wheel facing away from n
                let axis = axis.normalize();
                let away = Vector::constant(-normal).cross(&axis);
                let down = axis.cross(&away).normalize();
                center.add(&down.scale_by(*radius))
            }
        }
    }
}

/// `n · p = distance + dl`
pub struct PlaneConstraint {
    name: String,
    point: Vector,
    normal: DVec3,
    distance: f64,
    dl: Parameter,
    dl_min: f64,
    dl_max: f64,
    controller: Option<Uuid>,
    residual: Scalar,
    variables: Vec<VarId>,
}

impl PlaneConstraint {
    pub fn new(
        name: impl Into<String>,
        point: PlanePoint,
        normal: DVec3,
        distance: f64,
    ) -> SolverResult<Self> {
        let name = name.into();
        let normal = normal.try_normalize().ok_or_else(|| SolverError::DegenerateGeometry {
            element: name.clone(),
            reason: "plane normal has zero length".into(),
        })?;
        let point = point.expression(normal);
        let dl = Parameter::new(0.0);
        let residual = Vector::constant(normal)
            .dot(&point)
            .sub(&Scalar::constant(distance).add(&Scalar::parameter(&dl)));
        Ok(Self {
            name,
            variables: leaves(&[&point], &[]),
            point,
            normal,
            distance,
            dl,
            dl_min: f64::NEG_INFINITY,
            dl_max: f64::INFINITY,
            controller: None,
            residual,
        })
    }

    /// Drive the offset from `element`'s controls within `[dl_min, dl_max]`
    pub fn controlled_by(mut self, element: Uuid, dl: f64, dl_min: f64, dl_max: f64) -> Self {
        self.controller = Some(element);
        self.dl_min = dl_min;
        self.dl_max = dl_max;
        self.set_controlled_offset(dl);
        self
    }

    pub fn normal(&self) -> DVec3 {
        self.normal
    }

    pub fn distance(&self) -> f64 {
        self.distance
    }

    /// Current constrained point
    pub fn point(&self) -> &Vector {
        &self.point
    }
}

impl ConstraintEquations for PlaneConstraint {
    fn name(&self) -> &str {
        &self.name
    }

    fn relevant_variables(&self) -> &[VarId] {
        &self.variables
    }

    fn equations(&self, _options: &ConstraintsOptions) -> usize {
        1
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

    fn set_jacobian_and_constraints_inequal(
        &self,
        _ctx: &EvalContext,
        _phi: &mut DVector<f64>,
        _phi_q: &mut DMatrix<f64>,
        _row: usize,
        _hint: i8,
    ) -> SolverResult<()> {
        Err(SolverError::Unimplemented("bilateral point-to-plane inequality"))
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
                "plane constraint {} cannot take {other:?}",
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

    fn point_variable(position: DVec3) -> (Vec<Variable>, Vector) {
        let mut variables = vec![Variable::from(PointVariable::new(Uuid::new_v4(), "p", position))];
        assign_columns(&mut variables);
        let leaf = Leaf { var: VarId(0), dof: 3, offset: 0 };
        (variables, Vector::variable(leaf))
    }

    #[test]
    fn test_fixed_point_on_plane() {
        let (variables, p) = point_variable(DVec3::new(5.0, 1.0, 12.0));
        let plane = PlaneConstraint::new("ride height", PlanePoint::Fixed(p), DVec3::Z * 2.0, 10.0)
            .unwrap()
            .controlled_by(Uuid::new_v4(), 5.0, -1.0, 1.0);
        let (phi, phi_q) = evaluate(&plane, &variables, &ConstraintsOptions::default());
        // dl clamped to 1
        assert_relative_eq!(phi[0], 1.0);
        assert_relative_eq!(phi_q[(0, 2)], 1.0);
        assert_relative_eq!(phi_q[(0, 0)], 0.0);
    }

    #[test]
    fn test_nearest_tire_point() {
        let (variables, center) = point_variable(DVec3::new(0.0, 600.0, 250.0));
        // cambered wheel: axis tilted about x
        let axis = Vector::constant(DVec3::new(0.0, 1.0, 0.1).normalize());
        let source = PlanePoint::NearestOnTire { center, axis, radius: 250.0 };
        let plane = PlaneConstraint::new("ground", source, DVec3::Z, 0.0).unwrap();
        let (phi, _) = evaluate(&plane, &variables, &ConstraintsOptions::default());
        let tilt = DVec3::new(0.0, 1.0, 0.1).normalize();
        let expected = 250.0 - 250.0 * (1.0 - tilt.z * tilt.z).sqrt();
        assert_relative_eq!(phi[0], expected, epsilon = 1e-9);
    }

    #[test]
    fn test_inequal_is_unimplemented() {
        let (variables, p) = point_variable(DVec3::ZERO);
        let plane = PlaneConstraint::new("p", PlanePoint::Fixed(p), DVec3::Z, 0.0).unwrap();
        let ctx = EvalContext::new(1, &variables);
        let result = plane.set_jacobian_and_constraints_inequal(
            &ctx,
            &mut DVector::zeros(1),
            &mut DMatrix::zeros(1, 3),
            0,
            1,
        );
        assert!(matches!(result, Err(SolverError::Unimplemented(_))));
    }
}
