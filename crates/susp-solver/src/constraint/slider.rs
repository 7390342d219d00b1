//! Rod end of a linear bushing sliding along the bushing axis

use glam::DVec3;
use nalgebra::{DMatrix, DVector};
use uuid::Uuid;

use susp_core::constants::COINCIDENT_EPSILON;

use super::{ConstraintEquations, ConstraintState, SphericalJoint, leaves, write_scalar};
use crate::autodiff::{EvalContext, Parameter, Scalar, Vector, least_aligned_axis};
use crate::config::ConstraintsOptions;
use crate::error::{SolverError, SolverResult};
use crate::variable::VarId;

/// Rod end confined to the line through `frame0` along `frame1 - frame0`,
/// keeping its initial lateral offset from that line.
///
/// When the bushing is fixed or controlled the rod end is pinned at its
/// nominal position shifted by `dl` along the axis by an internal spherical
/// joint; otherwise only its two off-axis components are constrained.
pub struct LinearSlider {
    name: String,
    element: Uuid,
    off_axis: [Scalar; 2],
    pinned: SphericalJoint,
    offset: f64,
    dl: Parameter,
    dl_min: f64,
    dl_max: f64,
    controller: Option<Uuid>,
    variables: Vec<VarId>,
}

impl LinearSlider {
    /// `initial` holds the build-time world positions of `frame0`, `frame1`
    /// and the rod end; `dl` is shared by all rod ends of the same bushing.
    pub fn new(
        name: impl Into<String>,
        element: Uuid,
        [frame0, frame1, rod_end]: [&Vector; 3],
        dl: &Parameter,
        initial: [DVec3; 3],
    ) -> SolverResult<Self> {
        let name = name.into();
        let initial_axis = initial[1] - initial[0];
        if initial_axis.length() < COINCIDENT_EPSILON {
            return Err(SolverError::DegenerateGeometry {
                element: name,
                reason: "linear bushing frame points are coincident".into(),
            });
        }
        let a = initial_axis.normalize();
        let o0 = a.cross(least_aligned_axis(initial_axis)).normalize();
        let o1 = a.cross(o0);
        let initial_relative = initial[2] - initial[0];
        let offset = initial_relative.dot(a);
        let lateral = [initial_relative.dot(o0), initial_relative.dot(o1)];

        let axis = frame1.sub(frame0).normalize();
        let ortho0 = axis.stable_orthogonal(initial_axis);
        let ortho1 = axis.cross(&ortho0);
        let relative = rod_end.sub(frame0);
        let off_axis = [
            relative.dot(&ortho0).sub(&Scalar::constant(lateral[0])),
            relative.dot(&ortho1).sub(&Scalar::constant(lateral[1])),
        ];

        let travel = Scalar::constant(offset).add(&Scalar::parameter(dl));
        let target = frame0
            .add(&axis.scale(&travel))
            .add(&ortho0.scale_by(lateral[0]))
            .add(&ortho1.scale_by(lateral[1]));
        let pinned = SphericalJoint::new(format!("{name} (pinned)"), rod_end, &target);

        let variables = leaves(&[&relative, &target], &[]);
        Ok(Self {
            name,
            element,
            off_axis,
            pinned,
            offset,
            dl: dl.clone(),
            dl_min: f64::NEG_INFINITY,
            dl_max: f64::INFINITY,
            controller: None,
            variables,
        })
    }

    /// Offset bounds of the bushing
    pub fn with_bounds(mut self, dl_min: f64, dl_max: f64) -> Self {
        self.dl_min = dl_min;
        self.dl_max = dl_max;
        self
    }

    /// Drive the shared offset from `element`'s controls
    pub fn controlled_by(mut self, element: Uuid, dl: f64) -> Self {
        self.controller = Some(element);
        self.set_controlled_offset(dl);
        self
    }

    pub fn element(&self) -> Uuid {
        self.element
    }

    /// Nominal axial position of the rod end measured from `frame0`
    pub fn offset(&self) -> f64 {
        self.offset
    }

    fn is_pinned(&self, options: &ConstraintsOptions) -> bool {
        options.fix_linear_bushing || self.controller.is_some()
    }
}

impl ConstraintEquations for LinearSlider {
    fn name(&self) -> &str {
        &self.name
    }

    fn relevant_variables(&self) -> &[VarId] {
        &self.variables
    }

    fn equations(&self, options: &ConstraintsOptions) -> usize {
        if self.is_pinned(options) { 3 } else { 2 }
    }

    fn set_jacobian_and_constraints(
        &self,
        ctx: &EvalContext,
        phi: &mut DVector<f64>,
        phi_q: &mut DMatrix<f64>,
        row: usize,
        options: &ConstraintsOptions,
    ) {
        if self.is_pinned(options) {
            self.pinned
                .set_jacobian_and_constraints(ctx, phi, phi_q, row, options);
        } else {
            write_scalar(&self.off_axis[0], ctx, phi, phi_q, row);
            write_scalar(&self.off_axis[1], ctx, phi, phi_q, row + 1);
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
                "linear slider {} cannot take {other:?}",
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
