//! Constraint catalog
//!
//! Every constraint writes its residuals into `phi[row..]` and its Jacobian
//! rows into the group matrix `phi_q`, given the current variable values.
//! The closed set of kinds is the [`Constraint`] enum; behavior shared by all
//! kinds is the [`ConstraintEquations`] trait.

mod balance;
mod joints;
mod link;
mod normalization;
mod plane;
mod slider;
mod torsion;

use std::collections::BTreeSet;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::autodiff::{EvalContext, Scalar, Vector};
use crate::config::ConstraintsOptions;
use crate::error::{SolverError, SolverResult};
use crate::variable::VarId;

pub use balance::{BalanceKind, ForceBalance, Gate, SpringLaw};
pub use joints::{RevoluteJoint, SphericalJoint};
pub use link::RigidLink;
pub use normalization::QuaternionNormalization;
pub use plane::{PlaneConstraint, PlanePoint};
pub use slider::LinearSlider;
pub use torsion::{TorsionLock, twist_angle, twist_angle_value};

/// Arena index of a constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConstraintId(pub usize);

/// Saved internal state of one constraint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConstraintState {
    Stateless,
    /// Controlled offset
    Offset { dl: f64 },
    /// Spring free length (or free twist angle)
    FreeLength { free_length: f64 },
}

/// Behavior shared by every constraint kind
pub trait ConstraintEquations {
    fn name(&self) -> &str;

    /// Free variables whose values enter the residuals
    fn relevant_variables(&self) -> &[VarId];

    /// Whether the constraint is a one-sided bound rather than an equality
    fn is_inequality(&self) -> bool {
        false
    }

    /// Number of equations under `options`
    fn equations(&self, options: &ConstraintsOptions) -> usize;

    fn active(&self, options: &ConstraintsOptions) -> bool {
        self.equations(options) > 0
    }

    /// Write `equations(options)` residuals and Jacobian rows at `row`
    fn set_jacobian_and_constraints(
        &self,
        ctx: &EvalContext,
        phi: &mut DVector<f64>,
        phi_q: &mut DMatrix<f64>,
        row: usize,
        options: &ConstraintsOptions,
    );

    /// Write the single row enforcing the bound selected by `hint`
    fn set_jacobian_and_constraints_inequal(
        &self,
        _ctx: &EvalContext,
        _phi: &mut DVector<f64>,
        _phi_q: &mut DMatrix<f64>,
        _row: usize,
        _hint: i8,
    ) -> SolverResult<()> {
        Err(SolverError::Unimplemented("inequality rows for this constraint"))
    }

    /// `(violated, hint)`: `hint` is `-1` below the lower bound, `+1` above
    /// the upper bound
    fn check_inequality(&self, _ctx: &EvalContext) -> (bool, i8) {
        (false, 0)
    }

    fn save_state(&self) -> ConstraintState {
        ConstraintState::Stateless
    }

    fn restore_state(&mut self, state: &ConstraintState) -> SolverResult<()> {
        match state {
            ConstraintState::Stateless => Ok(()),
            other => Err(SolverError::SnapshotMismatch(format!(
                "constraint {} cannot take {other:?}",
                self.name()
            ))),
        }
    }

    /// Element whose controls drive this constraint
    fn controller(&self) -> Option<Uuid> {
        None
    }

    /// Set the controlled offset, clamped to the constraint's bounds
    fn set_controlled_offset(&mut self, _dl: f64) {}
}

/// Closed set of constraint kinds
pub enum Constraint {
    Sphere(SphericalJoint),
    Hinge(RevoluteJoint),
    RigidLink(RigidLink),
    LinearSlider(LinearSlider),
    Plane(PlaneConstraint),
    QuaternionNormalization(QuaternionNormalization),
    TorsionLock(TorsionLock),
    Balance(ForceBalance),
}

macro_rules! dispatch {
    ($self:expr, $c:ident => $body:expr) => {
        match $self {
            Constraint::Sphere($c) => $body,
            Constraint::Hinge($c) => $body,
            Constraint::RigidLink($c) => $body,
            Constraint::LinearSlider($c) => $body,
            Constraint::Plane($c) => $body,
            Constraint::QuaternionNormalization($c) => $body,
            Constraint::TorsionLock($c) => $body,
            Constraint::Balance($c) => $body,
        }
    };
}

impl Constraint {
    pub fn as_equations(&self) -> &dyn ConstraintEquations {
        dispatch!(self, c => c)
    }

    pub fn as_equations_mut(&mut self) -> &mut dyn ConstraintEquations {
        dispatch!(self, c => c)
    }

    /// Short kind name for logs
    pub fn kind_name(&self) -> &'static str {
        match self {
            Constraint::Sphere(_) => "SphericalJoint",
            Constraint::Hinge(_) => "RevoluteJoint",
            Constraint::RigidLink(_) => "RigidLink",
            Constraint::LinearSlider(_) => "LinearSlider",
            Constraint::Plane(_) => "PlaneConstraint",
            Constraint::QuaternionNormalization(_) => "QuaternionNormalization",
            Constraint::TorsionLock(_) => "TorsionLock",
            Constraint::Balance(_) => "ForceBalance",
        }
    }

    /// Hold spring/dampers at their length at the start of a solve
    pub fn hold_current_length(&mut self, ctx: &EvalContext) {
        if let Constraint::RigidLink(link) = self {
            link.hold_current_length(ctx);
        }
    }

    /// Derive spring free lengths from the current balance forces
    pub fn set_preload(&mut self, ctx: &EvalContext) {
        if let Constraint::Balance(balance) = self {
            balance.set_preload(ctx);
        }
    }
}

/// Variables reachable from a set of expressions, in index order
pub(crate) fn leaves(vectors: &[&Vector], scalars: &[&Scalar]) -> Vec<VarId> {
    let mut out = BTreeSet::new();
    for v in vectors {
        v.collect_variables(&mut out);
    }
    for s in scalars {
        s.collect_variables(&mut out);
    }
    out.into_iter().collect()
}

/// Write a 3-row vector residual
pub(crate) fn write_vector(
    expr: &Vector,
    ctx: &EvalContext,
    phi: &mut DVector<f64>,
    phi_q: &mut DMatrix<f64>,
    row: usize,
) {
    let (value, grads) = expr.jacobian(ctx);
    phi[row] = value.x;
    phi[row + 1] = value.y;
    phi[row + 2] = value.z;
    grads.set_jacobian(ctx, phi_q, row);
}

/// Write a single-row scalar residual
pub(crate) fn write_scalar(
    expr: &Scalar,
    ctx: &EvalContext,
    phi: &mut DVector<f64>,
    phi_q: &mut DMatrix<f64>,
    row: usize,
) {
    let (value, grads) = expr.gradient(ctx);
    phi[row] = value;
    grads.set_jacobian(ctx, phi_q, row);
}
