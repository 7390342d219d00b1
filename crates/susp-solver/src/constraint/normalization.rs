//! Unit-length constraint on a free body's quaternion

use nalgebra::{DMatrix, DVector};

use super::ConstraintEquations;
use crate::autodiff::EvalContext;
use crate::config::ConstraintsOptions;
use crate::variable::VarId;

/// First quaternion component of a rigid body variable
const QUATERNION_OFFSET: usize = 3;

/// `‖q‖² = 1`
pub struct QuaternionNormalization {
    name: String,
    variables: [VarId; 1],
}

impl QuaternionNormalization {
    pub fn new(name: impl Into<String>, var: VarId) -> Self {
        Self {
            name: name.into(),
            variables: [var],
        }
    }

    pub fn variable(&self) -> VarId {
        self.variables[0]
    }
}

impl ConstraintEquations for QuaternionNormalization {
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
        let var = self.variables[0];
        let q: [f64; 4] =
            std::array::from_fn(|i| ctx.component(var, QUATERNION_OFFSET + i));
        phi[row] = q.iter().map(|c| c * c).sum::<f64>() - 1.0;

        let variable = &ctx.variables()[var.0];
        if let Some(col) = variable.col() {
            for (i, c) in q.iter().enumerate() {
                phi_q[(row, col + QUATERNION_OFFSET + i)] += 2.0 * c * variable.scale();
            }
        }
    }
}
