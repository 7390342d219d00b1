//! Per-group system assembly and the Newton-Raphson loop

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::autodiff::{Epoch, EvalContext};
use crate::builder::ConstraintGraph;
use crate::config::{ConstraintsOptions, SolverConfig};
use crate::error::{SolverError, SolverResult};

/// Iteration limits of one Newton-Raphson run
#[derive(Debug, Clone, Copy)]
pub(crate) struct NewtonSettings {
    pub tolerance: f64,
    pub max_iterations: usize,
    pub divergence_factor: f64,
    pub singular_value_ratio: f64,
}

impl NewtonSettings {
    pub fn from_config(config: &SolverConfig) -> Self {
        Self {
            tolerance: config.tolerance,
            max_iterations: config.max_iterations,
            divergence_factor: config.divergence_factor,
            singular_value_ratio: config.singular_value_ratio,
        }
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }
}

/// Residuals and Jacobian of the active equations of a group
pub(crate) fn assemble(
    graph: &ConstraintGraph,
    group: usize,
    options: &ConstraintsOptions,
    ctx: &EvalContext,
    extra_rows: usize,
) -> (DVector<f64>, DMatrix<f64>) {
    let rows = graph.group_rows(group, options);
    let cols = graph.groups[group].degrees_of_freedom;
    let mut phi = DVector::zeros(rows + extra_rows);
    let mut phi_q = DMatrix::zeros(rows + extra_rows, cols);
    let mut row = 0;
    for id in &graph.groups[group].constraints {
        let constraint = graph.constraints[id.0].as_equations();
        let count = constraint.equations(options);
        if count == 0 {
            continue;
        }
        constraint.set_jacobian_and_constraints(ctx, &mut phi, &mut phi_q, row, options);
        row += count;
    }
    (phi, phi_q)
}

/// Least-squares / minimum-norm solution of `a x = b` by SVD
pub(crate) fn svd_solve(
    a: DMatrix<f64>,
    b: &DVector<f64>,
    ratio: f64,
    group: usize,
) -> SolverResult<DVector<f64>> {
    let svd = a
        .try_svd(true, true, f64::EPSILON, 0)
        .ok_or(SolverError::SingularSystem(group))?;
    let largest = svd.singular_values.max();
    if !largest.is_finite() {
        return Err(SolverError::SingularSystem(group));
    }
    let eps = (largest * ratio).max(f64::MIN_POSITIVE);
    svd.solve(b, eps)
        .map_err(|_| SolverError::SingularSystem(group))
}

/// Subtract the solved step from every variable of the group
pub(crate) fn apply_step(graph: &mut ConstraintGraph, group: usize, dq: &DVector<f64>) {
    for var in &graph.groups[group].variables {
        let variable = &mut graph.variables[var.0];
        let Some(col) = variable.col() else {
            continue;
        };
        let dof = variable.degree_of_freedom();
        variable.apply_dq(&dq.as_slice()[col..col + dof]);
    }
}

/// Iterate until the step norm drops below the tolerance. Returns the number
/// of iterations.
pub(crate) fn newton_raphson(
    graph: &mut ConstraintGraph,
    group: usize,
    options: &ConstraintsOptions,
    settings: &NewtonSettings,
    epoch: &mut Epoch,
) -> SolverResult<usize> {
    if graph.group_rows(group, options) == 0 {
        return Ok(0);
    }
    let mut best = f64::INFINITY;
    for iteration in 0..settings.max_iterations {
        let (phi, phi_q) = {
            let ctx = EvalContext::new(epoch.next(), &graph.variables);
            assemble(graph, group, options, &ctx, 0)
        };
        let dq = svd_solve(phi_q, &phi, settings.singular_value_ratio, group)?;
        let norm = dq.norm();
        debug!(group, iteration, norm, residual = phi.amax(), "newton step");
        if !norm.is_finite() || norm > best * settings.divergence_factor {
            return Err(SolverError::Diverged {
                group,
                iteration,
                norm,
            });
        }
        best = best.min(norm);
        apply_step(graph, group, &dq);
        if norm < settings.tolerance {
            return Ok(iteration + 1);
        }
    }
    Err(SolverError::NotConverged {
        group,
        iterations: settings.max_iterations,
        norm: best,
    })
}
