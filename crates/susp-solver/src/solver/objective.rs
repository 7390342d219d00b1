//! Constrained minimization of `½ |r(q)|²` under a group's constraints
//!
//! Each iteration solves the bordered KKT system
//! `[[H, -Jᵀ], [J, 0]] · [dq; μ] = [∇f; φ]` and applies `q -= dq`. `H` is the
//! Gauss-Newton term `JᵣᵀJᵣ` of the objective, re-evaluated every iteration,
//! plus a damped BFGS approximation of the remaining Lagrangian curvature.
//! The secant pair is taken from the step actually applied, which differs
//! from `-dq` once quaternions are renormalized.

use std::collections::BTreeSet;

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use super::newton::{NewtonSettings, apply_step, assemble, svd_solve};
use crate::autodiff::{Epoch, EvalContext, Vector};
use crate::builder::ConstraintGraph;
use crate::config::ConstraintsOptions;
use crate::constraint::ConstraintId;
use crate::error::{SolverError, SolverResult};

/// Initial curvature correction relative to the largest Gauss-Newton entry.
/// Keeps directions the objective does not observe at a near-zero step.
const HESSIAN_REGULARIZATION: f64 = 1e-6;
const CURVATURE_EPSILON: f64 = 1e-12;

/// Bound row appended to the system: constraint and violated side
type Bound = (ConstraintId, i8);

struct Evaluation {
    phi: DVector<f64>,
    phi_q: DMatrix<f64>,
    gradient: DVector<f64>,
    objective_jacobian: DMatrix<f64>,
}

fn evaluate(
    graph: &ConstraintGraph,
    group: usize,
    residual: &Vector,
    options: &ConstraintsOptions,
    bound: Option<Bound>,
    epoch: &mut Epoch,
) -> SolverResult<Evaluation> {
    let ctx = EvalContext::new(epoch.next(), &graph.variables);
    let extra = usize::from(bound.is_some());
    let (mut phi, mut phi_q) = assemble(graph, group, options, &ctx, extra);
    if let Some((id, hint)) = bound {
        let row = phi.len() - 1;
        graph.constraints[id.0]
            .as_equations()
            .set_jacobian_and_constraints_inequal(&ctx, &mut phi, &mut phi_q, row, hint)?;
    }
    let (value, grads) = residual.jacobian(&ctx);
    let mut objective_jacobian = DMatrix::zeros(3, graph.groups[group].degrees_of_freedom);
    grads.set_jacobian(&ctx, &mut objective_jacobian, 0);
    let r = DVector::from_column_slice(&[value.x, value.y, value.z]);
    let gradient = objective_jacobian.transpose() * r;
    Ok(Evaluation {
        phi,
        phi_q,
        gradient,
        objective_jacobian,
    })
}

/// Damped BFGS update with the secant pair `(s, y)`; skipped when the
/// curvature terms vanish
fn bfgs_update(h: &mut DMatrix<f64>, s: &DVector<f64>, y: &DVector<f64>) {
    let hs = &*h * s;
    let shs = s.dot(&hs);
    if shs.abs() < CURVATURE_EPSILON {
        return;
    }
    let sy = s.dot(y);
    let r = if sy < 0.2 * shs {
        let theta = 0.8 * shs / (shs - sy);
        y * theta + &hs * (1.0 - theta)
    } else {
        y.clone()
    };
    let sr = s.dot(&r);
    if sr.abs() < CURVATURE_EPSILON {
        return;
    }
    *h += &r * r.transpose() / sr - &hs * hs.transpose() / shs;
}

impl Evaluation {
    fn gauss_newton(&self) -> DMatrix<f64> {
        self.objective_jacobian.transpose() * &self.objective_jacobian
    }
}

/// Current values of the group's columns
fn group_values(graph: &ConstraintGraph, group: usize) -> DVector<f64> {
    let mut values = DVector::zeros(graph.groups[group].degrees_of_freedom);
    for var in &graph.groups[group].variables {
        let variable = &graph.variables[var.0];
        let Some(col) = variable.col() else {
            continue;
        };
        for offset in 0..variable.degree_of_freedom() {
            values[col + offset] = variable.component(offset) / variable.scale();
        }
    }
    values
}

fn quasi_newton(
    graph: &mut ConstraintGraph,
    group: usize,
    residual: &Vector,
    options: &ConstraintsOptions,
    bound: Option<Bound>,
    settings: &NewtonSettings,
    epoch: &mut Epoch,
) -> SolverResult<usize> {
    let n = graph.groups[group].degrees_of_freedom;
    let mut current = evaluate(graph, group, residual, options, bound, epoch)?;
    let mut gauss_newton = current.gauss_newton();
    let seed = HESSIAN_REGULARIZATION * gauss_newton.diagonal().max().max(1.0);
    let mut correction = DMatrix::identity(n, n) * seed;
    let mut best = f64::INFINITY;

    for iteration in 0..settings.max_iterations {
        let m = current.phi.len();
        let mut kkt = DMatrix::zeros(n + m, n + m);
        kkt.view_mut((0, 0), (n, n)).copy_from(&(&gauss_newton + &correction));
        kkt.view_mut((0, n), (n, m)).copy_from(&(-current.phi_q.transpose()));
        kkt.view_mut((n, 0), (m, n)).copy_from(&current.phi_q);
        let mut rhs = DVector::zeros(n + m);
        rhs.rows_mut(0, n).copy_from(&current.gradient);
        rhs.rows_mut(n, m).copy_from(&current.phi);

        let solution = svd_solve(kkt, &rhs, settings.singular_value_ratio, group)?;
        let dq = solution.rows(0, n).into_owned();
        let multipliers = solution.rows(n, m).into_owned();
        let lagrangian = &current.gradient + current.phi_q.transpose() * &multipliers;

        let norm = dq.norm();
        if !norm.is_finite() || norm > best * settings.divergence_factor {
            return Err(SolverError::Diverged {
                group,
                iteration,
                norm,
            });
        }
        best = best.min(norm);
        let before = group_values(graph, group);
        apply_step(graph, group, &dq);
        let step = group_values(graph, group) - before;

        let next = evaluate(graph, group, residual, options, bound, epoch)?;
        let next_lagrangian = &next.gradient + next.phi_q.transpose() * &multipliers;
        let gradient_norm = next_lagrangian.norm();
        debug!(group, iteration, norm, gradient_norm, "quasi-newton step");
        if norm < settings.tolerance && gradient_norm < settings.tolerance {
            return Ok(iteration + 1);
        }
        gauss_newton = next.gauss_newton();
        let remainder = next_lagrangian - lagrangian - &gauss_newton * &step;
        bfgs_update(&mut correction, &step, &remainder);
        current = next;
    }
    Err(SolverError::NotConverged {
        group,
        iterations: settings.max_iterations,
        norm: best,
    })
}

/// Minimize `½ |residual|²` within one group. A single one-sided
/// constraint is enforced in a second pass when the first solution
/// violates it.
pub(crate) fn minimize(
    graph: &mut ConstraintGraph,
    group: usize,
    residual: &Vector,
    options: &ConstraintsOptions,
    settings: &NewtonSettings,
    epoch: &mut Epoch,
) -> SolverResult<usize> {
    let mut touched = BTreeSet::new();
    residual.collect_variables(&mut touched);
    let members = &graph.groups[group].variables;
    if touched.iter().any(|v| !members.contains(v)) {
        return Err(SolverError::Unimplemented("objective spanning several groups"));
    }

    let inequalities: Vec<ConstraintId> = graph.groups[group]
        .constraints
        .iter()
        .copied()
        .filter(|id| {
            let c = graph.constraints[id.0].as_equations();
            c.is_inequality() && c.equations(options) == 0
        })
        .collect();
    if inequalities.len() > 1 {
        return Err(SolverError::MultipleInequalities(inequalities.len()));
    }

    let mut iterations = quasi_newton(graph, group, residual, options, None, settings, epoch)?;
    if let Some(id) = inequalities.first() {
        let (violated, hint) = {
            let ctx = EvalContext::new(epoch.next(), &graph.variables);
            graph.constraints[id.0].as_equations().check_inequality(&ctx)
        };
        if violated {
            debug!(group, hint, "enforcing bound of {}", graph.constraints[id.0].as_equations().name());
            iterations += quasi_newton(graph, group, residual, options, Some((*id, hint)), settings, epoch)?;
        }
    }
    Ok(iterations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_bfgs_secant_condition() {
        let mut h = DMatrix::<f64>::identity(2, 2);
        let s = DVector::from_column_slice(&[1.0, 0.5]);
        let y = DVector::from_column_slice(&[2.0, 1.5]);
        bfgs_update(&mut h, &s, &y);
        let hs = &h * &s;
        assert_relative_eq!(hs[0], y[0], epsilon = 1e-12);
        assert_relative_eq!(hs[1], y[1], epsilon = 1e-12);
    }

    #[test]
    fn test_bfgs_skips_zero_step() {
        let mut h = DMatrix::<f64>::identity(2, 2);
        bfgs_update(&mut h, &DVector::zeros(2), &DVector::from_column_slice(&[1.0, 1.0]));
        assert_eq!(h, DMatrix::identity(2, 2));
    }

    #[test]
    fn test_bfgs_damping_keeps_positive_curvature() {
        let mut h = DMatrix::<f64>::identity(2, 2);
        let s = DVector::from_column_slice(&[1.0, 0.0]);
        let y = DVector::from_column_slice(&[-1.0, 0.0]);
        bfgs_update(&mut h, &s, &y);
        assert!(s.dot(&(&h * &s)) > 0.0);
    }
}
