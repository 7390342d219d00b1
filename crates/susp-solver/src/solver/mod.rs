//! Solvers over the constraint graph
//!
//! [`SolverCore`] owns the assembly, the graph built from it and the solve
//! bookkeeping (re-entrancy flag, first converged snapshot, rollback).
//! [`KinematicsSolver`] drives it with plain Newton-Raphson;
//! [`SkidpadSolver`] adds the staged static solve.

mod newton;
mod objective;
mod running;
mod skidpad;

use std::collections::{BTreeSet, HashMap};
use std::ops::{Deref, DerefMut};
use std::rc::Rc;
use std::sync::Arc;

use glam::DVec3;
use tracing::{info, warn};
use uuid::Uuid;

use susp_core::{Assembly, AssemblyError, Controls};

use crate::autodiff::{Epoch, EvalContext, Vector};
use crate::builder::{BuildMode, ConstraintGraph};
use crate::config::{ConstraintsOptions, SkidpadConfig, SolverConfig};
use crate::constraint::{ConstraintId, ConstraintState};
use crate::error::{SolverError, SolverResult};
use crate::snapshot::Snapshot;
use crate::tire::TireFriction;
use crate::variable::{BodyMode, VarId};

use newton::{NewtonSettings, assemble, newton_raphson};

pub use running::{RunningFlag, RunningGuard};
pub use skidpad::{ElementForces, SkidpadSolver, skidpad_options};

/// Result of a solve call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveOutcome {
    /// Every group converged; `iterations` is the total over all groups
    Converged { iterations: usize, groups: usize },
    /// Another solve was already running
    Skipped,
}

/// Summary of one group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub variables: Vec<VarId>,
    pub constraints: Vec<ConstraintId>,
    pub rows: usize,
    pub columns: usize,
}

/// What the graph is rebuilt for on reconstruction
pub(crate) enum GraphMode {
    Kinematics,
    Skidpad {
        config: SkidpadConfig,
        friction: Rc<dyn TireFriction>,
    },
}

impl GraphMode {
    fn build_mode(&self) -> BuildMode<'_> {
        match self {
            GraphMode::Kinematics => BuildMode::Kinematics,
            GraphMode::Skidpad { config, friction } => BuildMode::Skidpad {
                config,
                friction: Rc::clone(friction),
            },
        }
    }
}

/// Shared state and operations of all solvers
pub struct SolverCore {
    assembly: Assembly,
    controls: Controls,
    config: SolverConfig,
    mode: GraphMode,
    graph: ConstraintGraph,
    epoch: Epoch,
    running: Arc<RunningFlag>,
    first_snapshot: Option<Snapshot>,
}

impl SolverCore {
    pub(crate) fn new(
        assembly: Assembly,
        controls: Controls,
        config: SolverConfig,
        mode: GraphMode,
    ) -> SolverResult<Self> {
        let graph = ConstraintGraph::build(&assembly, &controls, &config, mode.build_mode())?;
        info!(
            "Built constraint graph for '{}': {} variables, {} constraints, {} groups",
            assembly.name,
            graph.variables.len(),
            graph.constraints.len(),
            graph.groups.len()
        );
        Ok(Self {
            assembly,
            controls,
            config,
            mode,
            graph,
            epoch: Epoch::default(),
            running: Arc::new(RunningFlag::new()),
            first_snapshot: None,
        })
    }

    pub fn assembly(&self) -> &Assembly {
        &self.assembly
    }

    pub fn controls(&self) -> &Controls {
        &self.controls
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn graph(&self) -> &ConstraintGraph {
        &self.graph
    }

    /// Shared handle on the re-entrancy flag
    pub fn running_flag(&self) -> Arc<RunningFlag> {
        Arc::clone(&self.running)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_running()
    }

    /// Block until the running solve (if any) has finished
    pub fn wait(&self) {
        self.running.wait_idle();
    }

    /// Solve every group with Newton-Raphson
    pub fn solve(&mut self, options: &ConstraintsOptions) -> SolverResult<SolveOutcome> {
        let settings = NewtonSettings::from_config(&self.config);
        self.guarded(|core| core.solve_groups(options, &settings))
    }

    /// Move the world position expressed by `residual` towards zero under
    /// the current constraints
    pub fn solve_objective_function(
        &mut self,
        residual: &Vector,
        options: &ConstraintsOptions,
    ) -> SolverResult<SolveOutcome> {
        let settings = NewtonSettings::from_config(&self.config).with_tolerance(self.config.objective_tolerance);
        let residual = residual.clone();
        self.guarded(|core| core.minimize(&residual, options, &settings))
    }

    /// Bring `node` as close to `target` as the constraints allow
    pub fn solve_target(
        &mut self,
        node: Uuid,
        target: DVec3,
        options: &ConstraintsOptions,
    ) -> SolverResult<SolveOutcome> {
        let point = self
            .graph
            .node_point(node)
            .ok_or(SolverError::Assembly(AssemblyError::NodeNotFound(node)))?;
        let residual = point.sub(&Vector::constant(target));
        self.solve_objective_function(&residual, options)
    }

    /// Run `body` under the re-entrancy guard; roll back on error, post
    /// process and record the first snapshot on success
    fn guarded(
        &mut self,
        body: impl FnOnce(&mut Self) -> SolverResult<(usize, usize)>,
    ) -> SolverResult<SolveOutcome> {
        let running = Arc::clone(&self.running);
        let Some(_guard) = running.try_begin() else {
            return Ok(SolveOutcome::Skipped);
        };
        match body(self) {
            Ok((iterations, groups)) => {
                self.post_process();
                if self.first_snapshot.is_none() {
                    self.first_snapshot = Some(self.get_snapshot());
                }
                info!("Solve converged: {} iterations over {} groups", iterations, groups);
                Ok(SolveOutcome::Converged { iterations, groups })
            }
            Err(e) => {
                warn!("Solve failed, rolling back: {}", e);
                self.rollback();
                Err(e)
            }
        }
    }

    pub(crate) fn solve_groups(
        &mut self,
        options: &ConstraintsOptions,
        settings: &NewtonSettings,
    ) -> SolverResult<(usize, usize)> {
        if options.fix_spring_dumpers_at_current_position {
            let ctx = EvalContext::new(self.epoch.next(), &self.graph.variables);
            for constraint in &mut self.graph.constraints {
                constraint.hold_current_length(&ctx);
            }
        }
        let mut iterations = 0;
        for group in 0..self.graph.groups.len() {
            iterations += newton_raphson(&mut self.graph, group, options, settings, &mut self.epoch)?;
        }
        Ok((iterations, self.graph.groups.len()))
    }

    fn minimize(
        &mut self,
        residual: &Vector,
        options: &ConstraintsOptions,
        settings: &NewtonSettings,
    ) -> SolverResult<(usize, usize)> {
        let mut touched = BTreeSet::new();
        residual.collect_variables(&mut touched);
        let group = touched
            .first()
            .and_then(|v| self.graph.group_of(*v))
            .ok_or_else(|| SolverError::NoDegreesOfFreedom("objective".into()))?;

        let saved = Snapshot::capture_group(&self.graph, group);
        match objective::minimize(&mut self.graph, group, residual, options, settings, &mut self.epoch) {
            Ok(iterations) => Ok((iterations, 1)),
            Err(e) => {
                if let Err(restore) = saved.restore(&mut self.graph) {
                    warn!("Could not restore group {} after failed objective solve: {}", group, restore);
                }
                Err(e)
            }
        }
    }

    /// Return every variable to the value last written to the assembly
    fn rollback(&mut self) {
        for variable in &mut self.graph.variables {
            variable.reset_to_applied();
        }
    }

    /// Solved world positions of every node
    pub fn node_positions(&mut self) -> HashMap<Uuid, DVec3> {
        let ctx = EvalContext::new(self.epoch.next(), &self.graph.variables);
        self.graph
            .node_points
            .iter()
            .map(|(node, expr)| {
                expr.reset(&ctx);
                (*node, expr.value())
            })
            .collect()
    }

    /// Write every variable back onto its element, then rebuild the poses of
    /// reduced and attached elements
    pub fn post_process(&mut self) {
        for variable in &mut self.graph.variables {
            if let Some(body) = variable.as_rigid_body() {
                if body.mode == BodyMode::Free {
                    if let Some(element) = self.assembly.element_mut(body.element) {
                        element.position = body.position;
                        element.rotation = body.quaternion;
                    }
                }
            }
            variable.mark_applied();
        }

        let nodes: HashMap<Uuid, DVec3> = {
            let ctx = EvalContext::new(self.epoch.next(), &self.graph.variables);
            self.graph
                .reduced_nodes
                .iter()
                .map(|(node, expr)| {
                    expr.reset(&ctx);
                    (*node, expr.value())
                })
                .collect()
        };
        for restorer in &self.graph.restorers {
            restorer.restore(&mut self.assembly, &self.graph.variables, &nodes);
        }
    }

    pub fn get_snapshot(&self) -> Snapshot {
        Snapshot::capture(&self.graph)
    }

    /// Restore a snapshot and write it back to the assembly
    pub fn restore_state(&mut self, snapshot: &Snapshot) -> SolverResult<()> {
        snapshot.restore(&mut self.graph)?;
        self.post_process();
        Ok(())
    }

    /// Return to the first converged configuration
    pub fn restore_initial_q(&mut self) -> SolverResult<()> {
        match self.first_snapshot.clone() {
            Some(snapshot) => self.restore_state(&snapshot),
            None => Ok(()),
        }
    }

    pub fn first_snapshot(&self) -> Option<&Snapshot> {
        self.first_snapshot.as_ref()
    }

    /// Rebuild the graph after a structural change of the assembly
    pub fn reconstruct(&mut self, assembly: Assembly) -> SolverResult<()> {
        let graph = ConstraintGraph::build(&assembly, &self.controls, &self.config, self.mode.build_mode())?;
        info!("Reconstructed constraint graph for '{}'", assembly.name);
        self.assembly = assembly;
        self.graph = graph;
        self.first_snapshot = None;
        Ok(())
    }

    /// Set the controlled offset of every constraint driven by `element`
    pub fn set_controlled_offset(&mut self, element: Uuid, dl: f64) -> SolverResult<()> {
        if self.assembly.element(element).is_none() {
            return Err(SolverError::UnknownElement(element));
        }
        for constraint in &mut self.graph.constraints {
            let equations = constraint.as_equations_mut();
            if equations.controller() == Some(element) {
                equations.set_controlled_offset(dl);
            }
        }
        if let Some(list) = self.controls.get_mut(element) {
            for control in list.iter_mut() {
                control.set_value(dl);
            }
        }
        Ok(())
    }

    /// Apply the values of a whole controls map
    pub fn apply_controls(&mut self, controls: &Controls) -> SolverResult<()> {
        let mut values: Vec<(Uuid, f64)> = controls.iter().map(|(id, c)| (id, c.value())).collect();
        values.sort_by_key(|(id, _)| *id);
        values.dedup_by_key(|(id, _)| *id);
        for (element, value) in values {
            self.set_controlled_offset(element, value)?;
        }
        Ok(())
    }

    /// Per-group variables, constraints and system size under `options`
    pub fn groups(&self, options: &ConstraintsOptions) -> Vec<GroupInfo> {
        self.graph
            .groups
            .iter()
            .enumerate()
            .map(|(i, g)| GroupInfo {
                variables: g.variables.clone(),
                constraints: g.constraints.clone(),
                rows: self.graph.group_rows(i, options),
                columns: g.degrees_of_freedom,
            })
            .collect()
    }

    /// Largest absolute residual of the active equations
    pub fn max_residual(&mut self, options: &ConstraintsOptions) -> f64 {
        let ctx = EvalContext::new(self.epoch.next(), &self.graph.variables);
        (0..self.graph.groups.len())
            .map(|g| assemble(&self.graph, g, options, &ctx, 0).0.amax())
            .fold(0.0, f64::max)
    }

    /// Value of every variable tied to an element's controlled offset
    pub fn controlled_offsets(&self, element: Uuid) -> Vec<f64> {
        self.graph
            .constraints
            .iter()
            .map(|c| c.as_equations())
            .filter(|c| c.controller() == Some(element))
            .filter_map(|c| match c.save_state() {
                ConstraintState::Offset { dl } => Some(dl),
                _ => None,
            })
            .collect()
    }
}

/// Position solver: Newton-Raphson over every group
pub struct KinematicsSolver {
    core: SolverCore,
}

impl KinematicsSolver {
    pub fn new(assembly: Assembly, controls: Controls, config: SolverConfig) -> SolverResult<Self> {
        Ok(Self {
            core: SolverCore::new(assembly, controls, config, GraphMode::Kinematics)?,
        })
    }

    /// Solver with default configuration and no controls
    pub fn from_assembly(assembly: Assembly) -> SolverResult<Self> {
        Self::new(assembly, Controls::new(), SolverConfig::default())
    }

    /// Hand the solved assembly back
    pub fn into_assembly(self) -> Assembly {
        self.core.assembly
    }
}

impl Deref for KinematicsSolver {
    type Target = SolverCore;

    fn deref(&self) -> &SolverCore {
        &self.core
    }
}

impl DerefMut for KinematicsSolver {
    fn deref_mut(&mut self) -> &mut SolverCore {
        &mut self.core
    }
}
