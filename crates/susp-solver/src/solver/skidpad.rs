//! Staged static solve of a vehicle on a steady-state skidpad

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

use glam::DVec3;
use tracing::info;
use uuid::Uuid;

use susp_core::{Assembly, Controls};

use super::newton::NewtonSettings;
use super::{GraphMode, SolveOutcome, SolverCore};
use crate::autodiff::EvalContext;
use crate::builder::SkidpadModel;
use crate::config::{ConstraintsOptions, SkidpadConfig, SolverConfig};
use crate::error::SolverResult;
use crate::tire::TireFriction;
use crate::variable::VarId;

/// Forces acting on one element, for display
#[derive(Debug, Clone, PartialEq)]
pub struct ElementForces {
    pub element: Uuid,
    /// Joint force on each fixed point, in `fixed_points` order
    pub fixed_point_forces: Vec<DVec3>,
    /// Joint force on each point, in `points` order
    pub point_forces: Vec<DVec3>,
    /// Ground reaction on a tire
    pub contact_force: Option<DVec3>,
    pub centrifugal: DVec3,
    pub gravity: DVec3,
}

/// Static solve of positions, joint forces and yaw rate at constant speed
pub struct SkidpadSolver {
    core: SolverCore,
}

/// Options of the final stage, also the natural options for re-solves
pub fn skidpad_options() -> ConstraintsOptions {
    ConstraintsOptions {
        fix_linear_bushing: true,
        ..ConstraintsOptions::default()
    }
}

impl SkidpadSolver {
    /// Build and run the staged first solve with the configured tire model
    pub fn new(
        assembly: Assembly,
        controls: Controls,
        config: SolverConfig,
        skidpad: SkidpadConfig,
    ) -> SolverResult<Self> {
        let friction = skidpad.tire_model.friction();
        Self::with_tire_friction(assembly, controls, config, skidpad, friction)
    }

    /// Build and run the staged first solve with a custom friction law
    pub fn with_tire_friction(
        assembly: Assembly,
        controls: Controls,
        config: SolverConfig,
        skidpad: SkidpadConfig,
        friction: Rc<dyn TireFriction>,
    ) -> SolverResult<Self> {
        let mode = GraphMode::Skidpad {
            config: skidpad,
            friction,
        };
        let mut solver = Self {
            core: SolverCore::new(assembly, controls, config, mode)?,
        };
        solver.first_solve()?;
        Ok(solver)
    }

    pub fn skidpad_config(&self) -> Option<&SkidpadConfig> {
        match &self.core.mode {
            GraphMode::Skidpad { config, .. } => Some(config),
            GraphMode::Kinematics => None,
        }
    }

    /// Warm-started solve sequence:
    /// 1. positions only, springs rigid
    /// 2. force balance without tire friction (relaxed tolerance)
    /// 3. spring free lengths from the preload
    /// 4. tire friction
    /// 5. spring elasticity
    pub fn first_solve(&mut self) -> SolverResult<SolveOutcome> {
        let relaxed = self
            .skidpad_config()
            .map_or(self.core.config.tolerance, |c| c.relaxed_tolerance);
        self.core.guarded(|core| {
            let settings = NewtonSettings::from_config(&core.config);
            let positions = ConstraintsOptions {
                disable_spring_elasticity: true,
                fix_linear_bushing: true,
                disable_force: true,
                disable_tire_friction: true,
                ..ConstraintsOptions::default()
            };
            let frictionless = ConstraintsOptions {
                disable_force: false,
                ..positions
            };
            let friction = ConstraintsOptions {
                disable_tire_friction: false,
                ..frictionless
            };
            let elastic = ConstraintsOptions {
                disable_spring_elasticity: false,
                ..friction
            };

            info!("Skidpad stage 1: positions");
            let mut iterations = core.solve_groups(&positions, &settings)?.0;
            info!("Skidpad stage 2: forces without tire friction");
            iterations += core
                .solve_groups(&frictionless, &settings.with_tolerance(relaxed))?
                .0;
            info!("Skidpad stage 3: spring preload");
            set_preload(core);
            info!("Skidpad stage 4: tire friction");
            iterations += core.solve_groups(&friction, &settings)?.0;
            info!("Skidpad stage 5: spring elasticity");
            iterations += core.solve_groups(&elastic, &settings)?.0;
            Ok((iterations, core.graph.groups.len()))
        })
    }

    /// Derive every spring's free length from its current load
    pub fn set_preload(&mut self) {
        set_preload(&mut self.core);
    }

    /// Rebuild the graph and rerun the staged solve
    pub fn reconstruct(&mut self, assembly: Assembly) -> SolverResult<()> {
        self.core.reconstruct(assembly)?;
        self.first_solve().map(|_| ())
    }

    fn scalar(&self, select: impl Fn(&SkidpadModel) -> VarId) -> f64 {
        self.core
            .graph
            .skidpad
            .as_ref()
            .and_then(|model| self.core.graph.variables[select(model).0].as_scalar())
            .map_or(0.0, |s| s.value)
    }

    /// Steady-state yaw rate (rad/s)
    pub fn omega(&self) -> f64 {
        self.scalar(|m| m.omega)
    }

    /// Unbalanced longitudinal drive force (N)
    pub fn drive_error(&self) -> f64 {
        self.scalar(|m| m.error)
    }

    /// Force decomposition of every element
    pub fn element_forces(&self) -> Vec<ElementForces> {
        let graph = &self.core.graph;
        let Some(model) = &graph.skidpad else {
            return Vec::new();
        };
        let force_of = |var: VarId| {
            graph.variables[var.0]
                .as_point_force()
                .map_or(DVec3::ZERO, |f| f.force)
        };

        let mut node_forces: HashMap<Uuid, DVec3> = HashMap::new();
        for joint in &model.joint_forces {
            let force = force_of(joint.var);
            *node_forces.entry(joint.lhs).or_default() += force;
            *node_forces.entry(joint.rhs).or_default() -= force;
        }
        let contacts: HashMap<Uuid, DVec3> = model
            .contact_forces
            .iter()
            .map(|(var, tire)| (*tire, force_of(*var)))
            .collect();
        let omega = self.omega();

        self.core
            .assembly
            .elements
            .iter()
            .map(|element| {
                let at = |id: &Uuid| node_forces.get(id).copied().unwrap_or_default();
                ElementForces {
                    element: element.id,
                    fixed_point_forces: element.fixed_points.iter().map(|n| at(&n.id)).collect(),
                    point_forces: element.points.iter().map(|n| at(&n.id)).collect(),
                    contact_force: contacts.get(&element.id).copied(),
                    centrifugal: -model.lateral * (element.mass * model.velocity * omega),
                    gravity: model.gravity * element.mass,
                }
            })
            .collect()
    }
}

fn set_preload(core: &mut SolverCore) {
    let ctx = EvalContext::new(core.epoch.next(), &core.graph.variables);
    for constraint in &mut core.graph.constraints {
        constraint.set_preload(&ctx);
    }
}

impl Deref for SkidpadSolver {
    type Target = SolverCore;

    fn deref(&self) -> &SolverCore {
        &self.core
    }
}

impl DerefMut for SkidpadSolver {
    fn deref_mut(&mut self) -> &mut SolverCore {
        &mut self.core
    }
}
