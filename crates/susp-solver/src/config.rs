//! Solver configuration

use std::collections::HashMap;

use glam::DVec3;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use susp_core::constants::STANDARD_GRAVITY;

use crate::tire::TireModel;

/// Newton-Raphson / quasi-Newton parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Step norm below which a Newton-Raphson solve has converged
    pub tolerance: f64,
    /// Step and Lagrangian-gradient norm for objective solves
    pub objective_tolerance: f64,
    /// Maximum iterations per group
    pub max_iterations: usize,
    /// Abort when the step norm exceeds this multiple of the best norm
    pub divergence_factor: f64,
    /// Singular values below this fraction of the largest are dropped
    pub singular_value_ratio: f64,
    /// Keep every tire on the ground plane during kinematic solves
    pub ground_tires: bool,
    /// Ground plane offset along `ground_normal`
    pub ground_height: f64,
    /// Ground plane normal (points up)
    pub ground_normal: DVec3,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-4,
            objective_tolerance: 1e-3,
            max_iterations: 200,
            divergence_factor: 1000.0,
            singular_value_ratio: 1e-10,
            ground_tires: false,
            ground_height: 0.0,
            ground_normal: DVec3::Z,
        }
    }
}

/// Per-solve switches selecting which equations are active
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstraintsOptions {
    /// Springs behave as rigid links (or follow their spring law in skidpad)
    pub disable_spring_elasticity: bool,
    /// Linear bushing rod ends are held at their nominal offset
    pub fix_linear_bushing: bool,
    /// Spring/dampers keep their current length
    pub fix_spring_dumpers_at_current_position: bool,
    /// Force and moment balance equations are dropped
    pub disable_force: bool,
    /// Tires carry no lateral friction and yaw rate is pinned to zero
    pub disable_tire_friction: bool,
}

impl ConstraintsOptions {
    /// Options for a plain kinematic solve
    pub fn kinematics() -> Self {
        Self::default()
    }

    /// Builder: rigid springs
    pub fn with_disabled_spring_elasticity(mut self) -> Self {
        self.disable_spring_elasticity = true;
        self
    }

    /// Builder: fixed linear bushings
    pub fn with_fixed_linear_bushing(mut self) -> Self {
        self.fix_linear_bushing = true;
        self
    }
}

/// Steady-state cornering parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SkidpadConfig {
    /// Forward speed in m/s
    pub velocity: f64,
    /// Gravitational acceleration in m/s²
    pub gravity: DVec3,
    /// Share of the drive force per tire element; empty splits evenly
    pub torque_ratio: HashMap<Uuid, f64>,
    /// Step tolerance used while tire friction is disabled
    pub relaxed_tolerance: f64,
    /// Lateral friction model
    pub tire_model: TireModel,
}

impl Default for SkidpadConfig {
    fn default() -> Self {
        Self {
            velocity: 10.0,
            gravity: DVec3::new(0.0, 0.0, -STANDARD_GRAVITY),
            torque_ratio: HashMap::new(),
            relaxed_tolerance: 1e-2,
            tire_model: TireModel::default(),
        }
    }
}

impl SkidpadConfig {
    /// Torque ratio of a tire given the full tire list
    pub fn torque_ratio_of(&self, tire: Uuid, tires: &[Uuid]) -> f64 {
        if self.torque_ratio.is_empty() {
            if tires.is_empty() {
                0.0
            } else {
                1.0 / tires.len() as f64
            }
        } else {
            self.torque_ratio.get(&tire).copied().unwrap_or(0.0)
        }
    }
}
