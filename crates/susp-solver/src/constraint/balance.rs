//! Static force and moment balance used by the skidpad solve

use nalgebra::{DMatrix, DVector};
use uuid::Uuid;

use super::{ConstraintEquations, ConstraintState, leaves, write_scalar, write_vector};
use crate::autodiff::{EvalContext, Parameter, Scalar, Vector};
use crate::config::ConstraintsOptions;
use crate::error::{SolverError, SolverResult};
use crate::variable::VarId;

/// Which element a balance constraint belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceKind {
    RigidBody,
    Bar,
    SpringDamper,
    AArm,
    Tire,
    LinearBushing,
    TorsionSpring,
    /// Pins the yaw rate while tire friction is disabled
    YawRate,
}

/// Condition under which a residual is part of the system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Forces enabled
    Forces,
    /// Forces and spring elasticity enabled
    Elastic,
    /// Forces and tire friction enabled
    Friction,
    /// Forces enabled, tire friction disabled
    Frictionless,
    /// Forces enabled, linear bushing free to slide
    FreeBushing,
}

impl Gate {
    pub fn is_open(self, options: &ConstraintsOptions) -> bool {
        if options.disable_force {
            return false;
        }
        match self {
            Gate::Forces => true,
            Gate::Elastic => !options.disable_spring_elasticity,
            Gate::Friction => !options.disable_tire_friction,
            Gate::Frictionless => options.disable_tire_friction,
            Gate::FreeBushing => !options.fix_linear_bushing,
        }
    }
}

enum Residual {
    Scalar(Scalar),
    Vector(Vector),
}

impl Residual {
    fn rows(&self) -> usize {
        match self {
            Residual::Scalar(_) => 1,
            Residual::Vector(_) => 3,
        }
    }
}

/// Spring law `load = k (extension - free_extension)` with a preload-derived
/// free length
pub struct SpringLaw {
    /// Load carried by the spring (tension or torque)
    pub load: Scalar,
    /// Current length or twist angle
    pub extension: Scalar,
    pub spring_constant: f64,
    pub free_length: Parameter,
}

impl SpringLaw {
    /// Residual `load - k (extension - free_length)`
    pub fn residual(&self) -> Scalar {
        let stretch = self
            .extension
            .sub(&Scalar::parameter(&self.free_length));
        self.load.sub(&stretch.scale(self.spring_constant))
    }
}

/// ΣF = 0 and ΣM = 0 (plus kind-specific laws) for one element
pub struct ForceBalance {
    name: String,
    element: Uuid,
    kind: BalanceKind,
    residuals: Vec<(Residual, Gate)>,
    spring: Option<SpringLaw>,
    variables: Vec<VarId>,
}

impl ForceBalance {
    pub fn new(name: impl Into<String>, element: Uuid, kind: BalanceKind) -> Self {
        Self {
            name: name.into(),
            element,
            kind,
            residuals: Vec::new(),
            spring: None,
            variables: Vec::new(),
        }
    }

    /// Add a 3-row residual
    pub fn with_vector(mut self, residual: Vector, gate: Gate) -> Self {
        self.residuals.push((Residual::Vector(residual), gate));
        self.refresh_variables();
        self
    }

    /// Add a 1-row residual
    pub fn with_scalar(mut self, residual: Scalar, gate: Gate) -> Self {
        self.residuals.push((Residual::Scalar(residual), gate));
        self.refresh_variables();
        self
    }

    /// Add a spring law, active while elasticity is enabled
    pub fn with_spring(mut self, law: SpringLaw) -> Self {
        self.residuals
            .push((Residual::Scalar(law.residual()), Gate::Elastic));
        self.spring = Some(law);
        self.refresh_variables();
        self
    }

    pub fn element(&self) -> Uuid {
        self.element
    }

    pub fn kind(&self) -> BalanceKind {
        self.kind
    }

    /// Current free length of the spring law, if any
    pub fn free_length(&self) -> Option<f64> {
        self.spring.as_ref().map(|s| s.free_length.get())
    }

    /// Set the free length so that the current load is exactly the preload
    pub fn set_preload(&mut self, ctx: &EvalContext) {
        let Some(spring) = &self.spring else {
            return;
        };
        if spring.spring_constant == 0.0 {
            return;
        }
        spring.load.reset(ctx);
        spring.extension.reset(ctx);
        let free = spring.extension.value() - spring.load.value() / spring.spring_constant;
        spring.free_length.set(free);
    }

    fn refresh_variables(&mut self) {
        let vectors: Vec<&Vector> = self
            .residuals
            .iter()
            .filter_map(|(r, _)| match r {
                Residual::Vector(v) => Some(v),
                Residual::Scalar(_) => None,
            })
            .collect();
        let scalars: Vec<&Scalar> = self
            .residuals
            .iter()
            .filter_map(|(r, _)| match r {
                Residual::Scalar(s) => Some(s),
                Residual::Vector(_) => None,
            })
            .collect();
        self.variables = leaves(&vectors, &scalars);
    }
}

impl ConstraintEquations for ForceBalance {
    fn name(&self) -> &str {
        &self.name
    }

    fn relevant_variables(&self) -> &[VarId] {
        &self.variables
    }

    fn equations(&self, options: &ConstraintsOptions) -> usize {
        self.residuals
            .iter()
            .filter(|(_, gate)| gate.is_open(options))
            .map(|(r, _)| r.rows())
            .sum()
    }

    fn set_jacobian_and_constraints(
        &self,
        ctx: &EvalContext,
        phi: &mut DVector<f64>,
        phi_q: &mut DMatrix<f64>,
        row: usize,
        options: &ConstraintsOptions,
    ) {
        let mut row = row;
        for (residual, gate) in &self.residuals {
            if !gate.is_open(options) {
                continue;
            }
            match residual {
                Residual::Scalar(s) => write_scalar(s, ctx, phi, phi_q, row),
                Residual::Vector(v) => write_vector(v, ctx, phi, phi_q, row),
            }
            row += residual.rows();
        }
    }

    fn save_state(&self) -> ConstraintState {
        match &self.spring {
            Some(spring) => ConstraintState::FreeLength {
                free_length: spring.free_length.get(),
            },
            None => ConstraintState::Stateless,
        }
    }

    fn restore_state(&mut self, state: &ConstraintState) -> SolverResult<()> {
        match (&self.spring, state) {
            (Some(spring), ConstraintState::FreeLength { free_length }) => {
                spring.free_length.set(*free_length);
                Ok(())
            }
            (None, ConstraintState::Stateless) => Ok(()),
            (_, other) => Err(SolverError::SnapshotMismatch(format!(
                "balance {} cannot take {other:?}",
                self.name
            ))),
        }
    }
}
