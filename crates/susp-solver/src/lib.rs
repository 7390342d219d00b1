//! Multibody constraint solver for suspension geometry
//!
//! This crate provides:
//! - A reverse-mode computation graph over scalars, vectors and rotations
//! - Variables (rigid bodies, synthetic points, reaction forces, scalars)
//! - A catalog of geometric and static-balance constraints
//! - A graph builder reducing an assembly to independent groups
//! - Newton-Raphson, constrained quasi-Newton and staged skidpad solvers
//! - Closed-form pose restoration of reduced elements and state snapshots

pub mod autodiff;
pub mod builder;
pub mod config;
pub mod constraint;
pub mod error;
pub mod restorer;
pub mod snapshot;
pub mod solver;
pub mod tire;
pub mod union_find;
pub mod variable;

// Re-exports for convenience
pub use builder::{ConstraintGraph, Group};
pub use config::{ConstraintsOptions, SkidpadConfig, SolverConfig};
pub use constraint::{Constraint, ConstraintEquations, ConstraintId, ConstraintState};
pub use error::{SolverError, SolverResult};
pub use restorer::Restorer;
pub use snapshot::Snapshot;
pub use solver::{
    ElementForces, GroupInfo, KinematicsSolver, SkidpadSolver, SolveOutcome, SolverCore, skidpad_options,
};
pub use tire::{LinearTire, SimplifiedMagicFormula, TireFriction, TireModel};
pub use union_find::UnionFind;
pub use variable::{Variable, VariableState, VarId};
