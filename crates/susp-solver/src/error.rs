//! Solver error types

use susp_core::AssemblyError;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while building or solving the constraint graph
#[derive(Debug, Clone, Error)]
pub enum SolverError {
    #[error("Assembly error: {0}")]
    Assembly(#[from] AssemblyError),

    #[error("Degenerate geometry in {element}: {reason}")]
    DegenerateGeometry { element: String, reason: String },

    #[error("Missing joint partner for node {node} of {element}")]
    MissingJointPartner { element: String, node: Uuid },

    #[error("Bearings of tire {0} attach to different movable components")]
    UnsupportedTireAxle(String),

    #[error("{count} joints between {lhs} and {rhs}, at most 2 are supported")]
    TooManyJoints {
        lhs: String,
        rhs: String,
        count: usize,
    },

    #[error("Constraint {0} demands equations but touches no degree of freedom")]
    NoDegreesOfFreedom(String),

    #[error("Element not found: {0}")]
    UnknownElement(Uuid),

    #[error("Solver diverged in group {group} at iteration {iteration} (norm {norm:e})")]
    Diverged {
        group: usize,
        iteration: usize,
        norm: f64,
    },

    #[error("Solver did not converge in group {group} after {iterations} iterations (norm {norm:e})")]
    NotConverged {
        group: usize,
        iterations: usize,
        norm: f64,
    },

    #[error("Singular system in group {0}")]
    SingularSystem(usize),

    #[error("{0} inequality constraints in one group, at most 1 is supported")]
    MultipleInequalities(usize),

    #[error("Not implemented: {0}")]
    Unimplemented(&'static str),

    #[error("Snapshot does not match the constraint graph: {0}")]
    SnapshotMismatch(String),
}

/// Result type for solver operations
pub type SolverResult<T> = Result<T, SolverError>;
