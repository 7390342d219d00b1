//! Assembly model for the suspension geometry solver
//!
//! This crate provides:
//! - Elements (rigid bodies, bars, springs, tires, linear bushings, A-arms,
//!   torsion springs) with named node points in element-local coordinates
//! - Joints pairing node points across elements
//! - Controls that drive offsets and point-to-plane targets
//! - Project files (RON) bundling an assembly with its controls

pub mod assembly;
pub mod constants;
pub mod controls;
pub mod project;

pub use assembly::{
    Assembly, AssemblyError, AssemblyResult, Element, ElementKind, Joint, NodePoint,
    SpringProperties,
};
pub use controls::{Control, Controls};
pub use project::{Project, ProjectError};
